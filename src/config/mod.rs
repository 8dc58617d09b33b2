//! Build configuration.
//!
//! A [`BuildConfig`] starts from built-in defaults, is overlaid with JSON
//! configuration files (see [`ConfigOverlay`]) and finally with command-line
//! flags. Once a [`crate::build::Buildroot`] is constructed from it the
//! configuration is immutable.
//!
//! # Example
//!
//! ```
//! use roto_sandbox::config::BuildConfig;
//!
//! let config = BuildConfig::default()
//!     .with_root("fedora-rawhide-x86_64")
//!     .with_unique_ext("ci")
//!     .with_target_arch("x86_64")
//!     .offline();
//!
//! assert_eq!(config.root_name(), "fedora-rawhide-x86_64-ci");
//! ```

mod file;
mod paths;
mod plugins;
mod scm;

pub use file::{ConfigOverlay, PluginOverlay, SITE_DEFAULTS, load_config_files};
pub use paths::{BUILD_SUBDIRS, BuildrootPaths};
pub use plugins::{
    BindMountOptions, CcacheOptions, PLUGIN_ORDER, PluginOptions, RootCacheOptions,
    SelinuxOptions, TmpfsOptions, YumCacheOptions,
};
pub use scm::{SCM_BRANCH, SCM_PACKAGE, ScmOptions};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Name used for paths, logs and default directories.
pub const PROGRAM_NAME: &str = "roto";

/// Default configuration directory.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/roto";

/// Default `etc/hosts` used when the host resolver files are not copied.
pub const DEFAULT_HOSTS: &str = "\
127.0.0.1 localhost localhost.localdomain
::1       localhost localhost.localdomain localhost6 localhost6.localdomain6
";

/// Default `yum.conf` written into every new root.
pub const DEFAULT_YUM_CONF: &str = "\
[main]
cachedir=/var/cache/yum
debuglevel=1
reposdir=/dev/null
logfile=/var/log/yum.log
retries=20
obsoletes=1
gpgcheck=0
assumeyes=1
syslog_ident=roto
syslog_device=

# repos
[base]
name=BaseOS
enabled=1
baseurl=http://www.gtlib.gatech.edu/pub/scientific/6.0/x86_64/os/
failovermethod=priority

[updates-fastbugs]
name=updates-fastbugs
enabled=1
baseurl=http://www.gtlib.gatech.edu/pub/scientific/6.0/x86_64/updates/fastbugs/
failovermethod=priority

[updates-security]
name=updates-security
enabled=1
baseurl=http://www.gtlib.gatech.edu/pub/scientific/6.0/x86_64/updates/security/
failovermethod=priority
";

/// Configuration for one build root.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Configured root name, before `unique_ext` is applied.
    pub root: String,
    /// Suffix appended to the root name so parallel builds get separate roots.
    pub unique_ext: Option<String>,
    /// Parent of all per-root directories.
    pub basedir: PathBuf,
    /// Parent of all per-root cache directories.
    pub cache_topdir: PathBuf,
    /// Result directory override; defaults to `<basedir>/<root>/result`.
    pub resultdir: Option<PathBuf>,
    /// Build user's home directory inside the root.
    pub chroothome: String,
    pub chrootuser: String,
    pub chrootgroup: String,
    pub chrootuid: u32,
    pub chrootgid: u32,
    /// Invoking (unprivileged) user ids.
    pub unpriv_uid: u32,
    pub unpriv_gid: u32,
    pub target_arch: String,
    /// Architecture passed to `rpmbuild --target`; defaults to `target_arch`.
    pub rpmbuild_arch: Option<String>,
    /// Hosts allowed to build for this root; empty allows all.
    pub legal_host_arches: Vec<String>,
    /// Time limit for `rpmbuild -bb`; `None` means no limit.
    pub rpmbuild_timeout: Option<Duration>,
    pub online: bool,
    pub internal_dev_setup: bool,
    pub internal_setarch: bool,
    pub use_host_resolv: bool,
    pub cleanup_on_success: bool,
    pub cleanup_on_failure: bool,
    pub createrepo_on_rpms: bool,
    pub createrepo_command: String,
    pub yum_path: PathBuf,
    pub yum_builddep_path: PathBuf,
    /// Installer arguments run after a fresh root is created.
    pub chroot_setup_cmd: Vec<String>,
    pub yum_conf: String,
    /// rpm macros written to `.rpmmacros`, keyed by `%name`.
    pub macros: BTreeMap<String, String>,
    /// Extra files written into the root, keyed by root-relative path.
    pub files: BTreeMap<String, String>,
    pub plugins: PluginOptions,
    /// Sources come from a source control checkout instead of the command line.
    pub scm_enabled: bool,
    pub scm: ScmOptions,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let chroothome = String::from("/builddir");
        let mut macros = BTreeMap::new();
        macros.insert("%_topdir".to_string(), format!("{chroothome}/build"));
        macros.insert(
            "%_rpmfilename".to_string(),
            "%%{NAME}-%%{VERSION}-%%{RELEASE}.%%{ARCH}.rpm".to_string(),
        );

        Self {
            root: String::from("default"),
            unique_ext: None,
            basedir: PathBuf::from(format!("/var/lib/{PROGRAM_NAME}")),
            cache_topdir: PathBuf::from(format!("/var/cache/{PROGRAM_NAME}")),
            resultdir: None,
            chroothome,
            chrootuser: String::from("mockbuild"),
            chrootgroup: String::from("mockbuild"),
            chrootuid: 0,
            chrootgid: 0,
            unpriv_uid: 0,
            unpriv_gid: 0,
            target_arch: String::from(std::env::consts::ARCH),
            rpmbuild_arch: None,
            legal_host_arches: Vec::new(),
            rpmbuild_timeout: None,
            online: true,
            internal_dev_setup: true,
            internal_setarch: true,
            use_host_resolv: true,
            cleanup_on_success: true,
            cleanup_on_failure: true,
            createrepo_on_rpms: false,
            createrepo_command: String::from("/usr/bin/createrepo -d -q -x *.src.rpm"),
            yum_path: PathBuf::from("/usr/bin/yum"),
            yum_builddep_path: PathBuf::from("/usr/bin/yum-builddep"),
            chroot_setup_cmd: vec!["groupinstall".to_string(), "buildsys-build".to_string()],
            yum_conf: DEFAULT_YUM_CONF.to_string(),
            macros,
            files: BTreeMap::new(),
            plugins: PluginOptions::default(),
            scm_enabled: false,
            scm: ScmOptions::default(),
        }
    }
}

impl BuildConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root name including the unique extension, used for every per-root path.
    #[must_use]
    pub fn root_name(&self) -> String {
        match &self.unique_ext {
            Some(ext) if !ext.is_empty() => format!("{}-{}", self.root, ext),
            _ => self.root.clone(),
        }
    }

    /// Architecture handed to rpmbuild.
    #[must_use]
    pub fn rpmbuild_arch(&self) -> &str {
        self.rpmbuild_arch.as_deref().unwrap_or(&self.target_arch)
    }

    /// Computes the on-disk layout for this configuration.
    #[must_use]
    pub fn paths(&self) -> BuildrootPaths {
        BuildrootPaths::new(self)
    }

    /// Sets the root name.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the unique extension.
    #[must_use]
    pub fn with_unique_ext(mut self, ext: impl Into<String>) -> Self {
        self.unique_ext = Some(ext.into());
        self
    }

    /// Sets the parent of all per-root directories.
    #[must_use]
    pub fn with_basedir(mut self, path: impl Into<PathBuf>) -> Self {
        self.basedir = path.into();
        self
    }

    /// Sets the parent of all cache directories.
    #[must_use]
    pub fn with_cache_topdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_topdir = path.into();
        self
    }

    /// Sets an explicit result directory.
    #[must_use]
    pub fn with_resultdir(mut self, path: impl Into<PathBuf>) -> Self {
        self.resultdir = Some(path.into());
        self
    }

    /// Sets the unprivileged user.
    ///
    /// The build user inside the root shares its uid.
    #[must_use]
    pub fn with_unprivileged_user(mut self, uid: u32, gid: u32) -> Self {
        self.unpriv_uid = uid;
        self.unpriv_gid = gid;
        self.chrootuid = uid;
        self
    }

    /// Sets the build group id inside the root.
    #[must_use]
    pub fn with_chroot_gid(mut self, gid: u32) -> Self {
        self.chrootgid = gid;
        self
    }

    /// Sets the target architecture.
    #[must_use]
    pub fn with_target_arch(mut self, arch: impl Into<String>) -> Self {
        self.target_arch = arch.into();
        self
    }

    /// Sets the architecture passed to rpmbuild.
    #[must_use]
    pub fn with_rpmbuild_arch(mut self, arch: impl Into<String>) -> Self {
        self.rpmbuild_arch = Some(arch.into());
        self
    }

    /// Sets the rpmbuild time limit; zero disables it.
    #[must_use]
    pub fn with_rpmbuild_timeout(mut self, timeout: Duration) -> Self {
        self.rpmbuild_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Runs the installer from its cache only.
    #[must_use]
    pub fn offline(mut self) -> Self {
        self.online = false;
        self.plugins.yum_cache.online = false;
        self
    }

    /// Sets both cleanup policies.
    #[must_use]
    pub fn with_cleanup(mut self, on_success: bool, on_failure: bool) -> Self {
        self.cleanup_on_success = on_success;
        self.cleanup_on_failure = on_failure;
        self
    }

    /// Adds a `-D 'NAME EXPR'` style macro definition.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidDefine` if there is no expression.
    pub fn with_define(mut self, define: &str) -> Result<Self, ConfigError> {
        let (name, expr) = parse_define(define)?;
        self.macros.insert(name, expr);
        Ok(self)
    }

    /// Adds the macro rpmbuild uses for `--with NAME`.
    #[must_use]
    pub fn with_bcond(mut self, name: &str) -> Self {
        let (key, value) = bcond_macro("with", name);
        self.macros.insert(key, value);
        self
    }

    /// Adds the macro rpmbuild uses for `--without NAME`.
    #[must_use]
    pub fn without_bcond(mut self, name: &str) -> Self {
        let (key, value) = bcond_macro("without", name);
        self.macros.insert(key, value);
        self
    }

    /// Adds a file written into the root during init.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Builds from a source control checkout.
    #[must_use]
    pub fn with_scm(mut self) -> Self {
        self.scm_enabled = true;
        self
    }

    /// Applies an `--scm-option KEY=VALUE` setting.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::BadScmOption` for malformed options.
    pub fn with_scm_option(mut self, option: &str) -> Result<Self, ConfigError> {
        self.scm.set_option(option)?;
        Ok(self)
    }

    /// Enables or disables a plugin by name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownPlugin` for names outside the plugin table.
    pub fn set_plugin_enabled(&mut self, name: &str, enabled: bool) -> Result<(), ConfigError> {
        self.plugins.set_enabled(name, enabled)
    }

    /// Applies the settings that depend on other settings.
    ///
    /// Cleanup is forced off when the result directory lives inside the root,
    /// and a default `etc/hosts` is added when the host's is not copied.
    pub fn finalize(&mut self) {
        let paths = self.paths();
        if paths.resultdir.starts_with(&paths.rootdir) {
            self.cleanup_on_success = false;
            self.cleanup_on_failure = false;
        }
        if !self.use_host_resolv && !self.files.contains_key("etc/hosts") {
            self.files
                .insert("etc/hosts".to_string(), DEFAULT_HOSTS.to_string());
        }
    }

    /// Renders the `.rpmmacros` file.
    #[must_use]
    pub fn rpmmacros(&self) -> String {
        self.macros
            .iter()
            .map(|(k, v)| format!("{k} {v}\n"))
            .collect()
    }
}

/// Splits `NAME EXPR` on the first whitespace, prefixing `%` when missing.
fn parse_define(define: &str) -> Result<(String, String), ConfigError> {
    let invalid = || ConfigError::InvalidDefine {
        value: define.to_string(),
    };
    let (name, expr) = define.trim().split_once(char::is_whitespace).ok_or_else(invalid)?;
    let expr = expr.trim();
    if name.is_empty() || expr.is_empty() {
        return Err(invalid());
    }
    let name = if name.starts_with('%') {
        name.to_string()
    } else {
        format!("%{name}")
    };
    Ok((name, expr.to_string()))
}

fn bcond_macro(kind: &str, name: &str) -> (String, String) {
    (
        format!("%_{kind}_{}", name.replace('-', "_")),
        format!("--{kind}-{name}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert_eq!(config.root, "default");
        assert_eq!(config.basedir, PathBuf::from("/var/lib/roto"));
        assert_eq!(config.cache_topdir, PathBuf::from("/var/cache/roto"));
        assert_eq!(config.chroothome, "/builddir");
        assert_eq!(config.chrootuser, "mockbuild");
        assert!(config.online);
        assert!(config.cleanup_on_success && config.cleanup_on_failure);
        assert!(config.rpmbuild_timeout.is_none());
        assert_eq!(config.chroot_setup_cmd, vec!["groupinstall", "buildsys-build"]);
        assert_eq!(
            config.macros.get("%_topdir").map(String::as_str),
            Some("/builddir/build")
        );
    }

    #[test]
    fn test_unique_ext_changes_root_name() {
        let config = BuildConfig::new().with_root("epel-6").with_unique_ext("42");
        assert_eq!(config.root_name(), "epel-6-42");
        assert!(config.paths().basedir.ends_with("epel-6-42"));
    }

    #[test]
    fn test_rpmbuild_arch_defaults_to_target() {
        let config = BuildConfig::new().with_target_arch("i686");
        assert_eq!(config.rpmbuild_arch(), "i686");
        let config = config.with_rpmbuild_arch("i586");
        assert_eq!(config.rpmbuild_arch(), "i586");
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let config = BuildConfig::new().with_rpmbuild_timeout(Duration::ZERO);
        assert!(config.rpmbuild_timeout.is_none());
        let config = config.with_rpmbuild_timeout(Duration::from_secs(60));
        assert_eq!(config.rpmbuild_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_define_prefixes_percent() {
        let config = BuildConfig::new()
            .with_define("_smp_mflags -j4")
            .expect("valid define")
            .with_define("%dist .el6")
            .expect("valid define");
        assert_eq!(config.macros.get("%_smp_mflags").map(String::as_str), Some("-j4"));
        assert_eq!(config.macros.get("%dist").map(String::as_str), Some(".el6"));
    }

    #[test]
    fn test_define_without_expression_rejected() {
        let result = BuildConfig::new().with_define("lonely");
        assert!(matches!(result, Err(ConfigError::InvalidDefine { .. })));
    }

    #[test]
    fn test_with_and_without_macros() {
        let config = BuildConfig::new().with_bcond("foo-bar").without_bcond("docs");
        assert_eq!(
            config.macros.get("%_with_foo_bar").map(String::as_str),
            Some("--with-foo-bar")
        );
        assert_eq!(
            config.macros.get("%_without_docs").map(String::as_str),
            Some("--without-docs")
        );
    }

    #[test]
    fn test_resultdir_inside_root_disables_cleanup() {
        let mut config = BuildConfig::new()
            .with_basedir("/srv/roto")
            .with_resultdir("/srv/roto/default/root/out");
        config.finalize();
        assert!(!config.cleanup_on_success);
        assert!(!config.cleanup_on_failure);

        let mut config = BuildConfig::new()
            .with_basedir("/srv/roto")
            .with_resultdir("/home/user/results");
        config.finalize();
        assert!(config.cleanup_on_success);
    }

    #[test]
    fn test_default_hosts_without_host_resolv() {
        let mut config = BuildConfig::new();
        config.use_host_resolv = false;
        config.finalize();
        assert_eq!(
            config.files.get("etc/hosts").map(String::as_str),
            Some(DEFAULT_HOSTS)
        );
    }

    #[test]
    fn test_rpmmacros_rendering() {
        let text = BuildConfig::new().rpmmacros();
        assert!(text.contains("%_topdir /builddir/build\n"));
        assert!(text.contains("%_rpmfilename %%{NAME}-%%{VERSION}-%%{RELEASE}.%%{ARCH}.rpm\n"));
    }
}
