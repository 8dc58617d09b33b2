//! JSON configuration files.
//!
//! `<configdir>/site-defaults.json` is applied first, then `<configdir>/<root>.json`.
//! Every key is optional; unknown keys are rejected so typos surface early.
//!
//! ```json
//! {
//!   "target_arch": "i686",
//!   "legal_host_arches": ["i386", "i686", "x86_64"],
//!   "chroot_setup_cmd": ["install", "@buildsys-build"],
//!   "macros": { "%dist": ".el6" },
//!   "plugins": { "ccache": { "enabled": false } }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    BindMountOptions, BuildConfig, CcacheOptions, RootCacheOptions, ScmOptions, SelinuxOptions,
    TmpfsOptions, YumCacheOptions,
};
use crate::error::ConfigError;

/// Site-wide defaults file name.
pub const SITE_DEFAULTS: &str = "site-defaults.json";

/// Partial configuration read from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverlay {
    pub basedir: Option<PathBuf>,
    pub cache_topdir: Option<PathBuf>,
    pub resultdir: Option<PathBuf>,
    pub chroothome: Option<String>,
    pub chrootuser: Option<String>,
    pub chrootgroup: Option<String>,
    pub chrootgid: Option<u32>,
    pub target_arch: Option<String>,
    pub rpmbuild_arch: Option<String>,
    pub legal_host_arches: Option<Vec<String>>,
    /// Seconds; 0 disables the limit.
    pub rpmbuild_timeout: Option<u64>,
    pub online: Option<bool>,
    pub internal_dev_setup: Option<bool>,
    pub internal_setarch: Option<bool>,
    pub use_host_resolv: Option<bool>,
    pub cleanup_on_success: Option<bool>,
    pub cleanup_on_failure: Option<bool>,
    pub createrepo_on_rpms: Option<bool>,
    pub createrepo_command: Option<String>,
    pub yum_path: Option<PathBuf>,
    pub yum_builddep_path: Option<PathBuf>,
    pub chroot_setup_cmd: Option<Vec<String>>,
    pub yum_conf: Option<String>,
    pub macros: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    pub plugins: PluginOverlay,
    /// Replaces every SCM option; missing keys take their defaults.
    pub scm_opts: Option<ScmOptions>,
}

/// Partial plugin configuration; a present section replaces that plugin's options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginOverlay {
    pub tmpfs: Option<TmpfsOptions>,
    pub root_cache: Option<RootCacheOptions>,
    pub yum_cache: Option<YumCacheOptions>,
    pub bind_mount: Option<BindMountOptions>,
    pub ccache: Option<CcacheOptions>,
    pub selinux: Option<SelinuxOptions>,
}

impl ConfigOverlay {
    /// Reads an overlay from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadFile` or `ConfigError::ParseFile`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Applies every present key to `config`.
    pub fn apply(self, config: &mut BuildConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { config.$field = v; })*
            };
        }

        if let Some(home) = self.chroothome {
            config
                .macros
                .insert("%_topdir".to_string(), format!("{home}/build"));
            config.chroothome = home;
        }
        if let Some(v) = self.resultdir {
            config.resultdir = Some(v);
        }
        if let Some(v) = self.rpmbuild_arch {
            config.rpmbuild_arch = Some(v);
        }
        if let Some(secs) = self.rpmbuild_timeout {
            config.rpmbuild_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        set!(
            basedir,
            cache_topdir,
            chrootuser,
            chrootgroup,
            chrootgid,
            target_arch,
            legal_host_arches,
            online,
            internal_dev_setup,
            internal_setarch,
            use_host_resolv,
            cleanup_on_success,
            cleanup_on_failure,
            createrepo_on_rpms,
            createrepo_command,
            yum_path,
            yum_builddep_path,
            chroot_setup_cmd,
            yum_conf,
        );
        if let Some(v) = self.scm_opts {
            config.scm = v;
        }

        config.macros.extend(self.macros);
        config.files.extend(self.files);

        let plugins = self.plugins;
        let target = &mut config.plugins;
        if let Some(v) = plugins.tmpfs {
            target.tmpfs = v;
        }
        if let Some(v) = plugins.root_cache {
            target.root_cache = v;
        }
        if let Some(v) = plugins.yum_cache {
            target.yum_cache = v;
        }
        if let Some(v) = plugins.bind_mount {
            target.bind_mount = v;
        }
        if let Some(v) = plugins.ccache {
            target.ccache = v;
        }
        if let Some(v) = plugins.selinux {
            target.selinux = v;
        }
    }
}

/// Applies the site defaults and the per-root file from `config_dir`.
///
/// Missing files are skipped unless `require_root_file` is set, in which case
/// the per-root file must exist.
///
/// Returns the files that were applied.
///
/// # Errors
///
/// Returns `ConfigError` if a file exists but cannot be read or parsed, or the
/// required per-root file is missing.
#[instrument(skip(config), fields(config_dir = %config_dir.display()))]
pub fn load_config_files(
    config: &mut BuildConfig,
    config_dir: &Path,
    require_root_file: bool,
) -> Result<Vec<PathBuf>, ConfigError> {
    let mut applied = Vec::new();

    let site = config_dir.join(SITE_DEFAULTS);
    if site.exists() {
        ConfigOverlay::load(&site)?.apply(config);
        applied.push(site);
    }

    let per_root = config_dir.join(format!("{}.json", config.root));
    if per_root.exists() || require_root_file {
        ConfigOverlay::load(&per_root)?.apply(config);
        applied.push(per_root);
    }

    debug!(files = ?applied, "Applied configuration files");
    Ok(applied)
}
