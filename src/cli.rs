//! Command-line interface.
//!
//! Exactly one mode flag selects the operation; plain arguments without a
//! mode are source packages to rebuild. [`Args::config`] folds the
//! configuration files and the modifier flags into a [`BuildConfig`], and
//! [`run`] dispatches the selected [`Mode`] against a [`Buildroot`].

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use tracing::{Level, info};

use crate::build::{Buildroot, ScrubTarget};
use crate::config::{BuildConfig, DEFAULT_CONFIG_DIR, load_config_files};
use crate::error::{ConfigError, Error};
use crate::system::{BUILD_GROUP, InvokingUser, check_arch_combination, group_gid};

/// Chroot build-sandbox orchestrator for RPM package builds.
#[derive(Parser, Debug, Clone)]
#[command(name = "roto", version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
pub struct Args {
    /// Clean the root and install a fresh minimal buildroot
    #[arg(long, group = "mode")]
    pub init: bool,

    /// Completely remove the root
    #[arg(long, group = "mode")]
    pub clean: bool,

    /// Remove the root and/or cached data (comma separated)
    #[arg(long, group = "mode", value_delimiter = ',', value_name = "LIST")]
    pub scrub: Vec<ScrubTarget>,

    /// Rebuild the given source packages (the default mode)
    #[arg(long, group = "mode")]
    pub rebuild: bool,

    /// Build a source package from --spec and --sources
    #[arg(long, group = "mode")]
    pub buildsrpm: bool,

    /// Open a shell in the root, or run the arguments through it
    #[arg(long, group = "mode")]
    pub shell: bool,

    /// Run the arguments as a command in the root
    #[arg(long, group = "mode")]
    pub chroot: bool,

    /// Install the build dependencies of the given source packages
    #[arg(long, group = "mode")]
    pub installdeps: bool,

    /// Install packages into the root
    #[arg(long, group = "mode")]
    pub install: bool,

    /// Update every package in the root
    #[arg(long, group = "mode")]
    pub update: bool,

    /// Remove packages from the root
    #[arg(long, group = "mode")]
    pub remove: bool,

    /// Kill every process still running in the root
    #[arg(long, group = "mode")]
    pub orphanskill: bool,

    /// Copy host paths into the root; the last argument is the destination
    #[arg(long, group = "mode")]
    pub copyin: bool,

    /// Copy paths out of the root; the last argument is the destination
    #[arg(long, group = "mode")]
    pub copyout: bool,

    /// Print the path of the root and exit
    #[arg(long = "print-root-path", group = "mode")]
    pub print_root_path: bool,

    /// Spec file for --buildsrpm
    #[arg(long, value_name = "FILE")]
    pub spec: Option<PathBuf>,

    /// Sources (a tarball or a directory) for --buildsrpm
    #[arg(long, value_name = "PATH")]
    pub sources: Option<PathBuf>,

    /// Build from a source control checkout instead of --spec and --sources
    #[arg(long = "scm-enable")]
    pub scm_enable: bool,

    /// Set an SCM option, e.g. --scm-option package=foo
    #[arg(long = "scm-option", value_name = "KEY=VALUE", requires = "scm_enable")]
    pub scm_options: Vec<String>,

    /// Root configuration name
    #[arg(short, long, value_name = "NAME")]
    pub root: Option<String>,

    /// Where to put the results
    #[arg(long, value_name = "DIR")]
    pub resultdir: Option<PathBuf>,

    /// Suffix for the root name, for parallel builds of one config
    #[arg(long, value_name = "EXT")]
    pub uniqueext: Option<String>,

    /// Directory holding the configuration files
    #[arg(long, value_name = "DIR", default_value = DEFAULT_CONFIG_DIR)]
    pub configdir: PathBuf,

    /// Architecture of the root, used for the process personality
    #[arg(long, value_name = "ARCH")]
    pub arch: Option<String>,

    /// Target passed to rpmbuild
    #[arg(long, value_name = "ARCH")]
    pub target: Option<String>,

    /// Define an rpm macro, e.g. -D '_smp_mflags -j4'
    #[arg(short = 'D', long = "define", value_name = "'MACRO EXPR'")]
    pub defines: Vec<String>,

    /// Enable a configure option for the build
    #[arg(long = "with", value_name = "OPTION")]
    pub with: Vec<String>,

    /// Disable a configure option for the build
    #[arg(long = "without", value_name = "OPTION")]
    pub without: Vec<String>,

    /// Enable a plugin
    #[arg(long = "enable-plugin", value_name = "PLUGIN")]
    pub enable_plugins: Vec<String>,

    /// Disable a plugin
    #[arg(long = "disable-plugin", value_name = "PLUGIN")]
    pub disable_plugins: Vec<String>,

    /// Run --shell and --chroot commands as the build user
    #[arg(long)]
    pub unpriv: bool,

    /// Working directory inside the root for --shell and --chroot
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Kill rpmbuild after this many seconds
    #[arg(long = "rpmbuild_timeout", value_name = "SECONDS")]
    pub rpmbuild_timeout: Option<u64>,

    /// Use only the local package cache
    #[arg(long)]
    pub offline: bool,

    /// Do not clean the root before building
    #[arg(long = "no-clean")]
    pub no_clean: bool,

    /// Clean the root after the build
    #[arg(long = "cleanup-after", overrides_with = "no_cleanup_after")]
    pub cleanup_after: bool,

    /// Keep the root after the build
    #[arg(long = "no-cleanup-after")]
    pub no_cleanup_after: bool,

    /// Log function entry and exit
    #[arg(long)]
    pub trace: bool,

    /// Stay in the host mount namespace
    #[arg(long)]
    pub nounshare: bool,

    /// Verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Source packages, packages, commands or paths, depending on the mode
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    pub args: Vec<String>,
}

/// The operation selected on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Init,
    Clean,
    Scrub(Vec<ScrubTarget>),
    Rebuild(Vec<PathBuf>),
    /// Builds a source package from a checkout, then rebuilds it with the others.
    ScmRebuild(Vec<PathBuf>),
    Buildsrpm { spec: PathBuf, sources: PathBuf },
    ScmBuildsrpm,
    Shell(Option<String>),
    Chroot(Vec<String>),
    Installdeps(Vec<PathBuf>),
    Install(Vec<String>),
    Update,
    Remove(Vec<String>),
    Orphanskill,
    Copyin(Vec<PathBuf>),
    Copyout(Vec<PathBuf>),
    PrintRootPath,
}

impl Args {
    /// Returns the selected mode with its arguments.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingArgument` when `--buildsrpm` lacks
    /// `--spec` or `--sources` outside SCM mode.
    pub fn mode(&self) -> Result<Mode, ConfigError> {
        let paths = || self.args.iter().map(PathBuf::from).collect::<Vec<_>>();
        let mode = if self.init {
            Mode::Init
        } else if self.clean {
            Mode::Clean
        } else if !self.scrub.is_empty() {
            Mode::Scrub(self.scrub.clone())
        } else if self.buildsrpm && self.scm_enable {
            Mode::ScmBuildsrpm
        } else if self.buildsrpm {
            let spec = self
                .spec
                .clone()
                .ok_or_else(|| ConfigError::MissingArgument("--spec".to_string()))?;
            let sources = self
                .sources
                .clone()
                .ok_or_else(|| ConfigError::MissingArgument("--sources".to_string()))?;
            Mode::Buildsrpm { spec, sources }
        } else if self.shell {
            Mode::Shell((!self.args.is_empty()).then(|| self.args.join(" ")))
        } else if self.chroot {
            Mode::Chroot(self.args.clone())
        } else if self.installdeps {
            Mode::Installdeps(paths())
        } else if self.install {
            Mode::Install(self.args.clone())
        } else if self.update {
            Mode::Update
        } else if self.remove {
            Mode::Remove(self.args.clone())
        } else if self.orphanskill {
            Mode::Orphanskill
        } else if self.copyin {
            Mode::Copyin(paths())
        } else if self.copyout {
            Mode::Copyout(paths())
        } else if self.print_root_path {
            Mode::PrintRootPath
        } else if self.scm_enable {
            Mode::ScmRebuild(paths())
        } else {
            Mode::Rebuild(paths())
        };
        Ok(mode)
    }

    /// Maximum level to log at.
    #[must_use]
    pub fn log_level(&self) -> Level {
        if self.trace {
            Level::TRACE
        } else if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::WARN
        } else {
            Level::INFO
        }
    }

    /// Builds the configuration for `user` on a `host_arch` machine.
    ///
    /// Defaults are overlaid with the configuration files, then with the
    /// modifier flags.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable configuration files, bad macro
    /// definitions or SCM options, unknown plugins and targets the host
    /// cannot build.
    pub fn config(&self, user: &InvokingUser, host_arch: &str) -> Result<BuildConfig, ConfigError> {
        let mut config = BuildConfig::default()
            .with_unprivileged_user(user.uid, user.gid)
            .with_chroot_gid(group_gid(BUILD_GROUP).unwrap_or(0));
        if let Some(root) = &self.root {
            config = config.with_root(root.as_str());
        }
        load_config_files(&mut config, &self.configdir, self.root.is_some())?;

        if let Some(ext) = &self.uniqueext {
            config = config.with_unique_ext(ext.as_str());
        }
        if let Some(dir) = &self.resultdir {
            config = config.with_resultdir(dir);
        }
        if let Some(arch) = &self.arch {
            config = config.with_target_arch(arch.as_str());
        }
        if let Some(target) = &self.target {
            config = config.with_rpmbuild_arch(target.as_str());
        }
        for define in &self.defines {
            config = config.with_define(define)?;
        }
        for name in &self.with {
            config = config.with_bcond(name);
        }
        for name in &self.without {
            config = config.without_bcond(name);
        }
        for name in &self.enable_plugins {
            config.set_plugin_enabled(name, true)?;
        }
        for name in &self.disable_plugins {
            config.set_plugin_enabled(name, false)?;
        }
        if let Some(seconds) = self.rpmbuild_timeout {
            config = config.with_rpmbuild_timeout(Duration::from_secs(seconds));
        }
        if self.offline {
            config = config.offline();
        }
        if self.scm_enable {
            config = config.with_scm();
            for option in &self.scm_options {
                config = config.with_scm_option(option)?;
            }
        }
        if self.cleanup_after {
            config = config.with_cleanup(true, true);
        } else if self.no_cleanup_after {
            config = config.with_cleanup(false, false);
        }

        config.finalize();
        check_arch_combination(&config.target_arch, host_arch, &config.legal_host_arches)?;
        Ok(config)
    }
}

fn command_exit(code: i32) -> Result<(), Error> {
    match code {
        0 => Ok(()),
        code => Err(Error::CommandExit { code }),
    }
}

/// Runs `mode` against `root`.
///
/// A non-zero exit from a `--shell` or `--chroot` command is returned as
/// `Error::CommandExit` carrying that code.
///
/// # Errors
///
/// Returns the error of the failed operation.
pub fn run(mode: Mode, root: &mut Buildroot, args: &Args) -> Result<(), Error> {
    let cwd = args.cwd.as_deref();
    let clean_first = !args.no_clean;

    match mode {
        Mode::Init => {
            if clean_first {
                root.clean()?;
            }
            root.init()
        }
        Mode::Clean => root.clean(),
        Mode::Scrub(targets) => root.scrub(&targets),
        Mode::Rebuild(srpms) => root.rebuild(&srpms, clean_first).map(drop),
        Mode::ScmRebuild(mut srpms) => {
            srpms.push(root.scm_buildsrpm(clean_first)?);
            root.rebuild(&srpms, clean_first).map(drop)
        }
        Mode::Buildsrpm { spec, sources } => {
            let srpm = root.rebuild_spec(&spec, &sources, clean_first)?;
            info!(srpm = %srpm.display(), "Wrote source package");
            Ok(())
        }
        Mode::ScmBuildsrpm => {
            let srpm = root.scm_buildsrpm(clean_first)?;
            info!(srpm = %srpm.display(), "Wrote source package");
            Ok(())
        }
        Mode::Shell(command) => command_exit(root.shell(command.as_deref(), args.unpriv, cwd)?),
        Mode::Chroot(command) => command_exit(root.chroot(&command, args.unpriv, cwd)?),
        Mode::Installdeps(srpms) => root.installdeps(&srpms),
        Mode::Install(packages) => root.install(&packages),
        Mode::Update => root.update(),
        Mode::Remove(packages) => root.remove(&packages),
        Mode::Orphanskill => {
            let killed = root.orphanskill();
            info!(killed, "Orphan processes signalled");
            Ok(())
        }
        Mode::Copyin(paths) => root.copyin(&paths).map(drop),
        Mode::Copyout(paths) => root.copyout(&paths).map(drop),
        Mode::PrintRootPath => {
            println!("{}", root.root_path().display());
            Ok(())
        }
    }
}
