//! The build root and its pipeline.
//!
//! A [`Buildroot`] is the context for one invocation: configuration, paths,
//! privilege manager, held locks, mount ledger, hooks and state. Every
//! top-level operation is a method on it:
//!
//! - [`Buildroot::init`], [`Buildroot::clean`] and [`Buildroot::scrub`] manage
//!   the on-disk root
//! - [`Buildroot::rebuild`], [`Buildroot::build`] and [`Buildroot::buildsrpm`]
//!   drive rpmbuild, and [`Buildroot::scm_buildsrpm`] feeds it a checkout
//! - [`Buildroot::shell`], [`Buildroot::chroot`], the installer helpers and
//!   [`Buildroot::copyin`]/[`Buildroot::copyout`] serve interactive use
//!
//! # Example
//!
//! ```no_run
//! use roto_sandbox::build::Buildroot;
//! use roto_sandbox::config::BuildConfig;
//! use roto_sandbox::sandbox::PrivilegeManager;
//!
//! let config = BuildConfig::default().with_root("epel-6-x86_64");
//! let privs = PrivilegeManager::new(1000, 135);
//! let mut root = Buildroot::new(config, privs).unwrap();
//!
//! root.init().unwrap();
//! let rpms = root.build("foo-1.0-1.src.rpm".as_ref(), None).unwrap();
//! println!("{rpms:?}");
//! ```

mod installer;
mod interactive;
mod pipeline;
mod scm;
mod setup;
mod state;
mod tree;

pub use installer::{NO_PACKAGE_MARKER, check_installer_output, installer_argv};
pub use interactive::SHELL_PROMPT;
pub use pipeline::{collect_packages, locate_spec};
pub use scm::{ScmCheckout, ScmWorker, SpecTags, WRITE_TAR_MARKER, find_spec, parse_spec_tags};
pub use setup::{
    SKELETON_DIRS, SKELETON_FILES, ScrubTarget, create_build_dirs, enable_account,
    populate_root,
};
pub use state::{State, StateChange, StateLog};
pub use tree::{copy_host_file, copy_path, copy_tree, remove_tree, touch};

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::{BuildConfig, BuildrootPaths};
use crate::error::Error;
use crate::plugins::{HookEnv, HookRegistry, PluginSet, Stage};
use crate::sandbox::{
    ChrootCommand, CommandRunner, LockKind, LockTable, MountGuard, MountLedger, PrivilegeManager,
    SystemRunner, mount_all, setup_dev,
};
use crate::system::{KernelVersion, kernel_version, selinux_enabled};

/// Name of the state log in the result directory.
pub const STATE_LOG: &str = "state.log";

/// Name of the rpmbuild output log in the result directory.
pub const BUILD_LOG: &str = "build.log";

/// One build root and everything held on its behalf.
pub struct Buildroot {
    config: BuildConfig,
    paths: BuildrootPaths,
    privs: PrivilegeManager,
    locks: LockTable,
    lock_depth: usize,
    ledger: MountLedger,
    hooks: HookRegistry,
    plugins: PluginSet,
    /// Environment for every command, extended by plugins.
    env: BTreeMap<String, String>,
    runner: Box<dyn CommandRunner>,
    state: StateLog,
    kernel: KernelVersion,
    selinux: bool,
    was_cleaned: bool,
}

impl std::fmt::Debug for Buildroot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buildroot")
            .field("root", &self.config.root_name())
            .field("rootdir", &self.paths.rootdir)
            .field("state", &self.state.current())
            .field("locks", &self.locks)
            .field("plugins", &self.plugins)
            .field("privs", &self.privs)
            .finish_non_exhaustive()
    }
}

impl Buildroot {
    /// Creates the context for `config`.
    ///
    /// Plugins are instantiated and their mounts and hooks registered; nothing
    /// is created on disk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Plugin` if an enabled plugin is not implemented and
    /// `Error::System` if the kernel version cannot be read.
    pub fn new(config: BuildConfig, privs: PrivilegeManager) -> Result<Self, Error> {
        let paths = config.paths();
        let mut state = StateLog::new();

        state.set(State::InitPlugins);
        let plugins = PluginSet::from_config(&config)?;
        let mut ledger = MountLedger::new(&paths.rootdir);
        for spec in plugins.mounts(&paths) {
            ledger.push(spec);
        }
        let mut hooks = HookRegistry::new();
        plugins.register_all(&mut hooks);

        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), config.chroothome.clone());

        let mut root = Self {
            kernel: kernel_version()?,
            selinux: selinux_enabled(),
            config,
            paths,
            privs,
            locks: LockTable::new(),
            lock_depth: 0,
            ledger,
            hooks,
            plugins,
            env,
            runner: Box::new(SystemRunner),
            state,
            was_cleaned: false,
        };
        root.set_state(State::Start);
        debug!(?root, "Build root ready");
        Ok(root)
    }

    /// Replaces the command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    /// Overrides the detected kernel version.
    #[must_use]
    pub fn with_kernel(mut self, kernel: KernelVersion) -> Self {
        self.kernel = kernel;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    #[must_use]
    pub fn paths(&self) -> &BuildrootPaths {
        &self.paths
    }

    #[must_use]
    pub fn privileges(&self) -> &PrivilegeManager {
        &self.privs
    }

    #[must_use]
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    #[must_use]
    pub fn ledger(&self) -> &MountLedger {
        &self.ledger
    }

    #[must_use]
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    #[must_use]
    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    /// Environment passed to commands run for this root.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state.current()
    }

    /// Every state entered so far, oldest first.
    #[must_use]
    pub fn state_history(&self) -> Vec<State> {
        self.state.history()
    }

    /// True once the root has been removed during this invocation.
    #[must_use]
    pub fn was_cleaned(&self) -> bool {
        self.was_cleaned
    }

    /// Marks the invocation as finished.
    pub fn end(&mut self) {
        self.set_state(State::End);
    }

    fn set_state(&mut self, state: State) {
        self.state.set(state);
    }

    /// Starts appending state changes to the result directory, if it exists.
    fn reset_logging(&mut self) {
        if self.paths.resultdir.is_dir() {
            self.state.attach(self.paths.resultdir.join(STATE_LOG));
        }
    }

    fn chroot_user(&self) -> (u32, u32) {
        (self.config.chrootuid, self.config.chrootgid)
    }

    /// Runs the hooks of `stage`, returning how many failed.
    fn call_hooks(&mut self, stage: Stage) -> usize {
        let mut env = HookEnv {
            paths: &self.paths,
            locks: &mut self.locks,
            env: &mut self.env,
            runner: self.runner.as_ref(),
            chroot_user: (self.config.chrootuid, self.config.chrootgid),
        };
        let failures = self.hooks.call(stage, &mut env);
        if failures > 0 {
            warn!(%stage, failures, "Some hooks failed");
        }
        failures
    }

    fn lock_buildroot(&mut self) -> Result<(), Error> {
        if self.lock_depth > 0 {
            self.lock_depth += 1;
            return Ok(());
        }
        self.set_state(State::LockBuildroot);
        self.locks.acquire(LockKind::Buildroot, &self.paths.lock_file)?;
        self.lock_depth = 1;
        Ok(())
    }

    /// Releases the buildroot lock once the outermost holder is done.
    ///
    /// Removing the root releases the lock early; the state change is still
    /// recorded here.
    fn unlock_buildroot(&mut self) {
        match self.lock_depth {
            0 => return,
            1 => {}
            _ => {
                self.lock_depth -= 1;
                return;
            }
        }
        self.lock_depth = 0;
        self.set_state(State::UnlockBuildroot);
        self.locks.release(LockKind::Buildroot);
    }

    /// Runs `f` holding the buildroot lock.
    ///
    /// Nested calls share the outermost acquisition; the lock is released when
    /// the outermost call returns, whatever the outcome.
    fn with_buildroot_lock<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.lock_buildroot()?;
        let result = f(self);
        self.unlock_buildroot();
        result
    }

    /// Mounts the ledger; the guard unmounts again.
    fn mount(&self) -> Result<MountGuard, Error> {
        Ok(mount_all(&self.ledger, &self.paths.rootdir)?)
    }

    /// Rebuilds `/dev` when internal device setup is enabled.
    fn setup_dev(&mut self) -> Result<(), Error> {
        if self.config.internal_dev_setup {
            setup_dev(&self.paths.rootdir, &mut self.ledger, self.kernel)?;
        }
        Ok(())
    }

    /// A command run inside the root with this root's environment and personality.
    fn chroot_command<I, S>(&self, argv: I) -> ChrootCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = ChrootCommand::new(argv)
            .in_root(&self.paths.rootdir)
            .with_envs(self.env.iter());
        if self.config.internal_setarch {
            command.with_personality(&self.config.target_arch)
        } else {
            command
        }
    }
}

impl Drop for Buildroot {
    fn drop(&mut self) {
        let depth = self.privs.depth();
        if depth > 0 {
            warn!(depth, "Build root dropped with saved privileges, restoring");
            for _ in 0..depth {
                if let Err(e) = self.privs.restore() {
                    warn!(error = %e, "Failed to restore privileges");
                    break;
                }
            }
        }

        let held = self.locks.held();
        if !held.is_empty() {
            warn!(?held, "Build root dropped with locks held, releasing");
            self.locks.release_all();
        }
        info!(state = %self.state.current(), "Build root released");
    }
}
