//! Named build stages and the hook registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::{debug, trace, warn};

use crate::config::BuildrootPaths;
use crate::error::PluginError;
use crate::sandbox::{CommandRunner, LockTable};

/// Points in the build where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    EarlyPrebuild,
    Preinit,
    Postinit,
    Preyum,
    Postyum,
    Prebuild,
    Postbuild,
    Clean,
    InitFailed,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 9] = [
        Stage::EarlyPrebuild,
        Stage::Preinit,
        Stage::Postinit,
        Stage::Preyum,
        Stage::Postyum,
        Stage::Prebuild,
        Stage::Postbuild,
        Stage::Clean,
        Stage::InitFailed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EarlyPrebuild => "earlyprebuild",
            Self::Preinit => "preinit",
            Self::Postinit => "postinit",
            Self::Preyum => "preyum",
            Self::Postyum => "postyum",
            Self::Prebuild => "prebuild",
            Self::Postbuild => "postbuild",
            Self::Clean => "clean",
            Self::InitFailed => "initfailed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// What a hook action can see and change.
pub struct HookEnv<'a> {
    pub paths: &'a BuildrootPaths,
    pub locks: &'a mut LockTable,
    /// Environment added to every command run inside the root.
    pub env: &'a mut BTreeMap<String, String>,
    pub runner: &'a dyn CommandRunner,
    /// Build user `(uid, gid)`.
    pub chroot_user: (u32, u32),
}

impl fmt::Debug for HookEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEnv")
            .field("rootdir", &self.paths.rootdir)
            .field("locks", &self.locks)
            .field("env", &self.env)
            .field("chroot_user", &self.chroot_user)
            .finish_non_exhaustive()
    }
}

/// A hook action.
pub type HookAction = Box<dyn Fn(&mut HookEnv<'_>) -> Result<(), PluginError>>;

/// One registered hook.
pub struct Hook {
    pub plugin: &'static str,
    pub description: String,
    action: HookAction,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("plugin", &self.plugin)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Hooks by stage, each list in registration order.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<Stage, Vec<Hook>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` to run at `stage`.
    pub fn add<F>(&mut self, stage: Stage, plugin: &'static str, description: impl Into<String>, action: F)
    where
        F: Fn(&mut HookEnv<'_>) -> Result<(), PluginError> + 'static,
    {
        let description = description.into();
        trace!(%stage, plugin, %description, "Registering hook");
        self.hooks.entry(stage).or_default().push(Hook {
            plugin,
            description,
            action: Box::new(action),
        });
    }

    /// Runs every hook of `stage` in registration order.
    ///
    /// A failing hook is logged and does not stop the others. Returns the
    /// number of hooks that failed.
    pub fn call(&self, stage: Stage, env: &mut HookEnv<'_>) -> usize {
        let Some(hooks) = self.hooks.get(&stage) else {
            return 0;
        };

        debug!(%stage, count = hooks.len(), "Running hooks");
        let mut failures = 0;
        for hook in hooks {
            trace!(%stage, plugin = hook.plugin, description = %hook.description, "hook");
            if let Err(e) = (hook.action)(env) {
                warn!(%stage, plugin = hook.plugin, error = %e, "Hook failed");
                failures += 1;
            }
        }
        failures
    }

    /// Hooks registered for `stage`.
    #[must_use]
    pub fn hooks(&self, stage: Stage) -> &[Hook] {
        self.hooks.get(&stage).map_or(&[], Vec::as_slice)
    }

    /// Total number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
