//! Plugins and the stage hook system.
//!
//! A plugin contributes bind mounts to the mount ledger and registers hook
//! actions for named [`Stage`]s. Plugins are always instantiated in the fixed
//! [`PLUGIN_ORDER`]: tmpfs first because it mounts over the whole root,
//! root_cache next because it may repopulate the root, then the plugins that
//! create directories, and plugins without a `preinit` hook last.
//!
//! # Example
//!
//! ```
//! use roto_sandbox::config::BuildConfig;
//! use roto_sandbox::plugins::{HookRegistry, PluginSet, Stage};
//!
//! let config = BuildConfig::default();
//! let plugins = PluginSet::from_config(&config).unwrap();
//! let mut registry = HookRegistry::new();
//! plugins.register_all(&mut registry);
//!
//! assert_eq!(plugins.names(), ["root_cache", "yum_cache", "ccache"]);
//! assert!(!registry.hooks(Stage::Preyum).is_empty());
//! ```

mod ccache;
mod hooks;
mod root_cache;
mod unsupported;
mod yum_cache;

pub use ccache::Ccache;
pub use hooks::{Hook, HookAction, HookEnv, HookRegistry, Stage};
pub use root_cache::RootCache;
pub use unsupported::Unsupported;
pub use yum_cache::{YumCache, clean_stale_metadata};

use tracing::{debug, info};

use crate::config::{BuildConfig, BuildrootPaths, PLUGIN_ORDER};
use crate::error::{ConfigError, Error, PluginError};
use crate::sandbox::MountSpec;

/// A pluggable extension of the build root.
pub trait Plugin {
    /// Name as used in configuration and `--enable-plugin`.
    fn name(&self) -> &'static str;

    /// Mounts this plugin adds to the ledger.
    fn mounts(&self, _paths: &BuildrootPaths) -> Vec<MountSpec> {
        Vec::new()
    }

    /// Adds the plugin's hooks to `registry`.
    fn register(&self, registry: &mut HookRegistry);

    /// Fails if the plugin cannot run on this system.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::NotImplemented` for plugins without an implementation.
    fn ensure_supported(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// The enabled plugins, in dispatch order.
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginSet {
    /// Instantiates every enabled plugin.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::NotImplemented` if an enabled plugin has no
    /// implementation and `ConfigError::UnknownPlugin` if the order table names
    /// a plugin without options.
    pub fn from_config(config: &BuildConfig) -> Result<Self, Error> {
        let paths = config.paths();
        let options = &config.plugins;
        let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();

        for &name in PLUGIN_ORDER {
            if !options.is_enabled(name)? {
                continue;
            }
            let plugin: Box<dyn Plugin> = match name {
                "ccache" => Box::new(Ccache::new(options.ccache.clone(), &paths)),
                "yum_cache" => Box::new(YumCache::new(options.yum_cache.clone(), &paths)),
                "root_cache" => Box::new(RootCache::new(options.root_cache.clone(), &paths)),
                "tmpfs" | "bind_mount" | "selinux" => Box::new(Unsupported::new(name)),
                other => {
                    return Err(ConfigError::UnknownPlugin {
                        name: other.to_string(),
                    }
                    .into());
                }
            };
            plugin.ensure_supported()?;
            info!(plugin = name, "enabled");
            plugins.push(plugin);
        }

        debug!(plugins = ?plugins.iter().map(|p| p.name()).collect::<Vec<_>>(), "Plugins initialized");
        Ok(Self { plugins })
    }

    /// Names of the enabled plugins, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Registers the hooks of every plugin.
    pub fn register_all(&self, registry: &mut HookRegistry) {
        for plugin in &self.plugins {
            plugin.register(registry);
        }
    }

    /// Mounts contributed by every plugin, in order.
    #[must_use]
    pub fn mounts(&self, paths: &BuildrootPaths) -> Vec<MountSpec> {
        self.plugins.iter().flat_map(|p| p.mounts(paths)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
