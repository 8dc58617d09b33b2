//! Serializes root population across invocations sharing a cache.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{HookEnv, HookRegistry, Plugin, Stage};
use crate::config::{BuildrootPaths, RootCacheOptions};
use crate::error::PluginError;
use crate::sandbox::LockKind;

const NAME: &str = "root_cache";

/// Holds the root-cache lock from `preinit` until `postinit` (or `initfailed`).
#[derive(Debug, Clone)]
pub struct RootCache {
    options: RootCacheOptions,
    lock_path: PathBuf,
    cache_file: PathBuf,
}

impl RootCache {
    #[must_use]
    pub fn new(options: RootCacheOptions, paths: &BuildrootPaths) -> Self {
        let cache_file = paths.root_cache_file(&options.extension);
        Self {
            options,
            lock_path: paths.root_cache_lock.clone(),
            cache_file,
        }
    }

    /// Age in whole days of the cache tarball, if there is one.
    #[must_use]
    pub fn cache_age_days(&self, now: SystemTime) -> Option<i64> {
        let modified = fs::metadata(&self.cache_file).ok()?.modified().ok()?;
        let now: DateTime<Utc> = now.into();
        let modified: DateTime<Utc> = modified.into();
        Some(now.signed_duration_since(modified).num_days())
    }
}

fn release(env: &mut HookEnv<'_>) -> Result<(), PluginError> {
    env.locks.release(LockKind::RootCache);
    Ok(())
}

impl Plugin for RootCache {
    fn name(&self) -> &'static str {
        NAME
    }

    fn register(&self, registry: &mut HookRegistry) {
        let plugin = self.clone();
        registry.add(Stage::Preinit, NAME, "acquire rootcache lock", move |env| {
            env.locks
                .acquire(LockKind::RootCache, &plugin.lock_path)
                .map_err(|e| PluginError::Hook {
                    plugin: NAME.to_string(),
                    reason: e.to_string(),
                })?;

            match plugin.cache_age_days(SystemTime::now()) {
                Some(age) if age > i64::from(plugin.options.max_age_days) => {
                    warn!(
                        cache = %plugin.cache_file.display(),
                        age_days = age,
                        max_age_days = plugin.options.max_age_days,
                        "root cache is stale"
                    );
                }
                Some(age) => debug!(age_days = age, "root cache is current"),
                None => debug!(cache = %plugin.cache_file.display(), "no root cache"),
            }
            Ok(())
        });

        registry.add(Stage::Postinit, NAME, "release rootcache lock", release);
        registry.add(Stage::InitFailed, NAME, "release rootcache lock", release);
    }
}
