//! Installer package cache shared between invocations.
//!
//! The cache directory is bind-mounted at `/var/cache/yum` inside the root.
//! Every installer run holds the yum-cache lock so two roots never write the
//! cache at once.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace};
use walkdir::WalkDir;

use super::{HookRegistry, Plugin, Stage};
use crate::config::{BuildrootPaths, YumCacheOptions};
use crate::error::PluginError;
use crate::sandbox::{LockKind, MountSpec};

const NAME: &str = "yum_cache";

/// Suffixes of repository metadata files.
const METADATA_SUFFIXES: &[&str] = &[
    ".sqlite",
    ".xml",
    ".bz2",
    ".gz",
    ".txt",
    ".solv",
    ".solvx",
    "cachecookie",
];

/// Cache directory inside the root.
pub const CHROOT_YUM_CACHE_DIR: &str = "/var/cache/yum";

#[derive(Debug, Clone)]
pub struct YumCache {
    options: YumCacheOptions,
    host_dir: PathBuf,
    lock_path: PathBuf,
}

impl YumCache {
    #[must_use]
    pub fn new(options: YumCacheOptions, paths: &BuildrootPaths) -> Self {
        Self {
            options,
            host_dir: paths.yum_cache_dir.clone(),
            lock_path: paths.yum_cache_lock.clone(),
        }
    }
}

impl Plugin for YumCache {
    fn name(&self) -> &'static str {
        NAME
    }

    fn mounts(&self, paths: &BuildrootPaths) -> Vec<MountSpec> {
        vec![MountSpec::bind(
            &self.host_dir,
            paths.in_root(CHROOT_YUM_CACHE_DIR),
        )]
    }

    fn register(&self, registry: &mut HookRegistry) {
        let lock_path = self.lock_path.clone();
        registry.add(Stage::Preyum, NAME, "acquire yumcache lock", move |env| {
            env.locks
                .acquire(LockKind::YumCache, &lock_path)
                .map_err(|e| PluginError::Hook {
                    plugin: NAME.to_string(),
                    reason: e.to_string(),
                })
        });

        registry.add(Stage::Postyum, NAME, "release yumcache lock", |env| {
            env.locks.release(LockKind::YumCache);
            Ok(())
        });

        let lock_path = self.lock_path.clone();
        let host_dir = self.host_dir.clone();
        let max_age = self.options.max_metadata_age_days;
        registry.add(Stage::Preinit, NAME, "cleaning yum metadata", move |env| {
            env.locks
                .acquire(LockKind::YumCache, &lock_path)
                .map_err(|e| PluginError::Hook {
                    plugin: NAME.to_string(),
                    reason: e.to_string(),
                })?;
            let result = clean_stale_metadata(&host_dir, max_age, SystemTime::now());
            env.locks.release(LockKind::YumCache);
            let removed = result?;
            if removed > 0 {
                info!(removed, "Removed stale yum metadata");
            }
            Ok(())
        });
    }
}

/// Removes repository metadata older than `max_age_days` below `dir`.
///
/// A missing directory is not an error. Returns the number of files removed.
///
/// # Errors
///
/// Returns `PluginError::Io` if a stale file cannot be removed.
pub fn clean_stale_metadata(
    dir: &Path,
    max_age_days: u32,
    now: SystemTime,
) -> Result<usize, PluginError> {
    if !dir.exists() {
        return Ok(0);
    }

    let now: DateTime<Utc> = now.into();
    let limit = chrono::Duration::days(i64::from(max_age_days));
    let mut removed = 0;

    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !METADATA_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        let modified: DateTime<Utc> = modified.into();
        if now.signed_duration_since(modified) <= limit {
            continue;
        }

        trace!(path = %entry.path().display(), "Removing stale metadata");
        std::fs::remove_file(entry.path()).map_err(|e| PluginError::Io {
            plugin: NAME.to_string(),
            context: format!("remove {}", entry.path().display()),
            source: e,
        })?;
        removed += 1;
    }

    debug!(dir = %dir.display(), removed, "Metadata cleanup complete");
    Ok(removed)
}
