//! Per-plugin options.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Plugin names in dispatch order.
///
/// tmpfs mounts over the root so it goes first, root_cache may unpack the
/// root next, directory-creating plugins follow, and plugins without a
/// `preinit` hook come last.
pub const PLUGIN_ORDER: &[&str] = &[
    "tmpfs",
    "root_cache",
    "yum_cache",
    "bind_mount",
    "ccache",
    "selinux",
];

/// Options for every plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginOptions {
    pub tmpfs: TmpfsOptions,
    pub root_cache: RootCacheOptions,
    pub yum_cache: YumCacheOptions,
    pub bind_mount: BindMountOptions,
    pub ccache: CcacheOptions,
    pub selinux: SelinuxOptions,
}

impl PluginOptions {
    /// Returns whether the named plugin is enabled.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownPlugin` for unknown names.
    pub fn is_enabled(&self, name: &str) -> Result<bool, ConfigError> {
        Ok(match name {
            "tmpfs" => self.tmpfs.enabled,
            "root_cache" => self.root_cache.enabled,
            "yum_cache" => self.yum_cache.enabled,
            "bind_mount" => self.bind_mount.enabled,
            "ccache" => self.ccache.enabled,
            "selinux" => self.selinux.enabled,
            _ => {
                return Err(ConfigError::UnknownPlugin {
                    name: name.to_string(),
                });
            }
        })
    }

    /// Enables or disables the named plugin.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownPlugin` for unknown names.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), ConfigError> {
        let flag = match name {
            "tmpfs" => &mut self.tmpfs.enabled,
            "root_cache" => &mut self.root_cache.enabled,
            "yum_cache" => &mut self.yum_cache.enabled,
            "bind_mount" => &mut self.bind_mount.enabled,
            "ccache" => &mut self.ccache.enabled,
            "selinux" => &mut self.selinux.enabled,
            _ => {
                return Err(ConfigError::UnknownPlugin {
                    name: name.to_string(),
                });
            }
        };
        *flag = enabled;
        Ok(())
    }
}

/// Compiler cache shared across builds of the same root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcacheOptions {
    pub enabled: bool,
    /// Value passed to `ccache -M`.
    pub max_cache_size: String,
}

impl Default for CcacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_size: String::from("4G"),
        }
    }
}

/// Installer package cache shared across roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YumCacheOptions {
    pub enabled: bool,
    pub max_age_days: u32,
    /// Repository metadata older than this is removed on init.
    pub max_metadata_age_days: u32,
    pub online: bool,
}

impl Default for YumCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: 30,
            max_metadata_age_days: 30,
            online: true,
        }
    }
}

/// Tarball cache of a freshly initialized root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootCacheOptions {
    pub enabled: bool,
    pub max_age_days: u32,
    pub compress_program: String,
    pub extension: String,
}

impl Default for RootCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: 15,
            compress_program: String::from("pigz"),
            extension: String::from(".gz"),
        }
    }
}

/// Extra host directories bind-mounted into the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindMountOptions {
    pub enabled: bool,
    /// `(host path, path inside the root)` pairs.
    pub dirs: Vec<(String, String)>,
}

/// tmpfs mounted over the whole root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmpfsOptions {
    pub enabled: bool,
    pub required_ram_mb: u64,
    pub max_fs_size: Option<String>,
}

impl Default for TmpfsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            required_ram_mb: 900,
            max_fs_size: None,
        }
    }
}

/// SELinux label handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelinuxOptions {
    pub enabled: bool,
}
