//! On-disk layout of a build root.

use std::path::{Component, Path, PathBuf};

use super::BuildConfig;

/// Directories created under the build directory by init.
pub const BUILD_SUBDIRS: &[&str] = &[
    "RPMS",
    "SRPMS",
    "SOURCES",
    "SPECS",
    "BUILD",
    "BUILDROOT",
    "originals",
];

/// Paths for one build root.
///
/// ```text
/// {basedir}/{root}/
/// ├── root/             # sandbox root (chroot target)
/// │   └── builddir/build/{RPMS,SRPMS,SOURCES,SPECS,BUILD,BUILDROOT,originals}
/// ├── result/           # build artifacts and state.log
/// └── buildroot.lock
/// {cache_topdir}/{root}/
/// ├── ccache/
/// ├── yum_cache/        # yumcache.lock
/// └── root_cache/       # rootcache.lock, cache.tar.gz
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildrootPaths {
    /// Per-root base directory (`{basedir}/{root}`).
    pub basedir: PathBuf,
    /// Sandbox root.
    pub rootdir: PathBuf,
    /// Artifact directory.
    pub resultdir: PathBuf,
    /// Buildroot lock sentinel.
    pub lock_file: PathBuf,
    /// Per-root cache directory (`{cache_topdir}/{root}`).
    pub cachedir: PathBuf,
    pub ccache_dir: PathBuf,
    pub yum_cache_dir: PathBuf,
    pub root_cache_dir: PathBuf,
    pub yum_cache_lock: PathBuf,
    pub root_cache_lock: PathBuf,
    /// Build user's home as seen from inside the root (`/builddir`).
    pub chroot_home: PathBuf,
    /// rpm `%_topdir` as seen from inside the root (`/builddir/build`).
    pub chroot_builddir: PathBuf,
}

impl BuildrootPaths {
    /// Computes the paths for a configuration. Nothing is created on disk.
    #[must_use]
    pub fn new(config: &BuildConfig) -> Self {
        let name = config.root_name();
        let basedir = config.basedir.join(&name);
        let rootdir = basedir.join("root");
        let cachedir = config.cache_topdir.join(&name);
        let yum_cache_dir = cachedir.join("yum_cache");
        let root_cache_dir = cachedir.join("root_cache");
        let chroot_home = PathBuf::from(&config.chroothome);

        Self {
            resultdir: config
                .resultdir
                .clone()
                .unwrap_or_else(|| basedir.join("result")),
            lock_file: basedir.join("buildroot.lock"),
            ccache_dir: cachedir.join("ccache"),
            yum_cache_lock: yum_cache_dir.join("yumcache.lock"),
            root_cache_lock: root_cache_dir.join("rootcache.lock"),
            chroot_builddir: chroot_home.join("build"),
            chroot_home,
            yum_cache_dir,
            root_cache_dir,
            cachedir,
            rootdir,
            basedir,
        }
    }

    /// Maps an absolute path inside the sandbox to the host path.
    ///
    /// `..` components cannot climb above the root.
    #[must_use]
    pub fn in_root(&self, inner: impl AsRef<Path>) -> PathBuf {
        let mut out = self.rootdir.clone();
        let mut depth = 0usize;
        for component in inner.as_ref().components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    out.pop();
                    depth -= 1;
                }
                _ => {}
            }
        }
        out
    }

    /// Build user's home directory on the host side.
    #[must_use]
    pub fn homedir(&self) -> PathBuf {
        self.in_root(&self.chroot_home)
    }

    /// rpm `%_topdir` on the host side.
    #[must_use]
    pub fn builddir(&self) -> PathBuf {
        self.in_root(&self.chroot_builddir)
    }

    /// Temporary name the base directory is renamed to before removal.
    #[must_use]
    pub fn trash_dir(&self) -> PathBuf {
        let mut name = self.basedir.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Root cache tarball.
    #[must_use]
    pub fn root_cache_file(&self, extension: &str) -> PathBuf {
        self.root_cache_dir.join(format!("cache.tar{extension}"))
    }
}
