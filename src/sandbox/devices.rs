//! Minimal `/dev` inside the build root.
//!
//! The directory is rebuilt from scratch on every setup: the old tree is
//! removed, a fixed set of character devices is created and the usual
//! `/proc/self/fd` symlinks are added. When the host has the same device its
//! mode, owner and device number are copied so the root matches the host.
//!
//! devpts and `/dev/shm` are not mounted here; their ledger entries are
//! appended to the [`MountLedger`] and mounted with everything else.

use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, symlink};
use std::path::Path;

use nix::sys::stat::{Mode, SFlag, makedev, mknod, stat, umask};
use nix::unistd::{Gid, Group, Uid, User, chown};
use tracing::{debug, instrument, trace};

use super::mounts::MountLedger;
use crate::error::DeviceError;
use crate::system::{DEV_FD_KERNEL, DEVPTS_NEWINSTANCE_KERNEL, KernelVersion, group_gid};

/// A device node created in the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    /// Path relative to the root.
    pub path: &'static str,
    /// Permission bits.
    pub mode: u32,
    pub major: u64,
    pub minor: u64,
    pub owner: Option<&'static str>,
    pub group: Option<&'static str>,
}

const fn node(path: &'static str, mode: u32, major: u64, minor: u64) -> DeviceNode {
    DeviceNode {
        path,
        mode,
        major,
        minor,
        owner: None,
        group: None,
    }
}

const fn tty_node(path: &'static str, mode: u32, major: u64, minor: u64) -> DeviceNode {
    DeviceNode {
        path,
        mode,
        major,
        minor,
        owner: Some("root"),
        group: Some("tty"),
    }
}

/// Character devices created in every root.
pub const DEVICE_NODES: &[DeviceNode] = &[
    node("dev/null", 0o666, 1, 3),
    node("dev/full", 0o666, 1, 7),
    node("dev/zero", 0o666, 1, 5),
    node("dev/random", 0o666, 1, 8),
    node("dev/urandom", 0o444, 1, 9),
    tty_node("dev/tty", 0o666, 5, 0),
    node("dev/console", 0o600, 5, 1),
    tty_node("dev/ptmx", 0o666, 5, 2),
];

/// Mount options for the root's devpts instance.
///
/// `newinstance` gives the root its own pty namespace on kernels that support it.
#[must_use]
pub fn devpts_options(tty_gid: u32, kernel: KernelVersion) -> String {
    let mut options = format!("gid={tty_gid},mode=0620,ptmxmode=0666");
    if kernel.at_least(DEVPTS_NEWINSTANCE_KERNEL) {
        options.push_str(",newinstance");
    }
    options
}

/// Restores the previous umask when dropped.
struct UmaskGuard(Mode);

impl UmaskGuard {
    fn clear() -> Self {
        Self(umask(Mode::empty()))
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.0);
    }
}

/// Rebuilds `<rootdir>/dev` and registers the devpts and shm mounts.
///
/// # Arguments
///
/// * `rootdir` - Build root
/// * `ledger` - Mount ledger; device mounts are appended once
/// * `kernel` - Running kernel, selects `dev/fd` and devpts `newinstance`
///
/// # Errors
///
/// Returns `DeviceError` if the tree cannot be rebuilt or a node cannot be
/// created. Requires root.
#[instrument(skip_all, fields(rootdir = %rootdir.display(), kernel = %kernel))]
pub fn setup_dev(
    rootdir: &Path,
    ledger: &mut MountLedger,
    kernel: KernelVersion,
) -> Result<(), DeviceError> {
    debug!("Setting up /dev");

    reset_dev_tree(rootdir)?;

    {
        let _umask = UmaskGuard::clear();
        for device in DEVICE_NODES {
            create_node(rootdir, device)?;
        }
        create_links(rootdir, kernel)?;
    }

    let tty_gid = group_gid("tty").unwrap_or(0);
    if ledger.add_device_mounts(rootdir, &devpts_options(tty_gid, kernel)) {
        trace!("Registered devpts and shm mounts");
    }

    if kernel.at_least(DEVPTS_NEWINSTANCE_KERNEL) {
        let ptmx = rootdir.join("dev/ptmx");
        remove_if_present(&ptmx)?;
        symlink("pts/ptmx", &ptmx).map_err(|e| DeviceError::Io {
            context: format!("symlink {}", ptmx.display()),
            source: e,
        })?;
    }

    debug!("/dev ready");
    Ok(())
}

fn reset_dev_tree(rootdir: &Path) -> Result<(), DeviceError> {
    let dev = rootdir.join("dev");
    match fs::remove_dir_all(&dev) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(DeviceError::Io {
                context: format!("remove {}", dev.display()),
                source: e,
            });
        }
    }

    let mut builder = DirBuilder::new();
    builder.recursive(true).mode(0o755);
    for sub in ["dev/pts", "dev/shm"] {
        let path = rootdir.join(sub);
        builder.create(&path).map_err(|e| DeviceError::Io {
            context: format!("create {}", path.display()),
            source: e,
        })?;
    }
    Ok(())
}

fn create_node(rootdir: &Path, device: &DeviceNode) -> Result<(), DeviceError> {
    let path = rootdir.join(device.path);
    let host = Path::new("/").join(device.path);

    let (kind, perm, rdev, uid, gid) = match stat(&host) {
        Ok(st) => (
            SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits()),
            Mode::from_bits_truncate(st.st_mode & 0o7777),
            st.st_rdev,
            Some(st.st_uid),
            Some(st.st_gid),
        ),
        Err(_) => (
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(device.mode),
            makedev(device.major, device.minor),
            device
                .owner
                .and_then(|name| User::from_name(name).ok().flatten())
                .map(|u| u.uid.as_raw()),
            device
                .group
                .and_then(|name| Group::from_name(name).ok().flatten())
                .map(|g| g.gid.as_raw()),
        ),
    };

    trace!(path = %path.display(), mode = %format!("{:o}", perm.bits()), "mknod");
    mknod(&path, kind, perm, rdev).map_err(|e| DeviceError::Mknod {
        path: path.clone(),
        source: e,
    })?;

    if uid.is_some() || gid.is_some() {
        chown(&path, uid.map(Uid::from_raw), gid.map(Gid::from_raw)).map_err(|e| {
            DeviceError::Ownership {
                path: path.clone(),
                source: e,
            }
        })?;
    }
    Ok(())
}

fn create_links(rootdir: &Path, kernel: KernelVersion) -> Result<(), DeviceError> {
    let mut links = vec![
        ("dev/stdin", "/proc/self/fd/0"),
        ("dev/stdout", "/proc/self/fd/1"),
        ("dev/stderr", "/proc/self/fd/2"),
    ];
    if kernel.at_least(DEV_FD_KERNEL) {
        links.push(("dev/fd", "/proc/self/fd"));
    }

    for (link, target) in links {
        let path = rootdir.join(link);
        symlink(target, &path).map_err(|e| DeviceError::Io {
            context: format!("symlink {}", path.display()),
            source: e,
        })?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), DeviceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DeviceError::Io {
            context: format!("remove {}", path.display()),
            source: e,
        }),
    }
}
