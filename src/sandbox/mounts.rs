//! Mount namespace and mount ledger for the build root.
//!
//! Every mount the sandbox needs is recorded as a [`MountSpec`] in a
//! [`MountLedger`]. The ledger is built once when the build root is set up and
//! then replayed by [`mount_all`] in registration order. Teardown runs in reverse
//! order and is followed by a sweep of the kernel mount table that detaches
//! anything still mounted below the root.
//!
//! Entries already listed in the mount table are skipped, so replaying the
//! ledger while an outer [`MountGuard`] holds it mounts nothing and the inner
//! guard leaves the mounts to the outer one.
//!
//! # Namespace
//!
//! [`unshare_namespace`] moves the process into a private mount namespace and
//! marks `/` recursively private, so nothing mounted under the root propagates
//! back to the host. It must run before the first mount.
//!
//! # Ledger order
//!
//! 1. procfs (`roto_chroot_proc`)
//! 2. sysfs (`roto_chroot_sysfs`)
//! 3. plugin contributions (cache bind mounts)
//! 4. devpts and `/dev/shm`, appended once by the device provisioner

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use tracing::{debug, instrument, trace, warn};

use crate::error::MountError;

/// Kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Source name of the procfs mount inside the root.
pub const PROC_SOURCE: &str = "roto_chroot_proc";
/// Source name of the sysfs mount inside the root.
pub const SYSFS_SOURCE: &str = "roto_chroot_sysfs";
/// Source name of the devpts mount inside the root.
pub const DEVPTS_SOURCE: &str = "roto_chroot_devpts";
/// Source name of the `/dev/shm` tmpfs inside the root.
pub const SHM_SOURCE: &str = "roto_chroot_shmfs";

/// One entry of the mount ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Device name for filesystems, host path for bind mounts.
    pub source: String,
    /// Absolute host path of the mount point.
    pub target: PathBuf,
    /// Filesystem type; `None` for bind mounts.
    pub fstype: Option<String>,
    /// Filesystem-specific options (`-o`).
    pub options: Option<String>,
    pub flags: MsFlags,
}

impl MountSpec {
    /// A filesystem mount such as proc or tmpfs.
    #[must_use]
    pub fn filesystem(
        source: impl Into<String>,
        fstype: impl Into<String>,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: Some(fstype.into()),
            options: None,
            flags: MsFlags::empty(),
        }
    }

    /// A read-write bind mount of a host directory.
    #[must_use]
    pub fn bind(source: impl AsRef<Path>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.as_ref().to_string_lossy().into_owned(),
            target: target.into(),
            fstype: None,
            options: None,
            flags: MsFlags::MS_BIND,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Returns true for bind mounts.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.flags.contains(MsFlags::MS_BIND)
    }

}

/// Performs the mount system calls for ledger entries.
pub trait Mounter: fmt::Debug {
    /// Mounts `spec`, creating its mount point when missing.
    ///
    /// # Errors
    ///
    /// Returns `MountError::CreateTarget` or `MountError::Mount`.
    fn mount(&self, spec: &MountSpec) -> Result<(), MountError>;

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns the errno of umount2(2).
    fn unmount(&self, target: &Path, flags: MntFlags) -> Result<(), Errno>;
}

/// Mounts for real through mount(2) and umount2(2).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, spec: &MountSpec) -> Result<(), MountError> {
        if !spec.target.exists() {
            fs::create_dir_all(&spec.target).map_err(|e| MountError::CreateTarget {
                path: spec.target.clone(),
                source: e,
            })?;
        }

        trace!(
            source = %spec.source,
            mount_point = %spec.target.display(),
            fstype = ?spec.fstype,
            options = ?spec.options,
            "mount"
        );

        mount(
            Some(spec.source.as_str()),
            &spec.target,
            spec.fstype.as_deref(),
            spec.flags,
            spec.options.as_deref(),
        )
        .map_err(|e| MountError::Mount {
            source_name: spec.source.clone(),
            target: spec.target.clone(),
            reason: e.to_string(),
        })
    }

    fn unmount(&self, target: &Path, flags: MntFlags) -> Result<(), Errno> {
        umount2(target, flags)
    }
}

/// Ordered list of the mounts a build root needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountLedger {
    specs: Vec<MountSpec>,
    devices_added: bool,
}

impl MountLedger {
    /// Creates the ledger with proc and sysfs under `rootdir`.
    #[must_use]
    pub fn new(rootdir: &Path) -> Self {
        Self {
            specs: vec![
                MountSpec::filesystem(PROC_SOURCE, "proc", rootdir.join("proc")),
                MountSpec::filesystem(SYSFS_SOURCE, "sysfs", rootdir.join("sys")),
            ],
            devices_added: false,
        }
    }

    /// Appends a mount.
    pub fn push(&mut self, spec: MountSpec) {
        self.specs.push(spec);
    }

    /// Appends the devpts and `/dev/shm` mounts.
    ///
    /// Only the first call has an effect; returns whether the entries were added.
    pub fn add_device_mounts(&mut self, rootdir: &Path, devpts_options: &str) -> bool {
        if self.devices_added {
            trace!("Device mounts already in ledger");
            return false;
        }
        self.specs.push(
            MountSpec::filesystem(DEVPTS_SOURCE, "devpts", rootdir.join("dev/pts"))
                .with_options(devpts_options),
        );
        self.specs.push(MountSpec::filesystem(
            SHM_SOURCE,
            "tmpfs",
            rootdir.join("dev/shm"),
        ));
        self.devices_added = true;
        true
    }

    #[must_use]
    pub fn specs(&self) -> &[MountSpec] {
        &self.specs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Moves the process into a private mount namespace.
///
/// After `unshare(CLONE_NEWNS)` the root mount is remounted `MS_REC | MS_PRIVATE`
/// so mounts made below the build root stay invisible to the host.
///
/// # Errors
///
/// Returns `MountError::Unshare` if either step fails.
#[instrument]
pub fn unshare_namespace() -> Result<(), MountError> {
    debug!("Unsharing mount namespace");
    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| MountError::Unshare(e.to_string()))?;

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| MountError::Unshare(format!("failed to make / private: {e}")))?;

    debug!("Private mount namespace ready");
    Ok(())
}

/// Mounts every ledger entry in order with the system mounter.
///
/// See [`mount_all_with`].
///
/// # Errors
///
/// Returns the `MountError` of the first mount that failed.
pub fn mount_all(ledger: &MountLedger, rootdir: &Path) -> Result<MountGuard, MountError> {
    mount_all_with(ledger, rootdir, Path::new(PROC_MOUNTS), Rc::new(SystemMounter))
}

/// Mounts every ledger entry in order.
///
/// Mount points are created when missing. Entries whose mount point is
/// already listed in `mount_table` are skipped. If a mount fails, the entries
/// mounted by this call are unmounted again before the error is returned.
///
/// # Arguments
///
/// * `ledger` - Mounts to perform
/// * `rootdir` - Build root; the leak sweep only touches mounts below it
/// * `mount_table` - Kernel mount table, normally [`PROC_MOUNTS`]
/// * `mounter` - Performs the system calls
///
/// # Errors
///
/// Returns the `MountError` of the first mount that failed.
#[instrument(skip_all, fields(rootdir = %rootdir.display(), count = ledger.len()))]
pub fn mount_all_with(
    ledger: &MountLedger,
    rootdir: &Path,
    mount_table: &Path,
    mounter: Rc<dyn Mounter>,
) -> Result<MountGuard, MountError> {
    debug!("Mounting chroot filesystems");

    let present: Vec<PathBuf> = match mounts_under(mount_table, rootdir) {
        Ok(points) => points.iter().map(|p| resolve(p)).collect(),
        Err(e) => {
            warn!(error = %e, "Could not read mount table, assuming nothing is mounted");
            Vec::new()
        }
    };

    let mut mounted = Vec::with_capacity(ledger.len());
    for spec in ledger.specs() {
        if present.contains(&resolve(&spec.target)) {
            trace!(mount_point = %spec.target.display(), "Already mounted");
            continue;
        }
        if let Err(e) = mounter.mount(spec) {
            warn!(error = %e, "Mount failed, rolling back");
            let sweep = present.is_empty();
            if let Err(rollback) = teardown(&mounted, rootdir, mount_table, mounter.as_ref(), sweep) {
                warn!(error = %rollback, "Rollback unmount failed");
            }
            return Err(e);
        }
        mounted.push(spec.clone());
    }

    debug!(mounted = mounted.len(), "All chroot filesystems mounted");
    Ok(MountGuard {
        active: !mounted.is_empty(),
        sweep: present.is_empty(),
        specs: mounted,
        rootdir: rootdir.to_path_buf(),
        mount_table: mount_table.to_path_buf(),
        mounter,
    })
}

/// Unmounts `specs` in reverse order, then sweeps the mount table.
///
/// Any entry of `mount_table` whose resolved mount point lies below the
/// resolved `rootdir` is force-unmounted with a warning. Errors do not stop
/// the teardown.
///
/// # Errors
///
/// Returns the first error of the sweep. Failures unmounting ledger entries are
/// only logged since the sweep retries them.
pub fn unmount_all(
    specs: &[MountSpec],
    rootdir: &Path,
    mount_table: &Path,
    mounter: &dyn Mounter,
) -> Result<(), MountError> {
    teardown(specs, rootdir, mount_table, mounter, true)
}

#[instrument(skip_all, fields(rootdir = %rootdir.display(), sweep = sweep))]
fn teardown(
    specs: &[MountSpec],
    rootdir: &Path,
    mount_table: &Path,
    mounter: &dyn Mounter,
    sweep: bool,
) -> Result<(), MountError> {
    debug!("Unmounting chroot filesystems");

    for spec in specs.iter().rev() {
        if let Err(e) = mounter.unmount(&spec.target, MntFlags::empty()) {
            trace!(mount_point = %spec.target.display(), error = %e, "umount failed");
        }
    }
    if !sweep {
        return Ok(());
    }

    let mut first_error: Option<MountError> = None;

    let leftovers = match mounts_under(mount_table, rootdir) {
        Ok(points) => points,
        Err(e) => {
            warn!(error = %e, "Could not read mount table");
            return Err(e);
        }
    };

    for point in leftovers.iter().rev() {
        warn!("Forcibly unmounting '{}' from chroot.", point.display());
        if let Err(e) = force_unmount(point, mounter) {
            warn!(error = %e, "Forced unmount failed");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            debug!("Chroot filesystems unmounted");
            Ok(())
        }
    }
}

fn force_unmount(target: &Path, mounter: &dyn Mounter) -> Result<(), MountError> {
    match mounter.unmount(target, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(error = %e, "Normal unmount failed, trying lazy unmount");
            mounter
                .unmount(target, MntFlags::MNT_DETACH)
                .map_err(|e| MountError::Unmount {
                    target: target.to_path_buf(),
                    reason: e.to_string(),
                })
        }
    }
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Parses a `/proc/mounts`-style file into mount points, in table order.
///
/// Octal escapes (`\040` for space) are decoded. Mount points are kept as
/// raw bytes, so paths that are not UTF-8 survive.
///
/// # Errors
///
/// Returns `MountError::ReadTable` if the file cannot be read.
pub fn parse_mounts(mount_table: &Path) -> Result<Vec<PathBuf>, MountError> {
    let content = fs::read(mount_table).map_err(|e| MountError::ReadTable {
        path: mount_table.to_path_buf(),
        source: e,
    })?;

    Ok(content
        .split(|&b| b == b'\n')
        .filter_map(|line| {
            line.split(u8::is_ascii_whitespace)
                .filter(|field| !field.is_empty())
                .nth(1)
        })
        .map(|field| PathBuf::from(OsStr::from_bytes(&unescape_mount_field(field))))
        .collect())
}

/// Mount points from `mount_table` at or below `rootdir`, in table order.
///
/// # Errors
///
/// Returns `MountError::ReadTable` if the table cannot be read.
pub fn mounts_under(mount_table: &Path, rootdir: &Path) -> Result<Vec<PathBuf>, MountError> {
    let root = resolve(rootdir);
    Ok(parse_mounts(mount_table)?
        .into_iter()
        .filter(|point| resolve(point).starts_with(&root))
        .collect())
}

fn unescape_mount_field(field: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        if field[i] == b'\\' {
            if let Some(value) = field.get(i + 1..i + 4).and_then(octal_byte) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(field[i]);
        i += 1;
    }
    out
}

fn octal_byte(digits: &[u8]) -> Option<u8> {
    digits.iter().try_fold(0u8, |acc, &d| {
        if (b'0'..=b'7').contains(&d) {
            acc.checked_mul(8)?.checked_add(d - b'0')
        } else {
            None
        }
    })
}

/// Unmounts the ledger when dropped.
///
/// Call [`MountGuard::finish`] to unmount explicitly and see the error.
/// A guard whose mounts were all present already does nothing.
#[must_use = "dropping the guard unmounts immediately"]
#[derive(Debug)]
pub struct MountGuard {
    specs: Vec<MountSpec>,
    rootdir: PathBuf,
    mount_table: PathBuf,
    mounter: Rc<dyn Mounter>,
    sweep: bool,
    active: bool,
}

impl MountGuard {
    /// Entries mounted by the call that returned this guard.
    #[must_use]
    pub fn mounted(&self) -> &[MountSpec] {
        &self.specs
    }

    /// Unmounts everything and reports the first error.
    ///
    /// # Errors
    ///
    /// See [`unmount_all`].
    pub fn finish(mut self) -> Result<(), MountError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        teardown(
            &self.specs,
            &self.rootdir,
            &self.mount_table,
            self.mounter.as_ref(),
            self.sweep,
        )
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            if let Err(e) = teardown(
                &self.specs,
                &self.rootdir,
                &self.mount_table,
                self.mounter.as_ref(),
                self.sweep,
            ) {
                warn!(error = %e, "Unmount on drop failed");
            }
        }
    }
}
