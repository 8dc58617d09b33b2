//! Low-level sandbox primitives: credentials, locks, devices, mounts,
//! processes and command execution.
//!
//! Nothing in this module knows about packages or build stages; the build
//! pipeline composes these pieces.
//!
//! # Example
//!
//! ```no_run
//! use roto_sandbox::sandbox::{ChrootCommand, CommandRunner, SystemRunner};
//!
//! let output = SystemRunner
//!     .run(&ChrootCommand::new(["rpm", "-qa"]).in_root("/var/lib/roto/default/root"))
//!     .unwrap();
//! println!("{}", output.stdout);
//! ```

mod devices;
mod exec;
mod lock;
mod mounts;
mod orphans;
mod privilege;

pub use devices::{DEVICE_NODES, DeviceNode, devpts_options, setup_dev};
pub use exec::{
    CHROOT_PATH, ChrootCommand, CommandOutput, CommandRunner, OutputMode, PER_LINUX, PER_LINUX32,
    SystemRunner, personality_for,
};
pub use lock::{FileLock, LockKind, LockTable};
pub use mounts::{
    MountGuard, MountLedger, MountSpec, Mounter, PROC_MOUNTS, PROC_SOURCE, SYSFS_SOURCE,
    SystemMounter, mount_all, mount_all_with, mounts_under, parse_mounts, unmount_all,
    unshare_namespace,
};
pub use orphans::{kill_orphans, kill_orphans_in};
pub use privilege::{Credentials, IdSwitcher, PrivGuard, PrivilegeManager, SystemIds};
