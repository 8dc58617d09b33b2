//! Host requirements and identity checks.
//!
//! This module provides the checks the controller runs before touching any
//! sandbox: kernel feature thresholds, architecture compatibility and the
//! sudo/userhelper identity used for privilege dropping.

mod requirements;

pub use requirements::{
    BUILD_GROUP, DEV_FD_KERNEL, DEVPTS_NEWINSTANCE_KERNEL, InvokingUser, KernelVersion,
    check_arch_combination, check_root, group_gid, host_arch, in_build_group, invoking_user,
    invoking_user_from, kernel_version, parse_kernel_version, selinux_enabled,
};
