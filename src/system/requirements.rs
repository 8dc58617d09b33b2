//! Host checks: kernel version, architecture and invoking user.

use std::env;

use nix::unistd::{Gid, Group, Uid, User, getgid, geteuid, getuid};
use tracing::debug;

use crate::error::{ConfigError, PrivilegeError, SystemError};

/// First kernel that provides `/proc/self/fd` for the `dev/fd` symlink.
pub const DEV_FD_KERNEL: KernelVersion = KernelVersion::new(2, 6, 9);

/// First kernel with private devpts instances (`newinstance`, `ptmxmode`).
pub const DEVPTS_NEWINSTANCE_KERNEL: KernelVersion = KernelVersion::new(2, 6, 29);

/// Group whose members may run builds.
pub const BUILD_GROUP: &str = "mock";

/// A parsed kernel release such as `6.8.0-generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// Creates a version from its components.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns true if this version is `other` or newer.
    #[must_use]
    pub fn at_least(&self, other: KernelVersion) -> bool {
        *self >= other
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The identity that invoked the controller through sudo or userhelper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokingUser {
    pub uid: u32,
    pub gid: u32,
    pub name: Option<String>,
}

fn uname() -> Result<nix::sys::utsname::UtsName, SystemError> {
    nix::sys::utsname::uname().map_err(|e| SystemError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })
}

/// Reads the running kernel version.
///
/// # Errors
///
/// Returns `SystemError::ReadFailed` if uname fails or the release cannot be parsed.
pub fn kernel_version() -> Result<KernelVersion, SystemError> {
    let release = uname()?.release().to_string_lossy().to_string();
    parse_kernel_version(&release)
}

/// Parses a kernel release string into a [`KernelVersion`].
///
/// Missing patch levels read as 0 and vendor suffixes are ignored.
///
/// # Errors
///
/// Returns `SystemError::ReadFailed` if the major or minor component is not numeric.
pub fn parse_kernel_version(version: &str) -> Result<KernelVersion, SystemError> {
    let invalid = |what: &str| SystemError::ReadFailed {
        context: format!("Failed to parse kernel {what} version: {version}"),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid kernel version"),
    };

    let mut parts = version.split('.');
    let mut next_number = || {
        parts.next().map(|p| {
            p.split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or_default()
                .parse::<u32>()
        })
    };

    let major = next_number()
        .and_then(|r| r.ok())
        .ok_or_else(|| invalid("major"))?;
    let minor = next_number()
        .and_then(|r| r.ok())
        .ok_or_else(|| invalid("minor"))?;
    let patch = next_number().and_then(|r| r.ok()).unwrap_or(0);

    Ok(KernelVersion::new(major, minor, patch))
}

/// Returns the host machine architecture (`uname -m`).
///
/// # Errors
///
/// Returns `SystemError::ReadFailed` if uname fails.
pub fn host_arch() -> Result<String, SystemError> {
    Ok(uname()?.machine().to_string_lossy().to_string())
}

/// Files whose presence means SELinux is active on the host.
const SELINUX_ENFORCE: &[&str] = &["/sys/fs/selinux/enforce", "/selinux/enforce"];

/// Returns true if SELinux is active on the host.
///
/// Tree removal only retries with `chattr -R -i` when this holds.
#[must_use]
pub fn selinux_enabled() -> bool {
    SELINUX_ENFORCE
        .iter()
        .any(|path| std::path::Path::new(path).exists())
}

/// Checks that `host` may build for `target`.
///
/// An empty `legal_host_arches` list accepts every host.
///
/// # Errors
///
/// Returns `ConfigError::InvalidArchitecture` if the host is not listed.
pub fn check_arch_combination(
    target: &str,
    host: &str,
    legal_host_arches: &[String],
) -> Result<(), ConfigError> {
    if legal_host_arches.is_empty() || legal_host_arches.iter().any(|a| a == host) {
        return Ok(());
    }
    Err(ConfigError::InvalidArchitecture {
        target: target.to_string(),
        host: host.to_string(),
    })
}

/// Refuses to run unless effectively root and reached through sudo or userhelper.
///
/// # Errors
///
/// Returns `PrivilegeError::NotRoot` when euid is not 0 and
/// `PrivilegeError::DirectRoot` when the real uid is root but no invoking user
/// is recorded in the environment.
pub fn check_root() -> Result<(), PrivilegeError> {
    let euid = geteuid();
    if !euid.is_root() {
        return Err(PrivilegeError::NotRoot {
            euid: euid.as_raw(),
        });
    }
    if getuid().is_root()
        && env::var_os("SUDO_UID").is_none()
        && env::var_os("USERHELPER_UID").is_none()
    {
        return Err(PrivilegeError::DirectRoot);
    }
    Ok(())
}

/// Determines the unprivileged identity behind this process.
///
/// `SUDO_UID`/`SUDO_GID`/`SUDO_USER` win, then `USERHELPER_UID` (group and
/// name from the password database), then the real ids of the process.
///
/// # Errors
///
/// Returns `SystemError::InvokingUser` when an id variable is not numeric.
pub fn invoking_user() -> Result<InvokingUser, SystemError> {
    invoking_user_from(|key| env::var(key).ok())
}

/// Same as [`invoking_user`] with an injectable environment lookup.
pub fn invoking_user_from<F>(lookup: F) -> Result<InvokingUser, SystemError>
where
    F: Fn(&str) -> Option<String>,
{
    let parse = |key: &str, value: String| {
        value
            .trim()
            .parse::<u32>()
            .map_err(|_| SystemError::InvokingUser(format!("{key}={value} is not numeric")))
    };

    let mut user = InvokingUser {
        uid: getuid().as_raw(),
        gid: getgid().as_raw(),
        name: None,
    };

    if let Some(uid) = lookup("SUDO_UID") {
        user.uid = parse("SUDO_UID", uid)?;
        user.name = lookup("SUDO_USER");
        if let Some(gid) = lookup("SUDO_GID") {
            user.gid = parse("SUDO_GID", gid)?;
        }
    }

    if let Some(uid) = lookup("USERHELPER_UID") {
        user.uid = parse("USERHELPER_UID", uid)?;
        if let Ok(Some(pw)) = User::from_uid(Uid::from_raw(user.uid)) {
            user.name = Some(pw.name);
            user.gid = pw.gid.as_raw();
        }
    }

    if user.name.is_none() {
        user.name = User::from_uid(Uid::from_raw(user.uid))
            .ok()
            .flatten()
            .map(|pw| pw.name);
    }

    debug!(uid = user.uid, gid = user.gid, name = ?user.name, "Invoking user");
    Ok(user)
}

/// Returns the gid of `name`, if the group exists.
#[must_use]
pub fn group_gid(name: &str) -> Option<u32> {
    Group::from_name(name)
        .ok()
        .flatten()
        .map(|g| g.gid.as_raw())
}

/// Returns true if the user is a member of the build group.
///
/// Membership counts through the primary gid or the group's member list.
#[must_use]
pub fn in_build_group(user: &InvokingUser) -> bool {
    let Ok(Some(group)) = Group::from_name(BUILD_GROUP) else {
        return false;
    };
    if group.gid == Gid::from_raw(user.gid) {
        return true;
    }
    user.name
        .as_ref()
        .is_some_and(|name| group.mem.iter().any(|m| m == name))
}
