//! Real/effective uid and gid switching.
//!
//! The controller runs as root (through sudo or userhelper) and temporarily
//! becomes the build user for steps that write files the user must own.
//! Saved states form a stack; every temporary drop is paired with a restore
//! through [`PrivGuard`], so an early return or a panic cannot leave the
//! process running with the wrong identity.
//!
//! # Ordering
//!
//! - Elevating sets the uids before the gids, since changing gids needs root.
//! - Dropping sets the gids before the uids for the same reason.
//! - While temporarily dropped the saved uid stays 0 so privileges can be
//!   regained.
//!
//! The manager is `Rc`-based and therefore neither `Send` nor `Sync`:
//! credentials are per-process state and switching them is not reentrant.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use nix::unistd::{Gid, Uid, getresgid, getresuid, setresgid, setresuid};
use tracing::{debug, trace, warn};

use crate::error::PrivilegeError;

/// Complete process credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
}

impl Credentials {
    /// Credentials with every id set to 0.
    pub const ROOT: Credentials = Credentials::uniform(0, 0);

    /// Credentials with all uids `uid` and all gids `gid`.
    #[must_use]
    pub const fn uniform(uid: u32, gid: u32) -> Self {
        Self {
            ruid: uid,
            euid: uid,
            suid: uid,
            rgid: gid,
            egid: gid,
            sgid: gid,
        }
    }
}

/// Low-level credential syscalls.
///
/// [`SystemIds`] is the real implementation; tests substitute a recorder.
pub trait IdSwitcher {
    /// Reads the current credentials.
    fn current(&self) -> Result<Credentials, PrivilegeError>;

    /// Sets real, effective and saved uids.
    fn set_uids(&self, ruid: u32, euid: u32, suid: u32) -> Result<(), PrivilegeError>;

    /// Sets real, effective and saved gids.
    fn set_gids(&self, rgid: u32, egid: u32, sgid: u32) -> Result<(), PrivilegeError>;
}

/// [`IdSwitcher`] backed by `getres[ug]id`/`setres[ug]id`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIds;

impl IdSwitcher for SystemIds {
    fn current(&self) -> Result<Credentials, PrivilegeError> {
        let uids = getresuid().map_err(PrivilegeError::ReadIds)?;
        let gids = getresgid().map_err(PrivilegeError::ReadIds)?;
        Ok(Credentials {
            ruid: uids.real.as_raw(),
            euid: uids.effective.as_raw(),
            suid: uids.saved.as_raw(),
            rgid: gids.real.as_raw(),
            egid: gids.effective.as_raw(),
            sgid: gids.saved.as_raw(),
        })
    }

    fn set_uids(&self, ruid: u32, euid: u32, suid: u32) -> Result<(), PrivilegeError> {
        setresuid(
            Uid::from_raw(ruid),
            Uid::from_raw(euid),
            Uid::from_raw(suid),
        )
        .map_err(|e| PrivilegeError::SetUid {
            uid: euid,
            source: e,
        })
    }

    fn set_gids(&self, rgid: u32, egid: u32, sgid: u32) -> Result<(), PrivilegeError> {
        setresgid(
            Gid::from_raw(rgid),
            Gid::from_raw(egid),
            Gid::from_raw(sgid),
        )
        .map_err(|e| PrivilegeError::SetGid {
            gid: egid,
            source: e,
        })
    }
}

struct Inner {
    ids: Box<dyn IdSwitcher>,
    saved: RefCell<Vec<Credentials>>,
    unpriv_uid: u32,
    unpriv_gid: u32,
}

/// Stack-based privilege manager.
///
/// Cloning is cheap and shares the saved-state stack.
#[derive(Clone)]
pub struct PrivilegeManager {
    inner: Rc<Inner>,
}

impl PrivilegeManager {
    /// Creates a manager for the given unprivileged identity using real syscalls.
    #[must_use]
    pub fn new(unpriv_uid: u32, unpriv_gid: u32) -> Self {
        Self::with_switcher(unpriv_uid, unpriv_gid, Box::new(SystemIds))
    }

    /// Creates a manager with a custom [`IdSwitcher`].
    #[must_use]
    pub fn with_switcher(unpriv_uid: u32, unpriv_gid: u32, ids: Box<dyn IdSwitcher>) -> Self {
        Self {
            inner: Rc::new(Inner {
                ids,
                saved: RefCell::new(Vec::new()),
                unpriv_uid,
                unpriv_gid,
            }),
        }
    }

    /// Unprivileged `(uid, gid)` this manager drops to.
    #[must_use]
    pub fn unprivileged(&self) -> (u32, u32) {
        (self.inner.unpriv_uid, self.inner.unpriv_gid)
    }

    /// Number of saved states not yet restored.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.saved.borrow().len()
    }

    /// Current process credentials.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::ReadIds` if they cannot be read.
    pub fn current(&self) -> Result<Credentials, PrivilegeError> {
        self.inner.ids.current()
    }

    /// Saves the current credentials.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::ReadIds` if they cannot be read.
    pub fn push(&self) -> Result<(), PrivilegeError> {
        let creds = self.inner.ids.current()?;
        trace!(?creds, depth = self.depth(), "Saving credentials");
        self.inner.saved.borrow_mut().push(creds);
        Ok(())
    }

    /// Pops the most recently saved credentials and re-applies them.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::Unbalanced` without a saved state, or
    /// `PrivilegeError::SetUid`/`SetGid` if a syscall fails.
    pub fn restore(&self) -> Result<(), PrivilegeError> {
        let creds = self
            .inner
            .saved
            .borrow_mut()
            .pop()
            .ok_or(PrivilegeError::Unbalanced)?;
        trace!(?creds, depth = self.depth(), "Restoring credentials");
        self.elevate()?;
        self.inner.ids.set_gids(creds.rgid, creds.egid, creds.sgid)?;
        self.inner.ids.set_uids(creds.ruid, creds.euid, creds.suid)
    }

    /// Becomes root for real, effective and saved ids.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::SetUid`/`SetGid` if the process cannot regain root.
    pub fn elevate(&self) -> Result<(), PrivilegeError> {
        self.inner.ids.set_uids(0, 0, 0)?;
        self.inner.ids.set_gids(0, 0, 0)
    }

    /// Becomes `uid`/`gid` while keeping the saved uid 0.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::SetUid`/`SetGid` if a syscall fails.
    pub fn become_user(&self, uid: u32, gid: u32) -> Result<(), PrivilegeError> {
        debug!(uid, gid, "Becoming user");
        self.elevate()?;
        self.inner.ids.set_gids(gid, gid, 0)?;
        self.inner.ids.set_uids(uid, uid, 0)
    }

    /// Saves the current state and becomes `uid`/`gid` until the guard drops.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError` if the state cannot be saved or switched. The
    /// saved state is restored before returning in the latter case.
    pub fn drop_temp(&self, uid: u32, gid: u32) -> Result<PrivGuard, PrivilegeError> {
        let guard = self.scoped()?;
        self.become_user(uid, gid)?;
        Ok(guard)
    }

    /// Saves the current state and elevates until the guard drops.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError` if the state cannot be saved or elevated.
    pub fn elevate_temp(&self) -> Result<PrivGuard, PrivilegeError> {
        let guard = self.scoped()?;
        self.elevate()?;
        Ok(guard)
    }

    /// Saves the current state; the returned guard restores it on drop.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::ReadIds` if the state cannot be read.
    pub fn scoped(&self) -> Result<PrivGuard, PrivilegeError> {
        self.push()?;
        Ok(PrivGuard {
            manager: self.clone(),
            active: true,
        })
    }

    /// Permanently becomes the unprivileged user, including saved ids.
    ///
    /// Saved states are discarded since they can no longer be restored.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::SetUid`/`SetGid` if a syscall fails.
    pub fn drop_forever(&self) -> Result<(), PrivilegeError> {
        let (uid, gid) = self.unprivileged();
        debug!(uid, gid, "Dropping privileges permanently");
        self.elevate()?;
        self.inner.ids.set_gids(gid, gid, gid)?;
        self.inner.ids.set_uids(uid, uid, uid)?;
        self.inner.saved.borrow_mut().clear();
        Ok(())
    }

    /// Changes ownership of `path` without following symlinks.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError::Chown` on failure.
    pub fn change_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), PrivilegeError> {
        let guard = self.elevate_temp()?;
        let result = std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|e| {
            PrivilegeError::Chown {
                path: path.to_path_buf(),
                source: e,
            }
        });
        guard.restore()?;
        result
    }
}

impl std::fmt::Debug for PrivilegeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegeManager")
            .field("unpriv_uid", &self.inner.unpriv_uid)
            .field("unpriv_gid", &self.inner.unpriv_gid)
            .field("depth", &self.depth())
            .finish()
    }
}

/// Restores the credentials saved when it was created.
#[must_use = "dropping the guard restores privileges immediately"]
pub struct PrivGuard {
    manager: PrivilegeManager,
    active: bool,
}

impl PrivGuard {
    /// Restores now and reports failures instead of only logging them.
    ///
    /// # Errors
    ///
    /// Returns `PrivilegeError` if the restore fails.
    pub fn restore(mut self) -> Result<(), PrivilegeError> {
        self.active = false;
        self.manager.restore()
    }
}

impl Drop for PrivGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.manager.restore() {
                warn!(error = %e, "Failed to restore privileges");
            }
        }
    }
}
