//! Terminates processes still running inside a build root.

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::SystemError;

/// Signals every process whose root directory is `rootdir`.
///
/// Returns the number of processes signalled.
pub fn kill_orphans(rootdir: &Path, signal: Signal) -> usize {
    kill_orphans_in(Path::new("/proc"), rootdir, signal)
}

/// Same as [`kill_orphans`] against an arbitrary proc directory.
///
/// Entries that are not pids, or whose `root` link cannot be read, are skipped.
/// Signalled processes are reaped when they are our children. When
/// `proc_dir` cannot be listed nothing is signalled and a warning is logged.
#[instrument(skip_all, fields(rootdir = %rootdir.display(), signal = %signal))]
pub fn kill_orphans_in(proc_dir: &Path, rootdir: &Path, signal: Signal) -> usize {
    debug!("kill orphans");

    let root = fs::canonicalize(rootdir).unwrap_or_else(|_| rootdir.to_path_buf());
    let pids = match processes_rooted_at(proc_dir, &root) {
        Ok(pids) => pids,
        Err(e) => {
            warn!(error = %e, "Could not scan for orphan processes");
            return 0;
        }
    };

    let mut signalled = 0;
    for pid in pids {
        let pid = Pid::from_raw(pid);
        info!(%pid, "Killing orphan process");
        if let Err(e) = kill(pid, signal) {
            trace!(%pid, error = %e, "kill failed");
            continue;
        }
        signalled += 1;
        match waitpid(pid, None) {
            Ok(status) => trace!(%pid, ?status, "reaped"),
            // not our child
            Err(Errno::ECHILD) => {}
            Err(e) => debug!(%pid, error = %e, "waitpid failed"),
        }
    }

    debug!(signalled, "Orphan sweep complete");
    signalled
}

fn processes_rooted_at(proc_dir: &Path, root: &Path) -> Result<Vec<i32>, SystemError> {
    let entries = fs::read_dir(proc_dir).map_err(|e| SystemError::ReadFailed {
        context: format!("list {}", proc_dir.display()),
        source: e,
    })?;

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };

        let Ok(link) = fs::read_link(entry.path().join("root")) else {
            continue;
        };
        let resolved: PathBuf = fs::canonicalize(&link).unwrap_or(link);
        if resolved == root {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}
