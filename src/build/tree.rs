//! Recursive copy and removal of directory trees.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, instrument, trace, warn};
use walkdir::WalkDir;

use crate::sandbox::{ChrootCommand, CommandRunner};

/// Pause before retrying a removal that failed with `EBUSY`.
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Removes `path` recursively.
///
/// A missing path is not an error. `EBUSY` is retried once after two seconds.
/// With `selinux` set, `EPERM`/`EACCES` runs `chattr -R -i` on the tree and
/// retries, failing if the same error comes back.
///
/// # Errors
///
/// Returns the last `io::Error` once retries are exhausted.
#[instrument(skip(runner), fields(path = %path.display()))]
pub fn remove_tree(path: &Path, selinux: bool, runner: &dyn CommandRunner) -> io::Result<()> {
    debug!("remove tree");
    let mut busy_retries = 0;
    let mut cleared_attributes = false;

    loop {
        let err = match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => e,
        };

        match err.raw_os_error().map(Errno::from_raw) {
            Some(Errno::EBUSY) if busy_retries == 0 => {
                busy_retries += 1;
                debug!("retrying failed tree remove after sleeping a bit");
                thread::sleep(BUSY_RETRY_DELAY);
            }
            Some(Errno::EPERM | Errno::EACCES) if selinux && !cleared_attributes => {
                cleared_attributes = true;
                let target = path.to_string_lossy().into_owned();
                let command = ChrootCommand::new(["chattr", "-R", "-i", target.as_str()]);
                match runner.run(&command) {
                    Ok(output) if output.success() => {}
                    Ok(output) => warn!(code = output.exit_code, "chattr failed"),
                    Err(e) => warn!(error = %e, "chattr failed"),
                }
            }
            _ => return Err(err),
        }
    }
}

/// Copies the directory `src` to `dest`, which must not exist yet.
///
/// Symlinks are recreated, not followed. Permissions of files are kept.
///
/// # Errors
///
/// Returns the first `io::Error`.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    trace!(src = %src.display(), dest = %dest.display(), "copy tree");
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, entry.metadata().map_err(io::Error::from)?.permissions())?;
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copies a file or tree the way `cp -r` would.
///
/// When `dest` is an existing directory the source is placed inside it under
/// its own name. Returns the path written.
///
/// # Errors
///
/// Returns the first `io::Error`.
pub fn copy_path(src: &Path, dest: &Path) -> io::Result<PathBuf> {
    let target = match (dest.is_dir(), src.file_name()) {
        (true, Some(name)) => dest.join(name),
        _ => dest.to_path_buf(),
    };
    if src.is_dir() {
        copy_tree(src, &target)?;
    } else {
        fs::copy(src, &target)?;
    }
    Ok(target)
}

/// Replaces `dest` with a copy of the host file `src`.
///
/// Returns false without touching `dest` when `src` does not exist.
///
/// # Errors
///
/// Returns `io::Error` if the old file cannot be removed or the copy fails.
pub fn copy_host_file(src: &Path, dest: &Path) -> io::Result<bool> {
    if !src.exists() {
        trace!(src = %src.display(), "host file missing, not copied");
        return Ok(false);
    }
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::copy(src, dest)?;
    Ok(true)
}

/// Creates `path` if missing without truncating it.
///
/// # Errors
///
/// Returns `io::Error` if the file cannot be opened.
pub fn touch(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(drop)
}
