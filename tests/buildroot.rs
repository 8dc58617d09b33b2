//! Integration tests for build root lifecycle operations.
//!
//! Everything here runs unprivileged: credential switches go through a
//! recording [`IdSwitcher`] and no test mounts anything. Tests that need root
//! live at the bottom and are ignored by default.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use roto_sandbox::build::State;
use roto_sandbox::config::BuildConfig;
use roto_sandbox::error::PrivilegeError;
use roto_sandbox::sandbox::{
    Credentials, FileLock, IdSwitcher, LockKind, PROC_MOUNTS, PrivilegeManager, mounts_under,
};
use roto_sandbox::{Buildroot, Error};

#[derive(Clone)]
struct RecordingIds(Rc<RefCell<Credentials>>);

impl IdSwitcher for RecordingIds {
    fn current(&self) -> Result<Credentials, PrivilegeError> {
        Ok(*self.0.borrow())
    }

    fn set_uids(&self, ruid: u32, euid: u32, suid: u32) -> Result<(), PrivilegeError> {
        let mut ids = self.0.borrow_mut();
        ids.ruid = ruid;
        ids.euid = euid;
        ids.suid = suid;
        Ok(())
    }

    fn set_gids(&self, rgid: u32, egid: u32, sgid: u32) -> Result<(), PrivilegeError> {
        let mut ids = self.0.borrow_mut();
        ids.rgid = rgid;
        ids.egid = egid;
        ids.sgid = sgid;
        Ok(())
    }
}

fn temp_base() -> TempDir {
    TempDir::new().expect("failed to create temp dir")
}

fn config(base: &Path) -> BuildConfig {
    BuildConfig::default()
        .with_root("integration")
        .with_basedir(base.join("lib"))
        .with_cache_topdir(base.join("cache"))
        .with_unprivileged_user(1000, 1000)
        .with_chroot_gid(135)
}

fn buildroot(base: &Path) -> Buildroot {
    let ids = RecordingIds(Rc::new(RefCell::new(Credentials::ROOT)));
    let privs = PrivilegeManager::with_switcher(1000, 1000, Box::new(ids));
    Buildroot::new(config(base), privs).expect("Failed to create build root")
}

// ============================================================================
// Clean
// ============================================================================

#[test]
fn test_clean_already_clean_root() {
    let tmp = temp_base();
    let base = tmp.path();
    let mut root = buildroot(base);
    assert!(!root.paths().basedir.exists());

    root.clean().expect("clean of an absent root");
    root.clean().expect("second clean");

    assert!(root.was_cleaned());
    assert!(root.locks().held().is_empty());
    let history = root.state_history();
    assert_eq!(
        history.iter().filter(|s| **s == State::LockBuildroot).count(),
        2
    );
    assert_eq!(history.last(), Some(&State::UnlockBuildroot));

    root.end();
    assert_eq!(root.state(), State::End);
}

#[test]
fn test_clean_removes_existing_root() {
    let tmp = temp_base();
    let base = tmp.path();
    let mut root = buildroot(base);
    let paths = root.paths().clone();
    fs::create_dir_all(paths.builddir().join("RPMS")).expect("tree");

    root.clean().expect("clean");
    assert!(!paths.basedir.exists());
    assert!(!paths.trash_dir().exists());
    assert!(!paths.lock_file.exists());
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn test_overlapping_operations_serialize() {
    let tmp = temp_base();
    let base = tmp.path();
    let lock_file = buildroot(base).paths().lock_file.clone();

    let holder = FileLock::acquire(&lock_file).expect("first holder");
    let (started_tx, started_rx) = mpsc::channel();
    let worker_base = base.to_path_buf();
    let worker = thread::spawn(move || {
        let mut root = buildroot(&worker_base);
        started_tx.send(()).expect("signal start");
        root.clean().expect("clean after the lock is free");
        Instant::now()
    });

    started_rx.recv().expect("worker started");
    thread::sleep(Duration::from_millis(300));
    let released = Instant::now();
    holder.release();

    let finished = worker.join().expect("worker thread");
    assert!(finished >= released, "clean ran while the lock was held");
}

#[test]
fn test_lock_round_trip() {
    let tmp = temp_base();
    let base = tmp.path();
    let path = base.join("buildroot.lock");

    let lock = FileLock::acquire(&path).expect("acquire");
    assert!(path.exists());
    lock.release();
    assert!(!path.exists());

    let start = Instant::now();
    let again = FileLock::try_acquire(&path)
        .expect("try acquire")
        .expect("lock is free");
    assert!(start.elapsed() < Duration::from_secs(1));
    drop(again);
}

// ============================================================================
// Interactive modes
// ============================================================================

#[test]
fn test_orphanskill_without_processes() {
    let tmp = temp_base();
    let base = tmp.path();
    let root = buildroot(base);
    assert_eq!(root.orphanskill(), 0);
}

#[test]
fn test_copyin_then_copyout() {
    let tmp = temp_base();
    let base = tmp.path();
    let mut root = buildroot(base);
    fs::create_dir_all(root.root_path().join("tmp")).expect("root tmp");
    let host_file = base.join("notes.txt");
    fs::write(&host_file, "hello").expect("host file");

    root.copyin(&[host_file.clone(), PathBuf::from("/tmp")])
        .expect("copyin");
    assert!(root.root_path().join("tmp/notes.txt").is_file());

    let out = base.join("out");
    fs::create_dir_all(&out).expect("out dir");
    root.copyout(&[PathBuf::from("/tmp/notes.txt"), out.clone()])
        .expect("copyout");
    assert_eq!(
        fs::read_to_string(out.join("notes.txt")).expect("copied back"),
        "hello"
    );
    assert!(!root.locks().is_held(LockKind::Buildroot));
}

#[test]
fn test_usage_errors_exit_50() {
    let tmp = temp_base();
    let base = tmp.path();
    let mut root = buildroot(base);

    let err = root.chroot(&[], false, None).expect_err("no command");
    assert_eq!(err.exit_code(), 50);
    let err = root.shell(Some("true"), false, None).expect_err("no root");
    assert!(matches!(err, Error::Usage(_)));
    let err = root.rebuild(&[], true).expect_err("no packages");
    assert_eq!(err.exit_code(), 50);
}

// ============================================================================
// Requires root
// ============================================================================

#[test]
#[ignore = "requires root, rpm and a reachable yum repository"]
fn test_init_fresh_root() {
    let tmp = temp_base();
    let base = tmp.path();
    let mut root = Buildroot::new(config(base), PrivilegeManager::new(1000, 1000))
        .expect("build root");

    root.init().expect("init");
    let rootdir = root.root_path().to_path_buf();
    for dir in ["var/lib/rpm", "var/log", "etc/rpm", "tmp", "proc", "sys"] {
        assert!(rootdir.join(dir).is_dir(), "{dir} missing");
    }
    assert!(rootdir.join("etc/mtab").is_file());
    assert_eq!(
        fs::read_link(rootdir.join("etc/yum.conf")).expect("yum.conf link"),
        PathBuf::from("yum/yum.conf")
    );
    assert!(root.paths().builddir().join("SPECS").is_dir());
    assert!(
        mounts_under(Path::new(PROC_MOUNTS), &rootdir)
            .expect("mount table")
            .is_empty()
    );

    root.end();
    assert_eq!(root.state(), State::End);
    root.clean().expect("clean");
}
