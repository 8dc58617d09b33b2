//! Creating, populating and removing the root.

use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::tree::{copy_host_file, remove_tree, touch};
use super::{Buildroot, State};
use crate::config::{BUILD_SUBDIRS, BuildConfig};
use crate::error::{Error, ResultDirError};
use crate::plugins::Stage;
use crate::sandbox::{CommandOutput, LockKind, kill_orphans};

/// Directories every root starts with.
pub const SKELETON_DIRS: &[&str] = &[
    "var/lib/rpm",
    "var/lib/yum",
    "var/lib/dbus",
    "var/log",
    "var/lock/rpm",
    "var/cache/yum",
    "etc/rpm",
    "etc/yum",
    "etc/yum.repos.d",
    "tmp",
    "tmp/ccache",
    "var/tmp",
    "proc",
    "sys",
];

/// Files that must exist, possibly empty, before the installer runs.
pub const SKELETON_FILES: &[&str] = &["etc/mtab", "etc/fstab", "var/log/yum.log"];

/// What `--scrub` removes.
#[derive(clap::ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScrubTarget {
    /// The root and the whole cache directory
    All,
    /// The root only
    Chroot,
    /// The whole cache directory
    Cache,
    /// The compiler cache
    CCache,
    /// The root cache tarball
    RootCache,
    /// The installer cache
    YumCache,
}

impl ScrubTarget {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Chroot => "chroot",
            Self::Cache => "cache",
            Self::CCache => "c-cache",
            Self::RootCache => "root-cache",
            Self::YumCache => "yum-cache",
        }
    }
}

impl std::fmt::Display for ScrubTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes the skeleton of a root: directories, sentinel files, installer
/// configuration, resolver files, the dbus machine id and configured files.
///
/// Configured files that already exist are left alone.
///
/// # Errors
///
/// Returns the first `io::Error`.
#[instrument(skip(config), fields(rootdir = %rootdir.display()))]
pub fn populate_root(rootdir: &Path, config: &BuildConfig) -> io::Result<()> {
    for dir in SKELETON_DIRS {
        fs::create_dir_all(rootdir.join(dir))?;
    }

    debug!("touch required files");
    for file in SKELETON_FILES {
        touch(&rootdir.join(file))?;
    }

    debug!("configure yum");
    fs::write(rootdir.join("etc/yum/yum.conf"), &config.yum_conf)?;
    let link = rootdir.join("etc/yum.conf");
    match fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink("yum/yum.conf", &link)?;

    if config.use_host_resolv {
        copy_host_file(Path::new("/etc/resolv.conf"), &rootdir.join("etc/resolv.conf"))?;
        copy_host_file(Path::new("/etc/hosts"), &rootdir.join("etc/hosts"))?;
    }

    fs::write(
        rootdir.join("var/lib/dbus/machine-id"),
        format!("{}\n", Uuid::new_v4().simple()),
    )?;

    for (name, content) in &config.files {
        let path = rootdir.join(name.trim_start_matches('/'));
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
    }
    Ok(())
}

/// Creates rpm's `%_topdir` layout under `builddir`, every directory 0755.
///
/// # Errors
///
/// Returns the first `io::Error`.
pub fn create_build_dirs(builddir: &Path) -> io::Result<()> {
    for sub in BUILD_SUBDIRS {
        let dir = builddir.join(sub);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Re-enables `user` in the passwd file at `passwd` by stripping a `!!`
/// password prefix. Returns whether the file changed.
///
/// # Errors
///
/// Returns `io::Error` if the file cannot be read or rewritten.
pub fn enable_account(passwd: &Path, user: &str) -> io::Result<bool> {
    let content = fs::read_to_string(passwd)?;
    let mut disabled = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let mut parts: Vec<&str> = line.trim().split(':').collect();
            if parts.len() > 1 && parts[0] == user && parts[1].starts_with("!!") {
                disabled = true;
                parts[1] = &parts[1][2..];
            }
            parts.join(":")
        })
        .collect();

    if disabled {
        let mut out = lines.join("\n");
        out.push('\n');
        fs::write(passwd, out)?;
    }
    Ok(disabled)
}

impl Buildroot {
    /// Creates or refreshes the root.
    ///
    /// A root that does not exist yet, or was cleaned during this invocation,
    /// gets the configured setup command; an existing one is updated.
    ///
    /// # Errors
    ///
    /// Returns the first failure after running the `initfailed` hooks.
    pub fn init(&mut self) -> Result<(), Error> {
        let fresh = self.was_cleaned || !self.paths.rootdir.exists();
        self.set_state(State::Init);

        for dir in [&self.paths.basedir, &self.paths.rootdir] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::root(format!("creating {}", dir.display()), e))?;
        }
        self.create_resultdir()?;

        self.with_buildroot_lock(|root| {
            root.reset_logging();
            root.init_locked(fresh).inspect_err(|e| {
                warn!(error = %e, "init failed");
                root.set_state(State::InitFailed);
                root.call_hooks(Stage::InitFailed);
            })
        })
    }

    /// Creates the result directory as the invoking user.
    fn create_resultdir(&self) -> Result<(), Error> {
        let (uid, gid) = self.privs.unprivileged();
        let guard = self.privs.drop_temp(uid, gid)?;
        let created = fs::create_dir_all(&self.paths.resultdir);
        guard.restore()?;
        created.map_err(|source| ResultDirError {
            path: self.paths.resultdir.clone(),
            source,
        })?;
        Ok(())
    }

    fn init_locked(&mut self, fresh: bool) -> Result<(), Error> {
        self.call_hooks(Stage::Preinit);

        populate_root(&self.paths.rootdir, &self.config)
            .map_err(|e| Error::root("populating root", e))?;
        self.setup_dev()?;

        self.set_state(State::RunningYum);
        let mounts = self.mount()?;
        let result = self.init_mounted(fresh);
        let unmounted = mounts.finish();
        result?;
        unmounted?;
        Ok(())
    }

    fn init_mounted(&mut self, fresh: bool) -> Result<(), Error> {
        if fresh {
            let setup = self.config.chroot_setup_cmd.clone();
            self.yum(&setup, true)?;
        } else {
            self.update_packages()?;
        }

        self.make_build_user()?;
        self.build_dir_setup()?;

        let localtime = self.paths.in_root("/etc/localtime");
        copy_host_file(Path::new("/etc/localtime"), &localtime)
            .map_err(|e| Error::root("copying /etc/localtime", e))?;

        self.call_hooks(Stage::Postinit);
        Ok(())
    }

    /// Runs `argv` inside the root; with `check` a non-zero exit is an error.
    fn run_in_root(&self, argv: Vec<String>, check: bool) -> Result<CommandOutput, Error> {
        let command = self.chroot_command(argv);
        let output = self.runner.run(&command)?;
        if check && !output.success() {
            return Err(Error::RootCommand {
                command: command.display(),
                code: output.exit_code,
            });
        }
        if !output.success() {
            debug!(command = %command.display(), code = output.exit_code, "ignored failure");
        }
        Ok(output)
    }

    /// Recreates the build user and group with the configured ids.
    fn make_build_user(&mut self) -> Result<(), Error> {
        if !self.paths.in_root("/usr/sbin/useradd").exists() {
            return Err(Error::root(
                "Could not find useradd in chroot, maybe the install failed?",
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        let home = self.paths.homedir();
        remove_tree(&home, self.selinux, self.runner.as_ref())
            .map_err(|e| Error::root(format!("removing {}", home.display()), e))?;

        let user = self.config.chrootuser.clone();
        let group = self.config.chrootgroup.clone();
        let uid = self.config.chrootuid.to_string();
        let gid = self.config.chrootgid.to_string();

        self.run_in_root(
            vec![
                "/usr/sbin/userdel".into(),
                "-r".into(),
                "-f".into(),
                user.clone(),
            ],
            false,
        )?;
        self.run_in_root(vec!["/usr/sbin/groupdel".into(), group.clone()], false)?;
        self.run_in_root(
            vec!["/usr/sbin/groupadd".into(), "-g".into(), gid.clone(), group],
            true,
        )?;
        self.run_in_root(
            vec![
                "/usr/sbin/useradd".into(),
                "-o".into(),
                "-m".into(),
                "-u".into(),
                uid,
                "-g".into(),
                gid,
                "-d".into(),
                self.config.chroothome.clone(),
                "-N".into(),
                user.clone(),
            ],
            true,
        )?;

        let passwd = self.paths.in_root("/etc/passwd");
        if enable_account(&passwd, &user)
            .map_err(|e| Error::root(format!("updating {}", passwd.display()), e))?
        {
            debug!(user, "build user account enabled");
        }
        Ok(())
    }

    /// Creates the rpm build tree and `.rpmmacros` as the build user.
    fn build_dir_setup(&self) -> Result<(), Error> {
        let (uid, gid) = self.chroot_user();
        let guard = self.privs.drop_temp(uid, gid)?;

        let builddir = self.paths.builddir();
        let macros = self.paths.homedir().join(".rpmmacros");
        let result = create_build_dirs(&builddir)
            .and_then(|()| fs::write(&macros, self.config.rpmmacros()))
            .map_err(|e| Error::root(format!("setting up {}", builddir.display()), e));

        guard.restore()?;
        result
    }

    /// Removes the root.
    ///
    /// Processes still running inside it are sent SIGTERM first. Cleaning a
    /// root that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Error::Lock` if the lock cannot be taken and `Error::Root` if
    /// the tree cannot be removed.
    pub fn clean(&mut self) -> Result<(), Error> {
        self.with_buildroot_lock(|root| {
            root.set_state(State::Clean);
            root.call_hooks(Stage::Clean);
            let killed = kill_orphans(&root.paths.rootdir, Signal::SIGTERM);
            if killed > 0 {
                info!(killed, "terminated processes left in the root");
            }
            root.remove_chroot()?;
            root.was_cleaned = true;
            Ok(())
        })
    }

    /// Removes the given parts of the root and its caches.
    ///
    /// # Errors
    ///
    /// Same as [`Buildroot::clean`].
    pub fn scrub(&mut self, targets: &[ScrubTarget]) -> Result<(), Error> {
        let name = self.config.root_name();
        self.with_buildroot_lock(|root| {
            root.set_state(State::Clean);
            root.reset_logging();
            root.call_hooks(Stage::Clean);

            for target in targets {
                info!(%target, root = %name, "scrubbing");
                match target {
                    ScrubTarget::All => {
                        root.remove_chroot()?;
                        root.was_cleaned = true;
                        root.remove_dir(&root.paths.cachedir)?;
                    }
                    ScrubTarget::Chroot => {
                        root.remove_chroot()?;
                        root.was_cleaned = true;
                    }
                    ScrubTarget::Cache => root.remove_dir(&root.paths.cachedir)?,
                    ScrubTarget::CCache => root.remove_dir(&root.paths.ccache_dir)?,
                    ScrubTarget::RootCache => root.remove_dir(&root.paths.root_cache_dir)?,
                    ScrubTarget::YumCache => root.remove_dir(&root.paths.yum_cache_dir)?,
                }
            }
            Ok(())
        })
    }

    fn remove_dir(&self, path: &Path) -> Result<(), Error> {
        remove_tree(path, self.selinux, self.runner.as_ref())
            .map_err(|e| Error::root(format!("removing {}", path.display()), e))
    }

    /// Moves the base directory aside, drops the buildroot lock and deletes it.
    fn remove_chroot(&mut self) -> Result<(), Error> {
        let basedir = self.paths.basedir.clone();
        if !basedir.exists() {
            debug!(basedir = %basedir.display(), "nothing to remove");
            return Ok(());
        }

        let trash = self.paths.trash_dir();
        self.remove_dir(&trash)?;
        fs::rename(&basedir, &trash).map_err(|e| {
            Error::root(
                format!("moving {} to {}", basedir.display(), trash.display()),
                e,
            )
        })?;
        self.locks.release(LockKind::Buildroot);
        self.remove_dir(&trash)?;
        info!(
            root = %self.config.root_name(),
            "chroot ({}) unlocked and deleted",
            basedir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::sandbox::PrivilegeManager;
    use clap::ValueEnum;

    // ==================== Skeleton ====================

    #[test]
    fn test_populate_root() {
        let tmp = temp_base();
        let base = tmp.path();
        let rootdir = base.join("root");
        let mut config = config(base).with_file("etc/rpm/macros.dist", "%dist .el6\n");
        config.use_host_resolv = false;
        config.finalize();

        populate_root(&rootdir, &config).expect("populate");

        for dir in SKELETON_DIRS {
            assert!(rootdir.join(dir).is_dir(), "missing {dir}");
        }
        for file in SKELETON_FILES {
            assert!(rootdir.join(file).is_file(), "missing {file}");
        }
        assert_eq!(
            fs::read_link(rootdir.join("etc/yum.conf")).expect("symlink"),
            Path::new("yum/yum.conf")
        );
        assert_eq!(
            fs::read_to_string(rootdir.join("etc/yum.conf")).expect("yum.conf"),
            config.yum_conf
        );
        let machine_id = fs::read_to_string(rootdir.join("var/lib/dbus/machine-id")).expect("id");
        assert_eq!(machine_id.len(), 33);
        assert!(machine_id.ends_with('\n'));
        assert!(
            fs::read_to_string(rootdir.join("etc/hosts"))
                .expect("hosts")
                .contains("localhost")
        );
        assert_eq!(
            fs::read_to_string(rootdir.join("etc/rpm/macros.dist")).expect("file"),
            "%dist .el6\n"
        );
    }

    #[test]
    fn test_populate_keeps_existing_files() {
        let tmp = temp_base();
        let base = tmp.path();
        let rootdir = base.join("root");
        let config = config(base).with_file("etc/motd", "new\n");
        fs::create_dir_all(rootdir.join("etc")).expect("etc");
        fs::write(rootdir.join("etc/motd"), "old\n").expect("motd");
        fs::write(rootdir.join("etc/mtab"), "keep").expect("mtab");

        populate_root(&rootdir, &config).expect("populate");
        populate_root(&rootdir, &config).expect("populate twice");

        assert_eq!(fs::read_to_string(rootdir.join("etc/motd")).expect("motd"), "old\n");
        assert_eq!(fs::read_to_string(rootdir.join("etc/mtab")).expect("mtab"), "keep");
    }

    #[test]
    fn test_build_dirs_are_0755() {
        let tmp = temp_base();
        let base = tmp.path();
        let builddir = base.join("builddir/build");
        create_build_dirs(&builddir).expect("create");

        let mut found: Vec<String> = fs::read_dir(&builddir)
            .expect("read")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        found.sort();
        let mut expected: Vec<String> = BUILD_SUBDIRS.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(found, expected);

        for sub in BUILD_SUBDIRS {
            let mode = fs::metadata(builddir.join(sub)).expect("stat").permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_enable_account() {
        let tmp = temp_base();
        let base = tmp.path();
        let passwd = base.join("passwd");
        fs::write(
            &passwd,
            "root:x:0:0:root:/root:/bin/bash\nmockbuild:!!:1000:135::/builddir:/bin/bash\n",
        )
        .expect("passwd");

        assert!(enable_account(&passwd, "mockbuild").expect("enable"));
        assert_eq!(
            fs::read_to_string(&passwd).expect("read"),
            "root:x:0:0:root:/root:/bin/bash\nmockbuild::1000:135::/builddir:/bin/bash\n"
        );
        assert!(!enable_account(&passwd, "mockbuild").expect("no-op"));
    }

    #[test]
    fn test_scrub_target_names() {
        let names: Vec<&str> = ScrubTarget::value_variants()
            .iter()
            .map(|t| t.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["all", "chroot", "cache", "c-cache", "root-cache", "yum-cache"]
        );
        assert_eq!(
            ScrubTarget::from_str("c-cache", false).expect("parse"),
            ScrubTarget::CCache
        );
        assert!(ScrubTarget::from_str("everything", false).is_err());
    }

    // ==================== Build user ====================

    fn fake_root_tree(root: &Buildroot) {
        let rootdir = &root.paths().rootdir;
        fs::create_dir_all(rootdir.join("usr/sbin")).expect("sbin");
        fs::create_dir_all(rootdir.join("etc")).expect("etc");
        fs::write(rootdir.join("usr/sbin/useradd"), "").expect("useradd");
        fs::write(
            rootdir.join("etc/passwd"),
            "mockbuild:!!x:1000:135::/builddir:/bin/bash\n",
        )
        .expect("passwd");
        fs::create_dir_all(root.paths().homedir().join("build/RPMS")).expect("home");
    }

    #[test]
    fn test_make_build_user() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let mut root = buildroot(base, runner.clone());
        fake_root_tree(&root);

        root.make_build_user().expect("user");

        assert!(!root.paths().homedir().exists());
        assert_eq!(
            runner.argvs(),
            vec![
                "/usr/sbin/userdel -r -f mockbuild",
                "/usr/sbin/groupdel mockbuild",
                "/usr/sbin/groupadd -g 135 mockbuild",
                "/usr/sbin/useradd -o -m -u 1000 -g 135 -d /builddir -N mockbuild",
            ]
        );
        assert!(
            runner
                .commands
                .borrow()
                .iter()
                .all(|c| c.root() == Some(root.paths().rootdir.as_path()))
        );
        assert_eq!(
            fs::read_to_string(root.paths().in_root("/etc/passwd")).expect("passwd"),
            "mockbuild:x:1000:135::/builddir:/bin/bash\n"
        );
    }

    #[test]
    fn test_make_build_user_failures() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        runner.reply("userdel", 6, "");
        runner.reply("groupadd", 4, "");
        let mut root = buildroot(base, runner.clone());

        assert!(matches!(root.make_build_user(), Err(Error::Root { .. })));
        assert!(runner.argvs().is_empty());

        fake_root_tree(&root);
        let err = root.make_build_user().expect_err("groupadd fails");
        assert!(matches!(err, Error::RootCommand { code: 4, .. }));
        assert_eq!(err.exit_code(), 20);
    }

    #[test]
    fn test_build_dir_setup_writes_rpmmacros() {
        let tmp = temp_base();
        let base = tmp.path();
        let root = buildroot(base, ScriptedRunner::default());

        root.build_dir_setup().expect("setup");
        for sub in BUILD_SUBDIRS {
            assert!(root.paths().builddir().join(sub).is_dir());
        }
        let macros =
            fs::read_to_string(root.paths().homedir().join(".rpmmacros")).expect("rpmmacros");
        assert!(macros.contains("%_topdir /builddir/build\n"));
        assert_eq!(root.privileges().depth(), 0);
    }

    #[test]
    fn test_resultdir_failure_maps_to_resultdir_error() {
        let tmp = temp_base();
        let base = tmp.path();
        fs::write(base.join("blocker"), "").expect("file");
        let privs = PrivilegeManager::with_switcher(1000, 1000, Box::new(FakeIds::root()));
        let root = Buildroot::new(
            config(base).with_resultdir(base.join("blocker/result")),
            privs,
        )
        .expect("root");

        let err = root.create_resultdir().expect_err("not a directory");
        assert!(matches!(err, Error::ResultDir(_)));
        assert_eq!(err.exit_code(), 70);
        assert_eq!(root.privileges().depth(), 0);
    }

    // ==================== Clean and scrub ====================

    #[test]
    fn test_clean_absent_root() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());

        root.clean().expect("clean");
        assert!(root.was_cleaned());
        assert!(root.locks().held().is_empty());
        assert!(!root.paths().basedir.exists());
        let history = root.state_history();
        assert!(history.contains(&State::LockBuildroot));
        assert!(history.contains(&State::Clean));
        assert_eq!(history.last(), Some(&State::UnlockBuildroot));

        root.clean().expect("clean again");
    }

    #[test]
    fn test_clean_removes_tree_and_stale_trash() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());
        let paths = root.paths().clone();
        fs::create_dir_all(paths.rootdir.join("usr/bin")).expect("tree");
        fs::write(paths.rootdir.join("usr/bin/true"), "").expect("file");
        fs::create_dir_all(paths.trash_dir().join("old")).expect("trash");

        root.clean().expect("clean");
        assert!(!paths.basedir.exists());
        assert!(!paths.trash_dir().exists());
        assert!(!root.locks().is_held(LockKind::Buildroot));
    }

    #[test]
    fn test_scrub_selected_caches() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());
        let paths = root.paths().clone();
        for dir in [&paths.ccache_dir, &paths.yum_cache_dir, &paths.root_cache_dir] {
            fs::create_dir_all(dir).expect("cache dir");
        }
        fs::create_dir_all(&paths.rootdir).expect("root");

        root.scrub(&[ScrubTarget::CCache, ScrubTarget::YumCache])
            .expect("scrub");
        assert!(!paths.ccache_dir.exists());
        assert!(!paths.yum_cache_dir.exists());
        assert!(paths.root_cache_dir.exists());
        assert!(paths.rootdir.exists());
        assert!(!root.was_cleaned());

        root.scrub(&[ScrubTarget::All]).expect("scrub all");
        assert!(!paths.cachedir.exists());
        assert!(!paths.basedir.exists());
        assert!(root.was_cleaned());
        assert!(root.locks().held().is_empty());
    }
}
