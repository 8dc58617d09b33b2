//! Interactive modes: shells, one-off commands, package maintenance and copies.

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use tracing::info;

use super::{Buildroot, copy_path};
use crate::error::Error;
use crate::sandbox::{ChrootCommand, OutputMode, kill_orphans};

/// Prompt shown by `--shell`.
pub const SHELL_PROMPT: &str = "roto-chroot> ";

const SHELL: &str = "/bin/sh";

/// Splits `paths` into sources and destination, checking the shape of a copy.
fn split_copy_args<'a>(
    mode: &str,
    paths: &'a [PathBuf],
    dest: &Path,
) -> Result<&'a [PathBuf], Error> {
    let Some((_, sources)) = paths.split_last() else {
        return Err(Error::Usage(format!(
            "Must have source and destinations for {mode}"
        )));
    };
    if sources.is_empty() {
        return Err(Error::Usage(format!(
            "Must have source and destinations for {mode}"
        )));
    }
    if sources.len() > 1 && !dest.is_dir() {
        return Err(Error::Usage(format!(
            "multiple source files and {} is not a directory!",
            dest.display()
        )));
    }
    Ok(sources)
}

impl Buildroot {
    /// Opens a shell in the root, or runs `command` through it.
    ///
    /// Returns the exit code of the shell.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` if the root was never initialized, plus any
    /// lock, device or mount failure.
    pub fn shell(
        &mut self,
        command: Option<&str>,
        unpriv: bool,
        cwd: Option<&Path>,
    ) -> Result<i32, Error> {
        if !self.paths.rootdir.is_dir() {
            return Err(Error::Usage(format!(
                "chroot {} not initialized!",
                self.paths.rootdir.display()
            )));
        }
        let argv = match command {
            Some(script) => vec![SHELL, "-c", script],
            None => vec![SHELL],
        };
        let command = self
            .interactive_command(argv, unpriv, cwd)
            .with_env("SHELL", SHELL)
            .with_env("PS1", SHELL_PROMPT);

        self.with_buildroot_lock(|root| {
            root.setup_dev()?;
            root.with_mounts(|root| root.run_interactive(&command))
        })
    }

    /// Runs `command` inside the root.
    ///
    /// A single argument is handed to the shell so it may carry pipes and
    /// redirections. Returns the command's exit code.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` without a command, plus any lock or mount
    /// failure.
    pub fn chroot(
        &mut self,
        command: &[String],
        unpriv: bool,
        cwd: Option<&Path>,
    ) -> Result<i32, Error> {
        let argv: Vec<String> = match command {
            [] => {
                return Err(Error::Usage(
                    "You must specify a command to run".to_string(),
                ));
            }
            [script] => vec![SHELL.to_string(), "-c".to_string(), script.clone()],
            args => args.to_vec(),
        };
        info!(command = %command.join(" "), "Running in chroot");
        let command = self.interactive_command(argv, unpriv, cwd);

        self.with_buildroot_lock(|root| {
            root.reset_logging();
            root.with_mounts(|root| root.run_interactive(&command))
        })
    }

    /// Installs the build dependencies of `srpms` into the root.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` without packages, plus any installer failure.
    pub fn installdeps(&mut self, srpms: &[PathBuf]) -> Result<(), Error> {
        if srpms.is_empty() {
            return Err(Error::Usage("You must specify an SRPM file.".to_string()));
        }
        self.with_buildroot_lock(|root| {
            root.with_mounts(|root| root.install_build_deps(srpms).map(drop))
        })
    }

    /// Installs `packages` into the root.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` without packages, plus any installer failure.
    pub fn install(&mut self, packages: &[String]) -> Result<(), Error> {
        if packages.is_empty() {
            return Err(Error::Usage(
                "You must specify a package list to install.".to_string(),
            ));
        }
        self.reset_logging();
        self.with_buildroot_lock(|root| {
            root.with_mounts(|root| root.install_packages(packages).map(drop))
        })
    }

    /// Updates every package in the root.
    ///
    /// # Errors
    ///
    /// Returns any lock, mount or installer failure.
    pub fn update(&mut self) -> Result<(), Error> {
        self.reset_logging();
        self.with_buildroot_lock(|root| root.with_mounts(|root| root.update_packages().map(drop)))
    }

    /// Removes `packages` from the root.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` without packages, plus any installer failure.
    pub fn remove(&mut self, packages: &[String]) -> Result<(), Error> {
        if packages.is_empty() {
            return Err(Error::Usage(
                "You must specify a package list to remove.".to_string(),
            ));
        }
        self.reset_logging();
        self.with_buildroot_lock(|root| {
            root.with_mounts(|root| root.remove_packages(packages).map(drop))
        })
    }

    /// Copies host paths into the root.
    ///
    /// The last entry of `paths` is the destination, resolved inside the root.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` for a malformed argument list and `Error::Io`
    /// if a copy fails.
    pub fn copyin(&mut self, paths: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
        self.with_buildroot_lock(|root| {
            root.reset_logging();
            let dest = match paths.last() {
                Some(last) => root.paths.in_root(last),
                None => PathBuf::new(),
            };
            let sources = split_copy_args("copyin", paths, &dest)?;
            copy_all(sources.iter().map(PathBuf::as_path), &dest)
        })
    }

    /// Copies paths out of the root, as the unprivileged user.
    ///
    /// The sources are resolved inside the root; the last entry of `paths` is
    /// a host destination. Privileges are dropped for the rest of the process.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` for a malformed argument list,
    /// `Error::Privilege` if privileges cannot be dropped and `Error::Io` if a
    /// copy fails.
    pub fn copyout(&mut self, paths: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
        self.with_buildroot_lock(|root| {
            root.reset_logging();
            root.privs.drop_forever()?;
            let dest = paths.last().cloned().unwrap_or_default();
            let sources = split_copy_args("copyout", paths, &dest)?;
            let sources: Vec<PathBuf> = sources.iter().map(|p| root.paths.in_root(p)).collect();
            copy_all(sources.iter().map(PathBuf::as_path), &dest)
        })
    }

    /// Sends SIGTERM to every process still running inside the root and
    /// returns how many were signalled.
    #[must_use]
    pub fn orphanskill(&self) -> usize {
        kill_orphans(&self.paths.rootdir, Signal::SIGTERM)
    }

    /// The directory the root lives in.
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.paths.rootdir
    }

    fn interactive_command<I, S>(&self, argv: I, unpriv: bool, cwd: Option<&Path>) -> ChrootCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = self.chroot_command(argv).with_output(OutputMode::Inherit);
        if unpriv {
            let (uid, gid) = self.chroot_user();
            command = command.as_user(uid, gid);
        }
        if let Some(cwd) = cwd {
            command = command.with_cwd(cwd);
        }
        command
    }

    fn run_interactive(&self, command: &ChrootCommand) -> Result<i32, Error> {
        let output = self.runner.run(command)?;
        info!(code = output.exit_code, "Command finished");
        Ok(output.exit_code)
    }

    /// Runs `f` with the ledger mounted, unmounting whatever `f` returns.
    ///
    /// An error from `f` wins over an unmount error.
    fn with_mounts<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        let mounts = self.mount()?;
        let result = f(self);
        let unmounted = mounts.finish();
        let value = result?;
        unmounted?;
        Ok(value)
    }
}

fn copy_all<'a>(
    sources: impl Iterator<Item = &'a Path>,
    dest: &Path,
) -> Result<Vec<PathBuf>, Error> {
    sources
        .map(|src| {
            info!(src = %src.display(), dest = %dest.display(), "copying");
            copy_path(src, dest)
                .map_err(|e| Error::io(format!("copying {} to {}", src.display(), dest.display()), e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::super::testing::*;
    use super::*;
    use crate::sandbox::{LockKind, PrivilegeManager};

    fn paths(list: &[&Path]) -> Vec<PathBuf> {
        list.iter().map(|p| p.to_path_buf()).collect()
    }

    // ========================================================================
    // Argument checks
    // ========================================================================

    #[test]
    fn test_shell_needs_initialized_root() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());
        let err = root.shell(None, false, None).expect_err("no root");
        assert!(err.to_string().contains("not initialized"));
        assert_eq!(err.exit_code(), 50);
        assert!(root.locks().held().is_empty());
    }

    #[test]
    fn test_missing_arguments() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());

        let err = root.chroot(&[], false, None).expect_err("no command");
        assert_eq!(err.to_string(), "You must specify a command to run");
        assert_eq!(err.exit_code(), 50);

        let err = root.installdeps(&[]).expect_err("no srpm");
        assert_eq!(err.to_string(), "You must specify an SRPM file.");
        let err = root.install(&[]).expect_err("no packages");
        assert_eq!(err.to_string(), "You must specify a package list to install.");
        assert!(root.remove(&[]).is_err());

        let err = root.copyin(&[PathBuf::from("/etc/hosts")]).expect_err("no dest");
        assert_eq!(err.to_string(), "Must have source and destinations for copyin");
        assert!(root.copyin(&[]).is_err());
        assert!(root.locks().held().is_empty());
    }

    // ========================================================================
    // Commands
    // ========================================================================

    #[test]
    fn test_interactive_command() {
        let tmp = temp_base();
        let base = tmp.path();
        let root = buildroot(base, ScriptedRunner::default());

        let command = root.interactive_command(["id"], true, Some(Path::new("/tmp")));
        assert_eq!(command.user(), Some((1000, 135)));
        assert_eq!(command.root(), Some(root.root_path()));

        let command = root.interactive_command(["id"], false, None);
        assert_eq!(command.user(), None);
    }

    #[test]
    fn test_run_interactive_propagates_exit_code() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        runner.reply("false", 1, "");
        let root = buildroot(base, runner.clone());

        let command = root.interactive_command(["false"], false, None);
        assert_eq!(root.run_interactive(&command).expect("run"), 1);
        let command = root.interactive_command(["true"], false, None);
        assert_eq!(root.run_interactive(&command).expect("run"), 0);
        assert_eq!(runner.argvs(), vec!["false", "true"]);
    }

    // ========================================================================
    // Copies
    // ========================================================================

    #[test]
    fn test_copyin() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());
        let rootdir = root.root_path().to_path_buf();
        fs::create_dir_all(rootdir.join("tmp")).expect("tmp");

        let host = base.join("host");
        fs::create_dir_all(host.join("tree/sub")).expect("tree");
        fs::write(host.join("tree/sub/file"), "x").expect("file");
        fs::write(host.join("notes"), "y").expect("notes");

        let copied = root
            .copyin(&paths(&[
                &host.join("tree"),
                &host.join("notes"),
                Path::new("/tmp"),
            ]))
            .expect("copyin");
        assert_eq!(copied, vec![rootdir.join("tmp/tree"), rootdir.join("tmp/notes")]);
        assert!(rootdir.join("tmp/tree/sub/file").is_file());
        assert!(!root.locks().is_held(LockKind::Buildroot));

        let err = root
            .copyin(&paths(&[
                &host.join("notes"),
                &host.join("notes"),
                Path::new("/tmp/notes"),
            ]))
            .expect_err("dest not a dir");
        assert!(err.to_string().contains("is not a directory"));
    }

    #[test]
    fn test_copyout_drops_privileges() {
        let tmp = temp_base();
        let base = tmp.path();
        let ids = FakeIds::root();
        let privs = PrivilegeManager::with_switcher(1000, 1000, Box::new(ids.clone()));
        let mut root = Buildroot::new(config(base), privs)
            .expect("build root")
            .with_runner(ScriptedRunner::default());
        let rootdir = root.root_path().to_path_buf();
        fs::create_dir_all(rootdir.join("builddir")).expect("dir");
        fs::write(rootdir.join("builddir/build.log"), "log").expect("log");

        let out = base.join("out.log");
        let copied = root
            .copyout(&paths(&[Path::new("/builddir/build.log"), &out]))
            .expect("copyout");
        assert_eq!(copied, vec![out.clone()]);
        assert_eq!(fs::read_to_string(&out).expect("read"), "log");
        let creds = *ids.state.borrow();
        assert_eq!((creds.ruid, creds.euid, creds.suid), (1000, 1000, 1000));
        assert_eq!(root.privileges().depth(), 0);
    }

    #[test]
    fn test_orphanskill_without_processes() {
        let tmp = temp_base();
        let base = tmp.path();
        let root = buildroot(base, ScriptedRunner::default());
        assert_eq!(root.orphanskill(), 0);
    }
}
