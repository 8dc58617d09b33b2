//! External package installer.
//!
//! The installer runs on the host with `--installroot` pointing at the root,
//! wrapped in the `preyum`/`postyum` hooks so the package cache stays locked
//! for the duration.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{Buildroot, State};
use crate::config::BuildConfig;
use crate::error::{Error, InstallerError};
use crate::plugins::Stage;
use crate::sandbox::ChrootCommand;

/// Installer output marking a package that could not be resolved.
pub const NO_PACKAGE_MARKER: &str = "no package found for";

/// Builds the installer argv for `args`.
///
/// A leading `builddep` selects `yum_builddep_path` and is dropped.
#[must_use]
pub fn installer_argv(config: &BuildConfig, rootdir: &Path, args: &[String]) -> Vec<String> {
    let (program, args) = match args.split_first() {
        Some((first, rest)) if first == "builddep" => (&config.yum_builddep_path, rest),
        _ => (&config.yum_path, args),
    };

    let mut argv = vec![
        program.to_string_lossy().into_owned(),
        "--installroot".to_string(),
        rootdir.to_string_lossy().into_owned(),
    ];
    if !config.online {
        argv.push("-C".to_string());
    }
    argv.extend(args.iter().cloned());
    argv
}

/// Finds the first line reporting an unresolvable package.
#[must_use]
pub fn check_installer_output(output: &str) -> Option<&str> {
    output
        .lines()
        .find(|line| line.to_lowercase().contains(NO_PACKAGE_MARKER))
}

impl Buildroot {
    /// Runs the installer with `args`.
    ///
    /// Output is always captured and checked for unresolvable packages. With
    /// `want_output` it is returned; otherwise it is echoed to the log and the
    /// result is empty.
    ///
    /// # Errors
    ///
    /// Returns `InstallerError::Failed` on a non-zero exit,
    /// `InstallerError::NoPackage` when a package could not be found and
    /// `InstallerError::Exec` if the installer cannot be run.
    pub fn yum(&mut self, args: &[String], want_output: bool) -> Result<String, Error> {
        self.set_state(State::RunningYum);
        let argv = installer_argv(&self.config, &self.paths.rootdir, args);
        let command = ChrootCommand::new(argv).with_envs(self.env.iter());
        info!(command = %command.display(), "Running installer");

        self.call_hooks(Stage::Preyum);
        let result = self.runner.run(&command);
        self.call_hooks(Stage::Postyum);

        let output = result.map_err(InstallerError::Exec)?;
        let combined = output.combined();
        if !want_output {
            for line in combined.lines() {
                info!("{line}");
            }
        }
        if let Some(line) = check_installer_output(&combined) {
            return Err(InstallerError::NoPackage {
                line: line.trim().to_string(),
            }
            .into());
        }
        if !output.success() {
            return Err(InstallerError::Failed {
                command: command.display(),
                code: output.exit_code,
            }
            .into());
        }
        debug!(bytes = combined.len(), "Installer finished");
        Ok(if want_output { combined } else { String::new() })
    }

    /// Installs `packages`.
    ///
    /// # Errors
    ///
    /// See [`Buildroot::yum`].
    pub fn install_packages(&mut self, packages: &[String]) -> Result<String, Error> {
        let mut args = vec!["install".to_string()];
        args.extend(packages.iter().cloned());
        self.yum(&args, false)
    }

    /// Updates every installed package.
    ///
    /// # Errors
    ///
    /// See [`Buildroot::yum`].
    pub fn update_packages(&mut self) -> Result<String, Error> {
        self.yum(&["update".to_string()], false)
    }

    /// Removes `packages`.
    ///
    /// # Errors
    ///
    /// See [`Buildroot::yum`].
    pub fn remove_packages(&mut self, packages: &[String]) -> Result<String, Error> {
        let mut args = vec!["remove".to_string()];
        args.extend(packages.iter().cloned());
        self.yum(&args, false)
    }

    /// Installs the build dependencies of `srpms`.
    ///
    /// Runs with root privileges even when called as the build user.
    ///
    /// # Errors
    ///
    /// See [`Buildroot::yum`].
    pub fn install_build_deps(&mut self, srpms: &[PathBuf]) -> Result<String, Error> {
        let mut args = vec!["builddep".to_string()];
        args.extend(srpms.iter().map(|p| p.to_string_lossy().into_owned()));
        let guard = self.privs.elevate_temp()?;
        let result = self.yum(&args, false);
        guard.restore()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::sandbox::{LockKind, PrivilegeManager, SystemRunner};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_installer_argv() {
        let config = BuildConfig::default();
        let argv = installer_argv(&config, Path::new("/r"), &args(&["install", "gcc"]));
        assert_eq!(
            argv,
            vec!["/usr/bin/yum", "--installroot", "/r", "install", "gcc"]
        );
    }

    #[test]
    fn test_builddep_uses_builddep_binary() {
        let config = BuildConfig::default().offline();
        let argv = installer_argv(
            &config,
            Path::new("/r"),
            &args(&["builddep", "/tmp/foo.src.rpm"]),
        );
        assert_eq!(
            argv,
            vec![
                "/usr/bin/yum-builddep",
                "--installroot",
                "/r",
                "-C",
                "/tmp/foo.src.rpm"
            ]
        );
    }

    #[test]
    fn test_check_installer_output() {
        assert_eq!(check_installer_output("Loaded plugins\nok\n"), None);
        assert_eq!(
            check_installer_output("Setting up\nNo Package found for foo-devel\n"),
            Some("No Package found for foo-devel")
        );
    }

    #[test]
    fn test_yum_wraps_cache_hooks() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let mut root = buildroot(base, runner.clone());

        let out = root.yum(&args(&["install", "make"]), true).expect("yum");
        assert!(out.is_empty());
        assert_eq!(root.state(), State::RunningYum);
        assert!(!root.locks().is_held(LockKind::YumCache));

        let argvs = runner.argvs();
        assert_eq!(argvs.len(), 1);
        assert!(argvs[0].ends_with("install make"));
        assert!(runner.commands.borrow()[0].root().is_none());
    }

    #[test]
    fn test_yum_failures() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        runner.reply("install missing", 1, "No package found for missing\n");
        runner.reply("remove", 3, "");
        let mut root = buildroot(base, runner);

        let err = root
            .install_packages(&args(&["missing"]))
            .expect_err("no package");
        assert!(matches!(err, Error::Installer(InstallerError::NoPackage { .. })));
        assert_eq!(err.exit_code(), 30);

        let err = root
            .remove_packages(&args(&["bash"]))
            .expect_err("non-zero exit");
        assert!(matches!(
            err,
            Error::Installer(InstallerError::Failed { code: 3, .. })
        ));
        assert!(root.locks().held().is_empty());
    }

    #[test]
    fn test_install_build_deps_restores_privileges() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let mut root = buildroot(base, runner.clone());

        root.install_build_deps(&[PathBuf::from("/tmp/foo-1.0-1.src.rpm")])
            .expect("builddep");
        assert_eq!(root.privileges().depth(), 0);
        assert!(runner.argvs()[0].starts_with("/usr/bin/yum-builddep"));
    }

    #[test]
    fn test_missing_package_fails_despite_zero_exit() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        runner.reply("yum-builddep", 0, "Getting requirements\nNo Package found for foo-devel\n");
        runner.reply("install", 0, "No Package found for bar\n");
        let mut root = buildroot(base, runner);

        let err = root
            .install_build_deps(&[PathBuf::from("/tmp/foo-1.0-1.src.rpm")])
            .expect_err("unresolved build dependency");
        assert!(matches!(
            err,
            Error::Installer(InstallerError::NoPackage { ref line }) if line == "No Package found for foo-devel"
        ));
        assert_eq!(err.exit_code(), 30);
        assert_eq!(root.privileges().depth(), 0);

        let err = root
            .install_packages(&args(&["bar"]))
            .expect_err("unresolved package");
        assert_eq!(err.exit_code(), 30);
    }

    #[test]
    fn test_installer_output_is_checked_for_real_processes() {
        let tmp = temp_base();
        let mut config = config(tmp.path());
        config.yum_path = PathBuf::from("/bin/echo");
        config.yum_builddep_path = PathBuf::from("/bin/echo");
        let privs = PrivilegeManager::with_switcher(1000, 1000, Box::new(FakeIds::root()));
        let mut root = Buildroot::new(config, privs)
            .expect("build root")
            .with_runner(SystemRunner);

        // echo prints its arguments, so the marker reaches stdout with exit 0
        let err = root
            .install_build_deps(&[PathBuf::from("No Package found for foo-devel")])
            .expect_err("builddep marker detected");
        assert!(matches!(err, Error::Installer(InstallerError::NoPackage { .. })));

        let err = root
            .install_packages(&args(&["No Package found for bar"]))
            .expect_err("install marker detected");
        assert!(matches!(err, Error::Installer(InstallerError::NoPackage { .. })));

        assert_eq!(root.update_packages().expect("update"), "");
        let out = root.yum(&args(&["list"]), true).expect("captured");
        assert!(out.contains("--installroot"));
        assert!(out.trim_end().ends_with("list"));
    }
}
