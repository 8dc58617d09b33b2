//! Building packages inside the root.
//!
//! The steps that write into the build tree run as the build user. The
//! installer and the hooks run with whatever privileges they need.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::tree::{copy_path, copy_tree, remove_tree};
use super::{BUILD_LOG, Buildroot, State};
use crate::error::{BuildError, ConfigError, Error, PkgError};
use crate::plugins::Stage;
use crate::sandbox::{ChrootCommand, CommandOutput};

/// Finds the single spec file unpacked from `srpm` in `specs_dir`.
///
/// # Errors
///
/// Returns `PkgError::NoSpec` when there is none and `PkgError::MultipleSpecs`
/// when there are several.
pub fn locate_spec(specs_dir: &Path, srpm: &Path) -> Result<PathBuf, PkgError> {
    let mut specs: Vec<PathBuf> = fs::read_dir(specs_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "spec"))
                .collect()
        })
        .unwrap_or_default();
    specs.sort();

    match specs.len() {
        0 => Err(PkgError::NoSpec {
            srpm: srpm.to_path_buf(),
        }),
        1 => Ok(specs.remove(0)),
        _ => Err(PkgError::MultipleSpecs {
            srpm: srpm.to_path_buf(),
            specs: specs
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
        }),
    }
}

/// `*.rpm` files directly in `dir`, sorted. A missing directory yields none.
#[must_use]
pub fn collect_packages(dir: &Path) -> Vec<PathBuf> {
    let mut packages: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "rpm"))
                .collect()
        })
        .unwrap_or_default();
    packages.sort();
    packages
}

fn build_io(context: impl Into<String>) -> impl FnOnce(io::Error) -> BuildError {
    let context = context.into();
    move |source| BuildError::Io { context, source }
}

fn missing(path: &Path) -> impl FnOnce(io::Error) -> PkgError + '_ {
    move |source| PkgError::Missing {
        path: path.to_path_buf(),
        source,
    }
}

impl Buildroot {
    /// Cleans, initializes and builds each of `srpms` in turn.
    ///
    /// The cleanup policies apply once at the end: on success the root is
    /// cleaned when `cleanup_on_success` is set and `createrepo` runs when
    /// configured; on failure it is cleaned when `cleanup_on_failure` is set
    /// and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::Usage` without packages, `ConfigError::ResultDirRequired`
    /// for several packages without an explicit result directory, or the
    /// first step that failed.
    pub fn rebuild(&mut self, srpms: &[PathBuf], clean_first: bool) -> Result<Vec<PathBuf>, Error> {
        if srpms.is_empty() {
            return Err(Error::Usage(
                "No package specified to rebuild command.".to_string(),
            ));
        }
        if srpms.len() > 1 && self.config.resultdir.is_none() {
            return Err(ConfigError::ResultDirRequired.into());
        }

        let result = self
            .rebuild_each(srpms, clean_first)
            .and_then(|packages| {
                self.cleanup_after_success()?;
                if self.config.createrepo_on_rpms {
                    self.createrepo()?;
                }
                Ok(packages)
            });
        result.map_err(|e| self.cleanup_after_failure(e))
    }

    fn rebuild_each(&mut self, srpms: &[PathBuf], clean_first: bool) -> Result<Vec<PathBuf>, Error> {
        let mut results = Vec::new();
        for srpm in srpms {
            let start = Instant::now();
            info!("Start({})  Config({})", srpm.display(), self.config.root_name());
            if self.needs_clean(clean_first) {
                self.clean()?;
            }
            self.init()?;
            results.extend(self.build(srpm, self.config.rpmbuild_timeout)?);
            log_done(srpm, &self.config.root_name(), start);
            info!("Results and/or logs in: {}", self.paths.resultdir.display());
        }
        Ok(results)
    }

    /// Cleans, initializes and builds a source package from `spec` and `sources`.
    ///
    /// # Errors
    ///
    /// Returns the first step that failed, after applying the failure policy.
    pub fn rebuild_spec(
        &mut self,
        spec: &Path,
        sources: &Path,
        clean_first: bool,
    ) -> Result<PathBuf, Error> {
        let start = Instant::now();
        let name = spec
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Start({name})  Config({})", self.config.root_name());

        let result = self
            .rebuild_spec_once(spec, sources, clean_first)
            .inspect(|_| log_done(Path::new(&name), &self.config.root_name(), start))
            .and_then(|srpm| {
                info!("Results and/or logs in: {}", self.paths.resultdir.display());
                self.cleanup_after_success()?;
                Ok(srpm)
            });
        result.map_err(|e| self.cleanup_after_failure(e))
    }

    fn rebuild_spec_once(
        &mut self,
        spec: &Path,
        sources: &Path,
        clean_first: bool,
    ) -> Result<PathBuf, Error> {
        if self.needs_clean(clean_first) {
            self.clean()?;
        }
        self.init()?;
        self.buildsrpm(spec, sources, self.config.rpmbuild_timeout)
    }

    /// Whether a rebuild starts from a fresh root.
    ///
    /// A root that is already clean is reused, and so is every root while
    /// building from source control.
    fn needs_clean(&self, clean_first: bool) -> bool {
        clean_first && self.state() != State::Clean && !self.config.scm_enabled
    }

    fn cleanup_after_success(&mut self) -> Result<(), Error> {
        if self.config.cleanup_on_success {
            info!("Cleaning up build root ('cleanup_on_success=True')");
            self.clean()?;
        }
        Ok(())
    }

    /// Applies the failure policy and hands back the original error.
    fn cleanup_after_failure(&mut self, error: Error) -> Error {
        warn!(error = %error, root = %self.config.root_name(), "Build failed");
        info!("Results and/or logs in: {}", self.paths.resultdir.display());
        if self.config.cleanup_on_failure {
            info!("Cleaning up build root ('cleanup_on_failure=True')");
            if let Err(e) = self.clean() {
                warn!(error = %e, "Cleanup after failure failed");
            }
        }
        error
    }

    /// Indexes the result directory as the invoking user.
    fn createrepo(&mut self) -> Result<(), Error> {
        info!("Running createrepo on binary rpms in resultdir");
        let mut argv: Vec<String> = self
            .config
            .createrepo_command
            .split_whitespace()
            .map(String::from)
            .collect();
        argv.push(self.paths.resultdir.to_string_lossy().into_owned());

        let (uid, gid) = self.privs.unprivileged();
        let guard = self.privs.drop_temp(uid, gid)?;
        let result = self.runner.run(&ChrootCommand::new(argv));
        guard.restore()?;

        let output = result?;
        if !output.success() {
            warn!(code = output.exit_code, "createrepo failed");
        }
        Ok(())
    }

    /// Builds binary packages from `srpm` and copies every package produced
    /// to the result directory, returning their paths there.
    ///
    /// The root must have been initialized.
    ///
    /// # Errors
    ///
    /// Returns `PkgError` for an unusable source package, `BuildError` when a
    /// build step fails and `Error::Exec` when one times out.
    pub fn build(&mut self, srpm: &Path, timeout: Option<Duration>) -> Result<Vec<PathBuf>, Error> {
        self.call_hooks(Stage::EarlyPrebuild);
        self.setup_dev()?;
        let mounts = self.mount()?;

        let (uid, gid) = self.chroot_user();
        let result = match self.privs.drop_temp(uid, gid) {
            Ok(guard) => {
                let built = self.build_as_user(srpm, timeout);
                guard.restore().map_err(Error::from).and(built)
            }
            Err(e) => Err(e.into()),
        };
        let unmounted = mounts.finish();
        let packages = result?;
        unmounted?;

        self.call_hooks(Stage::Postbuild);
        Ok(packages)
    }

    fn build_as_user(&mut self, srpm: &Path, timeout: Option<Duration>) -> Result<Vec<PathBuf>, Error> {
        self.set_state(State::Setup);
        let builddir = self.paths.builddir();

        let chroot_srpm = self.copy_srpm_into_chroot(srpm)?;
        self.run_build_step(
            "rpm -Uvh",
            vec![
                "rpm".to_string(),
                "-Uvh".to_string(),
                "--nodeps".to_string(),
                chroot_srpm.to_string_lossy().into_owned(),
            ],
            None,
        )?;

        let spec = locate_spec(&builddir.join("SPECS"), srpm)?;
        let chroot_spec = self.to_chroot_path(&spec);
        self.set_state(State::Build);

        self.rpmbuild("-bs", &chroot_spec, timeout)?;
        let srpms_dir = builddir.join("SRPMS");
        let rebuilt = collect_packages(&srpms_dir);
        if rebuilt.len() != 1 {
            warn!("Expected to find single rebuilt srpm, found {}.", rebuilt.len());
        }
        let Some(rebuilt_srpm) = rebuilt.first() else {
            return Err(BuildError::NoArtifacts { dir: srpms_dir }.into());
        };
        self.install_build_deps(std::slice::from_ref(rebuilt_srpm))?;
        self.set_state(State::Build);

        self.call_hooks(Stage::Prebuild);
        self.rpmbuild("-bb", &chroot_spec, timeout)?;

        let mut packages = collect_packages(&builddir.join("RPMS"));
        packages.extend(collect_packages(&srpms_dir));
        debug!("Copying packages to result dir");
        self.copy_to_resultdir(&packages)
    }

    /// Builds a source package from `spec` and `sources` and copies it to the
    /// result directory.
    ///
    /// `sources` may be a directory, which replaces `SOURCES`, or a single file.
    ///
    /// # Errors
    ///
    /// Same as [`Buildroot::build`].
    pub fn buildsrpm(
        &mut self,
        spec: &Path,
        sources: &Path,
        timeout: Option<Duration>,
    ) -> Result<PathBuf, Error> {
        self.call_hooks(Stage::EarlyPrebuild);
        let mounts = self.mount()?;

        let (uid, gid) = self.chroot_user();
        let result = match self.privs.drop_temp(uid, gid) {
            Ok(guard) => {
                let built = self.buildsrpm_as_user(spec, sources, timeout);
                guard.restore().map_err(Error::from).and(built)
            }
            Err(e) => Err(e.into()),
        };
        let unmounted = mounts.finish();
        let srpm = result?;
        unmounted?;

        self.call_hooks(Stage::Postbuild);
        Ok(srpm)
    }

    fn buildsrpm_as_user(
        &mut self,
        spec: &Path,
        sources: &Path,
        timeout: Option<Duration>,
    ) -> Result<PathBuf, Error> {
        self.set_state(State::Setup);
        let builddir = self.paths.builddir();

        let host_spec = copy_path(spec, &builddir.join("SPECS")).map_err(missing(spec))?;
        let sources = fs::canonicalize(sources).map_err(missing(sources))?;
        let sources_dir = builddir.join("SOURCES");
        if sources.is_dir() {
            remove_tree(&sources_dir, self.selinux, self.runner.as_ref())
                .map_err(build_io(format!("removing {}", sources_dir.display())))?;
            copy_tree(&sources, &sources_dir).map_err(missing(&sources))?;
        } else {
            copy_path(&sources, &sources_dir).map_err(missing(&sources))?;
        }

        let chroot_spec = self.to_chroot_path(&host_spec);
        self.set_state(State::Buildsrpm);
        self.rpmbuild("-bs", &chroot_spec, timeout)?;

        let srpms_dir = builddir.join("SRPMS");
        let srpms = collect_packages(&srpms_dir);
        if srpms.len() != 1 {
            warn!("Expected to find single rebuilt srpm, found {}.", srpms.len());
        }
        let Some(srpm) = srpms.first() else {
            return Err(BuildError::NoArtifacts { dir: srpms_dir }.into());
        };
        debug!("Copying package to result dir");
        let mut copied = self.copy_to_resultdir(std::slice::from_ref(srpm))?;
        Ok(copied.remove(0))
    }

    /// Copies `srpm` to `originals` and returns its path inside the root.
    fn copy_srpm_into_chroot(&self, srpm: &Path) -> Result<PathBuf, Error> {
        let originals = self.paths.builddir().join("originals");
        let host = copy_path(srpm, &originals).map_err(missing(srpm))?;
        Ok(self.to_chroot_path(&host))
    }

    /// Maps a host path below the root to the path seen from inside it.
    fn to_chroot_path(&self, host: &Path) -> PathBuf {
        host.strip_prefix(&self.paths.rootdir)
            .map(|inner| Path::new("/").join(inner))
            .unwrap_or_else(|_| host.to_path_buf())
    }

    fn copy_to_resultdir(&self, packages: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
        let resultdir = &self.paths.resultdir;
        let mut copied = Vec::with_capacity(packages.len());
        for package in packages {
            let dest = copy_path(package, resultdir).map_err(build_io(format!(
                "copying {} to {}",
                package.display(),
                resultdir.display()
            )))?;
            let (uid, gid) = self.privs.unprivileged();
            if let Err(e) = self.privs.change_owner(&dest, uid, gid) {
                warn!(path = %dest.display(), error = %e, "Could not hand result to invoking user");
            }
            copied.push(dest);
        }
        Ok(copied)
    }

    fn rpmbuild(&mut self, mode: &str, chroot_spec: &Path, timeout: Option<Duration>) -> Result<(), Error> {
        let script = format!(
            "rpmbuild {mode} --target {} --nodeps {}",
            self.config.rpmbuild_arch(),
            chroot_spec.display()
        );
        self.run_build_step(
            &format!("rpmbuild {mode}"),
            vec!["bash".to_string(), "--login".to_string(), "-c".to_string(), script],
            timeout,
        )
    }

    /// Runs one build command in the root as the build user, logging its
    /// output to the build log.
    fn run_build_step(
        &mut self,
        step: &str,
        argv: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let (uid, gid) = self.chroot_user();
        let command = self
            .chroot_command(argv)
            .as_user(uid, gid)
            .with_cwd(&self.paths.chroot_home)
            .with_timeout(timeout);
        info!(command = %command.display(), "Executing");

        let output = self.runner.run(&command)?;
        self.append_build_log(&command, &output);
        if output.success() {
            Ok(())
        } else {
            Err(BuildError::Failed {
                step: step.to_string(),
                code: output.exit_code,
            }
            .into())
        }
    }

    /// Appends a command and its output to the build log; best effort.
    fn append_build_log(&self, command: &ChrootCommand, output: &CommandOutput) {
        let path = self.paths.resultdir.join(BUILD_LOG);
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                writeln!(file, "+ {}", command.display())?;
                file.write_all(output.combined().as_bytes())
            });
        if let Err(e) = written {
            debug!(path = %path.display(), error = %e, "Build log not written");
        }
    }
}

fn log_done(what: &Path, root: &str, start: Instant) {
    let elapsed = start.elapsed().as_secs();
    info!(
        "Done({}) Config({root}) {} minutes {} seconds",
        what.display(),
        elapsed / 60,
        elapsed % 60
    );
}

#[cfg(test)]
mod tests {
    use super::super::setup::create_build_dirs;
    use super::super::testing::*;
    use super::*;

    fn touch_all(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).expect("dir");
        for name in names {
            fs::write(dir.join(name), name.as_bytes()).expect("file");
        }
    }

    // ==================== Helpers ====================

    #[test]
    fn test_locate_spec() {
        let tmp = temp_base();
        let base = tmp.path();
        let specs = base.join("SPECS");
        let srpm = Path::new("foo-1.0-1.src.rpm");

        assert!(matches!(
            locate_spec(&specs, srpm),
            Err(PkgError::NoSpec { .. })
        ));

        touch_all(&specs, &["foo.spec", "README"]);
        assert_eq!(locate_spec(&specs, srpm).expect("spec"), specs.join("foo.spec"));

        touch_all(&specs, &["bar.spec"]);
        match locate_spec(&specs, srpm) {
            Err(PkgError::MultipleSpecs { specs, .. }) => {
                assert_eq!(specs, vec!["bar.spec", "foo.spec"]);
            }
            other => panic!("expected MultipleSpecs, got {other:?}"),
        }
    }

    #[test]
    fn test_collect_packages() {
        let tmp = temp_base();
        let base = tmp.path();
        assert!(collect_packages(&base.join("absent")).is_empty());

        touch_all(base, &["b-1.x86_64.rpm", "a-1.noarch.rpm", "notes.txt"]);
        fs::create_dir_all(base.join("sub.rpm")).expect("dir");
        assert_eq!(
            collect_packages(base),
            vec![base.join("a-1.noarch.rpm"), base.join("b-1.x86_64.rpm")]
        );
    }

    // ==================== Rebuild preconditions ====================

    #[test]
    fn test_rebuild_without_packages() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());
        let err = root.rebuild(&[], true).expect_err("no packages");
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(err.exit_code(), 50);
    }

    #[test]
    fn test_rebuild_several_needs_resultdir() {
        let tmp = temp_base();
        let base = tmp.path();
        let mut root = buildroot(base, ScriptedRunner::default());
        let err = root
            .rebuild(&[PathBuf::from("a.src.rpm"), PathBuf::from("b.src.rpm")], true)
            .expect_err("resultdir required");
        assert!(matches!(err, Error::Config(ConfigError::ResultDirRequired)));
        assert_eq!(err.exit_code(), 5);
        assert_eq!(root.state(), State::Start);
    }

    #[test]
    fn test_scm_builds_skip_clean_first() {
        let tmp = temp_base();
        let base = tmp.path();
        let root = buildroot(base, ScriptedRunner::default());
        assert_eq!(root.state(), State::Start);
        assert!(root.needs_clean(true));
        assert!(!root.needs_clean(false));

        let scm_root = buildroot_with(config(base).with_scm(), ScriptedRunner::default());
        assert!(!scm_root.needs_clean(true));
    }

    // ==================== Build steps ====================

    fn prepared(base: &Path, runner: &ScriptedRunner) -> (Buildroot, PathBuf) {
        let root = buildroot(base, runner.clone());
        create_build_dirs(&root.paths().builddir()).expect("build dirs");
        fs::create_dir_all(&root.paths().resultdir).expect("resultdir");
        let srpm = base.join("foo-1.0-1.src.rpm");
        fs::write(&srpm, b"srpm").expect("srpm");
        (root, srpm)
    }

    #[test]
    fn test_build_steps_and_results() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let (mut root, srpm) = prepared(base, &runner);
        let builddir = root.paths().builddir();
        touch_all(&builddir.join("SPECS"), &["foo.spec"]);
        touch_all(&builddir.join("SRPMS"), &["foo-1.0-1.src.rpm"]);
        touch_all(&builddir.join("RPMS"), &["foo-1.0-1.x86_64.rpm"]);

        let results = root.build_as_user(&srpm, None).expect("build");

        let resultdir = root.paths().resultdir.clone();
        assert_eq!(
            results,
            vec![
                resultdir.join("foo-1.0-1.x86_64.rpm"),
                resultdir.join("foo-1.0-1.src.rpm")
            ]
        );
        assert!(builddir.join("originals/foo-1.0-1.src.rpm").is_file());
        assert_eq!(root.state(), State::Build);
        assert!(root.state_history().contains(&State::RunningYum));

        let arch = root.config().rpmbuild_arch().to_string();
        let argvs = runner.argvs();
        assert_eq!(
            argvs[0],
            "rpm -Uvh --nodeps /builddir/build/originals/foo-1.0-1.src.rpm"
        );
        assert_eq!(
            argvs[1],
            format!("bash --login -c rpmbuild -bs --target {arch} --nodeps /builddir/build/SPECS/foo.spec")
        );
        assert!(argvs[2].starts_with("/usr/bin/yum-builddep"));
        assert!(argvs[2].ends_with("SRPMS/foo-1.0-1.src.rpm"));
        assert_eq!(argvs[3], "ccache -M 4G");
        assert!(argvs[4].contains("rpmbuild -bb"));

        let commands = runner.commands.borrow();
        assert_eq!(commands[0].user(), Some((1000, 135)));
        assert_eq!(commands[0].root(), Some(root.paths().rootdir.as_path()));

        let log = fs::read_to_string(resultdir.join(BUILD_LOG)).expect("build log");
        assert!(log.contains("+ rpm -Uvh --nodeps"));

        drop(commands);
    }

    #[test]
    fn test_missing_spec_stops_in_setup() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let (mut root, srpm) = prepared(base, &runner);

        let err = root.build_as_user(&srpm, None).expect_err("no spec");
        assert!(matches!(err, Error::Pkg(PkgError::NoSpec { .. })));
        assert_eq!(err.exit_code(), 40);
        assert_eq!(root.state(), State::Setup);
        assert!(!root.state_history().contains(&State::Build));
    }

    #[test]
    fn test_missing_srpm_is_pkg_error() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let (mut root, _) = prepared(base, &runner);

        let err = root
            .build_as_user(&base.join("absent.src.rpm"), None)
            .expect_err("missing");
        assert!(matches!(err, Error::Pkg(PkgError::Missing { .. })));
        assert!(runner.argvs().is_empty());
    }

    #[test]
    fn test_failed_rpmbuild() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        runner.reply("rpmbuild -bs", 1, "error: Bad source\n");
        let (mut root, srpm) = prepared(base, &runner);
        touch_all(&root.paths().builddir().join("SPECS"), &["foo.spec"]);

        let err = root.build_as_user(&srpm, None).expect_err("rpmbuild fails");
        assert!(matches!(
            err,
            Error::Build(BuildError::Failed { ref step, code: 1 }) if step == "rpmbuild -bs"
        ));
        assert_eq!(err.exit_code(), 10);
        let log = fs::read_to_string(root.paths().resultdir.join(BUILD_LOG)).expect("log");
        assert!(log.contains("error: Bad source"));
    }

    #[test]
    fn test_buildsrpm_from_sources_dir() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let (mut root, _) = prepared(base, &runner);
        let builddir = root.paths().builddir();
        touch_all(&builddir.join("SOURCES"), &["stale.tar.gz"]);
        touch_all(&builddir.join("SRPMS"), &["bar-2.0-1.src.rpm"]);

        let spec = base.join("bar.spec");
        fs::write(&spec, "Name: bar\n").expect("spec");
        let sources = base.join("sources");
        touch_all(&sources, &["bar-2.0.tar.gz", "bar.patch"]);

        let srpm = root
            .buildsrpm_as_user(&spec, &sources, Some(Duration::from_secs(60)))
            .expect("buildsrpm");
        assert_eq!(srpm, root.paths().resultdir.join("bar-2.0-1.src.rpm"));
        assert!(builddir.join("SPECS/bar.spec").is_file());
        assert!(builddir.join("SOURCES/bar.patch").is_file());
        assert!(!builddir.join("SOURCES/stale.tar.gz").exists());
        assert_eq!(root.state(), State::Buildsrpm);

        let commands = runner.commands.borrow();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].timeout(), Some(Duration::from_secs(60)));
        assert!(commands[0].argv()[3].ends_with("/builddir/build/SPECS/bar.spec"));

        drop(commands);
    }

    #[test]
    fn test_buildsrpm_single_source_file() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        let (mut root, _) = prepared(base, &runner);
        let builddir = root.paths().builddir();

        let spec = base.join("baz.spec");
        fs::write(&spec, "Name: baz\n").expect("spec");
        let tarball = base.join("baz-1.tar.gz");
        fs::write(&tarball, b"tar").expect("tarball");

        let err = root
            .buildsrpm_as_user(&spec, &tarball, None)
            .expect_err("no srpm produced");
        assert!(matches!(err, Error::Build(BuildError::NoArtifacts { .. })));
        assert!(builddir.join("SOURCES/baz-1.tar.gz").is_file());
    }
}
