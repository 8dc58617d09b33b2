//! Building from a source control checkout.
//!
//! The package is checked out as the invoking user into a scratch directory,
//! optionally packed into a tarball, completed with sources kept outside
//! source control, and handed to [`Buildroot::rebuild_spec`].

use std::env;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use super::Buildroot;
use super::tree::{copy_path, touch};
use crate::config::{SCM_BRANCH, SCM_PACKAGE, ScmOptions};
use crate::error::{Error, ScmError};
use crate::sandbox::{ChrootCommand, CommandOutput};

/// File in a checkout that turns on tarball creation.
pub const WRITE_TAR_MARKER: &str = ".write_tar";

/// Checkout commands resolved for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmWorker {
    package: String,
    get: Vec<String>,
    postget: Option<Vec<String>>,
    spec: String,
    ext_src_dir: PathBuf,
    write_tar: bool,
}

impl ScmWorker {
    /// Resolves the checkout command for the configured method and branch.
    ///
    /// cvs takes the branch as `-r BRANCH`, svn as a path component (trunk
    /// when unset) and git checks it out after cloning.
    ///
    /// # Errors
    ///
    /// Returns `ScmError::UnsupportedMethod`, `ScmError::PackageNotDefined`, or
    /// `ScmError::BadCommand` when the command has unbalanced quotes.
    pub fn new(options: &ScmOptions) -> Result<Self, ScmError> {
        let method = options.method.as_str();
        let mut get = match method {
            "cvs" => options.cvs_get.clone(),
            "git" => options.git_get.clone(),
            "svn" => options.svn_get.clone(),
            _ => {
                return Err(ScmError::UnsupportedMethod {
                    method: options.method.clone(),
                });
            }
        };

        let mut postget = None;
        match (method, options.branch.as_deref()) {
            ("cvs", Some(branch)) => get = get.replace(SCM_BRANCH, &format!("-r {branch}")),
            ("git", Some(branch)) => {
                postget = Some(vec![
                    "git".to_string(),
                    "checkout".to_string(),
                    branch.to_string(),
                ]);
            }
            ("svn", branch) => get = get.replace(SCM_BRANCH, branch.unwrap_or("trunk")),
            _ => {}
        }
        let get = get.replace(SCM_BRANCH, "");

        let package = options
            .package
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(ScmError::PackageNotDefined)?;
        let get = get.replace(SCM_PACKAGE, &package);
        let get = shlex::split(&get)
            .filter(|argv| !argv.is_empty())
            .ok_or(ScmError::BadCommand { command: get })?;

        Ok(Self {
            spec: options.spec.replace(SCM_PACKAGE, &package),
            package,
            get,
            postget,
            ext_src_dir: options.ext_src_dir.clone(),
            write_tar: options.write_tar,
        })
    }

    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Command run in the scratch directory to check the package out.
    #[must_use]
    pub fn get_command(&self) -> &[String] {
        &self.get
    }

    /// Command run in the checkout afterwards, if any.
    #[must_use]
    pub fn postget_command(&self) -> Option<&[String]> {
        self.postget.as_deref()
    }

    /// Spec file name inside the checkout.
    #[must_use]
    pub fn spec_name(&self) -> &str {
        &self.spec
    }
}

/// Tags read from an expanded spec file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecTags {
    pub name: Option<String>,
    pub version: Option<String>,
    /// File names of every `Source` tag, without any URL.
    pub sources: Vec<String>,
}

/// Reads `Name`, `Version` and `SourceN` from the preamble of `rpmspec -P` output.
#[must_use]
pub fn parse_spec_tags(expanded: &str) -> SpecTags {
    const SECTIONS: &[&str] = &[
        "%description",
        "%prep",
        "%build",
        "%install",
        "%check",
        "%files",
        "%changelog",
    ];

    let mut tags = SpecTags::default();
    for line in expanded.lines().map(str::trim) {
        if SECTIONS.iter().any(|s| line.starts_with(s)) {
            break;
        }
        let Some((tag, value)) = line.split_once(':') else {
            continue;
        };
        let tag = tag.trim().to_ascii_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match tag.as_str() {
            "name" if tags.name.is_none() => tags.name = Some(value.to_string()),
            "version" if tags.version.is_none() => tags.version = Some(value.to_string()),
            _ if tag
                .strip_prefix("source")
                .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit())) =>
            {
                let file = value.rsplit('/').next().unwrap_or(value);
                tags.sources.push(file.to_string());
            }
            _ => {}
        }
    }
    tags
}

/// Finds `name` in `src_dir`, falling back to its lowercase form.
#[must_use]
pub fn find_spec(src_dir: &Path, name: &str) -> Option<PathBuf> {
    [name.to_string(), name.to_lowercase()]
        .into_iter()
        .map(|n| src_dir.join(n))
        .find(|p| p.is_file())
}

/// A prepared checkout; the scratch directory goes away with it.
#[derive(Debug)]
pub struct ScmCheckout {
    workdir: TempDir,
    src_dir: PathBuf,
    spec: PathBuf,
}

impl ScmCheckout {
    /// Checked out package directory, used as the sources.
    #[must_use]
    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    #[must_use]
    pub fn spec(&self) -> &Path {
        &self.spec
    }

    /// Removes the scratch directory.
    pub fn close(self) {
        let path = self.workdir.path().to_path_buf();
        if let Err(e) = self.workdir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove SCM checkout");
        }
    }
}

fn workdir_io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ScmError {
    let context = context.into();
    move |source| ScmError::WorkDir { context, source }
}

impl Buildroot {
    /// Builds a source package from the configured checkout, as with
    /// [`Buildroot::rebuild_spec`], and removes the checkout again.
    ///
    /// # Errors
    ///
    /// Returns `Error::Scm` when the checkout fails, otherwise the errors of
    /// [`Buildroot::rebuild_spec`].
    pub fn scm_buildsrpm(&mut self, clean_first: bool) -> Result<PathBuf, Error> {
        let checkout = self.scm_checkout()?;
        let srpm = self.rebuild_spec(checkout.spec(), checkout.src_dir(), clean_first);
        checkout.close();
        srpm
    }

    /// Checks the configured package out and prepares its sources.
    ///
    /// # Errors
    ///
    /// Returns `Error::Scm` for bad options, failed commands or a checkout
    /// without a spec file.
    #[instrument(skip(self), fields(method = %self.config.scm.method))]
    pub fn scm_checkout(&mut self) -> Result<ScmCheckout, Error> {
        let worker = ScmWorker::new(&self.config.scm)?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!(".roto-scm.{}.", worker.package()))
            .tempdir()
            .map_err(workdir_io("creating scratch directory"))?;
        let (uid, gid) = self.privs.unprivileged();
        if let Err(e) = self.privs.change_owner(workdir.path(), uid, gid) {
            warn!(path = %workdir.path().display(), error = %e, "Could not hand checkout to invoking user");
        }

        let src_dir = workdir.path().join(worker.package());
        self.run_scm_command(worker.get_command(), workdir.path())?;
        if let Some(postget) = worker.postget_command() {
            self.run_scm_command(postget, &src_dir)?;
        }
        info!("Fetched sources from SCM");

        let spec = self.prepare_scm_sources(&worker, workdir.path())?;
        Ok(ScmCheckout {
            workdir,
            src_dir,
            spec,
        })
    }

    /// Locates the spec, writes the tarball if asked, and copies sources
    /// missing from the checkout out of `ext_src_dir`.
    fn prepare_scm_sources(&self, worker: &ScmWorker, workdir: &Path) -> Result<PathBuf, Error> {
        let package = worker.package();
        let src_dir = workdir.join(package);
        let spec = find_spec(&src_dir, worker.spec_name()).ok_or_else(|| ScmError::SpecNotFound {
            path: src_dir.join(worker.spec_name()),
        })?;

        let query = vec![
            "rpmspec".to_string(),
            "-P".to_string(),
            spec.to_string_lossy().into_owned(),
        ];
        let expanded = self.run_scm_command(&query, &src_dir)?;
        let tags = parse_spec_tags(&expanded.stdout);

        if worker.write_tar || src_dir.join(WRITE_TAR_MARKER).exists() {
            let missing = |tag: &str| ScmError::SpecQuery {
                spec: spec.clone(),
                tag: tag.to_string(),
            };
            let name = tags.name.as_deref().ok_or_else(|| missing("Name"))?;
            let version = tags.version.as_deref().ok_or_else(|| missing("Version"))?;
            let tarball = format!("{name}-{version}.tar.gz");
            info!("Writing {}/{tarball}...", src_dir.display());

            let inner = format!("{package}/{tarball}");
            touch(&workdir.join(&inner)).map_err(workdir_io(format!("creating {inner}")))?;
            let tar = vec![
                "tar".to_string(),
                "czf".to_string(),
                inner.clone(),
                "--exclude".to_string(),
                inner,
                format!("--xform=s,^{package},{name}-{version},"),
                package.to_string(),
            ];
            self.run_scm_command(&tar, workdir)?;
        }

        let (uid, gid) = self.privs.unprivileged();
        for source in &tags.sources {
            let dest = src_dir.join(source);
            let external = worker.ext_src_dir.join(source);
            if dest.exists() || !external.is_file() {
                continue;
            }
            debug!(source = %source, "Copying source from {}", worker.ext_src_dir.display());
            copy_path(&external, &dest).map_err(workdir_io(format!("copying {source}")))?;
            if let Err(e) = self.privs.change_owner(&dest, uid, gid) {
                warn!(path = %dest.display(), error = %e, "Could not hand source to invoking user");
            }
        }
        Ok(spec)
    }

    /// Runs a host command in `cwd` as the invoking user.
    fn run_scm_command(&self, argv: &[String], cwd: &Path) -> Result<CommandOutput, Error> {
        let (uid, gid) = self.privs.unprivileged();
        let home = User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.dir);
        let auth_sock = env::var("SSH_AUTH_SOCK").ok().or_else(|| {
            home.as_ref()
                .map(|h| h.join(".ssh/auth_sock").to_string_lossy().into_owned())
        });

        let mut command = ChrootCommand::new(argv.iter().cloned())
            .with_cwd(cwd)
            .as_user(uid, gid)
            .with_env("CVS_RSH", "ssh");
        if let Some(home) = &home {
            command = command.with_env("HOME", home.to_string_lossy());
        }
        if let Some(sock) = auth_sock {
            command = command.with_env("SSH_AUTH_SOCK", sock);
        }
        info!(command = %command.display(), "Executing");

        let output = self.runner.run(&command)?;
        for line in output.stderr.lines() {
            debug!("{line}");
        }
        if !output.success() {
            return Err(ScmError::Command {
                command: command.display(),
                code: output.exit_code,
            }
            .into());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::super::testing::*;
    use super::*;

    fn options(extra: &[&str]) -> ScmOptions {
        let mut options = ScmOptions::default();
        options.set_option("package=hello").expect("package");
        for option in extra {
            options.set_option(option).expect("option");
        }
        options
    }

    // ============================================================================
    // Worker construction
    // ============================================================================

    #[test]
    fn test_git_branch_is_checked_out_after_clone() {
        let worker = ScmWorker::new(&options(&["branch=devel"])).expect("worker");
        assert_eq!(
            worker.get_command(),
            ["git", "clone", "git://localhost/hello.git", "hello"]
        );
        assert_eq!(
            worker.postget_command(),
            Some(["git", "checkout", "devel"].map(String::from).as_slice())
        );
        assert_eq!(worker.spec_name(), "hello.spec");
    }

    #[test]
    fn test_cvs_and_svn_branches() {
        let cvs = ScmWorker::new(&options(&["method=cvs", "branch=f14"])).expect("cvs");
        assert_eq!(
            cvs.get_command(),
            ["cvs", "-d", "/srv/cvs", "co", "-r", "f14", "hello"]
        );
        assert!(cvs.postget_command().is_none());

        let svn = ScmWorker::new(&options(&["method=svn"])).expect("svn");
        assert_eq!(
            svn.get_command(),
            ["svn", "co", "file:///srv/svn/hello/trunk", "hello"]
        );
    }

    #[test]
    fn test_quoted_command_words() {
        let worker = ScmWorker::new(&options(&[
            "git_get=git clone 'ssh://host/My Repos/SCM_PKG.git' SCM_PKG",
        ]))
        .expect("worker");
        assert_eq!(
            worker.get_command(),
            ["git", "clone", "ssh://host/My Repos/hello.git", "hello"]
        );

        let err = ScmWorker::new(&options(&["git_get=git clone 'unterminated"]))
            .expect_err("unbalanced quote");
        assert!(matches!(err, ScmError::BadCommand { .. }));
    }

    #[test]
    fn test_worker_rejections() {
        let err = ScmWorker::new(&ScmOptions::default()).expect_err("no package");
        assert!(matches!(err, ScmError::PackageNotDefined));
        assert_eq!(Error::from(err).exit_code(), 5);

        let err = ScmWorker::new(&options(&["method=hg"])).expect_err("hg");
        assert!(matches!(err, ScmError::UnsupportedMethod { ref method } if method == "hg"));
    }

    // ============================================================================
    // Spec handling
    // ============================================================================

    #[test]
    fn test_parse_spec_tags() {
        let tags = parse_spec_tags(
            "Name:    hello\n\
             Version: 2.10\n\
             Release: 1\n\
             Source0: https://ftp.gnu.org/gnu/hello/hello-2.10.tar.gz\n\
             SOURCE1: hello.conf\n\
             Source:  extra.txt\n\
             SourceLicense: GPL\n\
             %description\n\
             Source2: not-a-tag\n",
        );
        assert_eq!(tags.name.as_deref(), Some("hello"));
        assert_eq!(tags.version.as_deref(), Some("2.10"));
        assert_eq!(tags.sources, ["hello-2.10.tar.gz", "hello.conf", "extra.txt"]);
    }

    #[test]
    fn test_find_spec_falls_back_to_lowercase() {
        let tmp = temp_base();
        let dir = tmp.path();
        assert!(find_spec(dir, "Hello.spec").is_none());

        fs::write(dir.join("hello.spec"), "Name: hello\n").expect("spec");
        assert_eq!(find_spec(dir, "Hello.spec"), Some(dir.join("hello.spec")));
    }

    // ============================================================================
    // Checkout
    // ============================================================================

    fn scm_root(base: &Path, runner: &ScriptedRunner, extra: &[&str]) -> Buildroot {
        let mut config = config(base).with_scm();
        config.scm = options(extra);
        buildroot_with(config, runner.clone())
    }

    #[test]
    fn test_checkout_runs_as_invoking_user() {
        let tmp = temp_base();
        let runner = ScriptedRunner::default();
        let mut root = scm_root(tmp.path(), &runner, &["branch=devel"]);

        // The scripted clone leaves the scratch directory empty.
        let err = root.scm_checkout().expect_err("no spec in checkout");
        assert!(matches!(err, Error::Scm(ScmError::SpecNotFound { .. })));
        assert_eq!(err.exit_code(), 5);

        assert_eq!(
            runner.argvs(),
            [
                "git clone git://localhost/hello.git hello",
                "git checkout devel"
            ]
        );
        let commands = runner.commands.borrow();
        assert!(commands.iter().all(|c| c.user() == Some((1000, 1000))));
        assert!(commands.iter().all(|c| c.root().is_none()));
        assert_eq!(
            commands[0].env().get("CVS_RSH").map(String::as_str),
            Some("ssh")
        );
    }

    #[test]
    fn test_failed_checkout_stops_early() {
        let tmp = temp_base();
        let runner = ScriptedRunner::default();
        runner.reply("git clone", 128, "");
        let mut root = scm_root(tmp.path(), &runner, &["branch=devel"]);

        let err = root.scm_checkout().expect_err("clone fails");
        assert!(matches!(err, Error::Scm(ScmError::Command { code: 128, .. })));
        assert_eq!(err.exit_code(), 50);
        assert_eq!(runner.argvs().len(), 1);
    }

    #[test]
    fn test_prepare_writes_tarball_and_copies_external_sources() {
        let tmp = temp_base();
        let base = tmp.path();
        let ext = base.join("ext");
        fs::create_dir_all(&ext).expect("ext dir");
        fs::write(ext.join("hello.conf"), "conf").expect("ext source");
        fs::write(ext.join("hello.patch"), "from ext").expect("ext source");

        let ext_option = format!("ext_src_dir={}", ext.display());
        let runner = ScriptedRunner::default();
        runner.reply(
            "rpmspec -P",
            0,
            "Name: hello\nVersion: 2.10\nSource0: hello-2.10.tar.gz\nSource1: hello.conf\nPatch0: x\nSource2: hello.patch\n",
        );
        let root = scm_root(base, &runner, &[ext_option.as_str()]);
        let worker = ScmWorker::new(&root.config().scm).expect("worker");

        let workdir = base.join("work");
        let src_dir = workdir.join("hello");
        fs::create_dir_all(&src_dir).expect("checkout");
        fs::write(src_dir.join("hello.spec"), "Name: hello\n").expect("spec");
        fs::write(src_dir.join(WRITE_TAR_MARKER), "").expect("marker");
        fs::write(src_dir.join("hello.patch"), "in checkout").expect("patch");

        let spec = root
            .prepare_scm_sources(&worker, &workdir)
            .expect("prepare");
        assert_eq!(spec, src_dir.join("hello.spec"));

        let argvs = runner.argvs();
        assert_eq!(argvs.len(), 2);
        assert!(argvs[0].starts_with("rpmspec -P "));
        assert_eq!(
            argvs[1],
            "tar czf hello/hello-2.10.tar.gz --exclude hello/hello-2.10.tar.gz \
             --xform=s,^hello,hello-2.10, hello"
        );
        assert!(src_dir.join("hello-2.10.tar.gz").is_file());
        assert_eq!(
            fs::read_to_string(src_dir.join("hello.conf")).expect("copied"),
            "conf"
        );
        assert_eq!(
            fs::read_to_string(src_dir.join("hello.patch")).expect("kept"),
            "in checkout"
        );
    }

    #[test]
    fn test_tarball_needs_name_and_version() {
        let tmp = temp_base();
        let base = tmp.path();
        let runner = ScriptedRunner::default();
        runner.reply("rpmspec -P", 0, "Name: hello\n");
        let root = scm_root(base, &runner, &["write_tar=true"]);
        let worker = ScmWorker::new(&root.config().scm).expect("worker");

        let workdir = base.join("work");
        let src_dir = workdir.join("hello");
        fs::create_dir_all(&src_dir).expect("checkout");
        fs::write(src_dir.join("hello.spec"), "Name: hello\n").expect("spec");

        let err = root
            .prepare_scm_sources(&worker, &workdir)
            .expect_err("no version");
        assert!(matches!(err, Error::Scm(ScmError::SpecQuery { ref tag, .. }) if tag == "Version"));
        assert_eq!(err.exit_code(), 40);
    }
}
