//! Error types for the build sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Every top-level error maps onto a process exit code via [`Error::exit_code`].

// thiserror's generated code reads fields that rustc reports as unused
// assignments on some toolchains.
#![allow(unused_assignments)]

use std::path::PathBuf;

use miette::Diagnostic;
use nix::errno::Errno;
use thiserror::Error;

/// Exit code for a bad command line or configuration.
pub const EXIT_BAD_CMDLINE: i32 = 5;
/// Exit code for an unsupported target architecture.
pub const EXIT_INVALID_ARCH: i32 = 6;
/// Exit code for a failed package build.
pub const EXIT_BUILD: i32 = 10;
/// Exit code for failures preparing the sandbox root.
pub const EXIT_ROOT: i32 = 20;
/// Exit code for installer failures.
pub const EXIT_INSTALLER: i32 = 30;
/// Exit code for malformed source packages.
pub const EXIT_PKG: i32 = 40;
/// Generic failure.
pub const EXIT_GENERIC: i32 = 50;
/// Exit code for lock failures.
pub const EXIT_LOCKED: i32 = 60;
/// Exit code when the result directory cannot be created or written.
pub const EXIT_RESULTDIR: i32 = 70;
/// Exit code when the private mount namespace cannot be created.
pub const EXIT_UNSHARE: i32 = 80;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid command line or configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// Privilege switching failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Lock handling failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),

    /// Mount or namespace failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Mount(#[from] MountError),

    /// Device provisioning failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Device(#[from] DeviceError),

    /// Plugin setup or hook failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Plugin(#[from] PluginError),

    /// Malformed source package
    #[error(transparent)]
    #[diagnostic(transparent)]
    Pkg(#[from] PkgError),

    /// Package installer failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Installer(#[from] InstallerError),

    /// rpmbuild failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),

    /// Result directory not accessible
    #[error(transparent)]
    #[diagnostic(transparent)]
    ResultDir(#[from] ResultDirError),

    /// Command execution failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Exec(#[from] ExecError),

    /// Host requirements not met
    #[error(transparent)]
    #[diagnostic(transparent)]
    System(#[from] SystemError),

    /// Source control checkout failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Scm(#[from] ScmError),

    /// Filesystem failure while preparing the sandbox root
    #[error("Failed to prepare chroot: {context}")]
    #[diagnostic(code(roto::root))]
    Root {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A setup command run inside the root failed
    #[error("{command} failed with status {code}")]
    #[diagnostic(
        code(roto::root::command),
        help("The root may be incomplete; try --clean followed by --init")
    )]
    RootCommand { command: String, code: i32 },

    /// Misuse of a command mode
    #[error("{0}")]
    #[diagnostic(code(roto::usage))]
    Usage(String),

    /// A command run in the chroot exited non-zero; its code is propagated
    #[error("Command exited with status {code}")]
    #[diagnostic(code(roto::command_exit))]
    CommandExit { code: i32 },

    /// I/O error
    #[error("I/O error: {context}")]
    #[diagnostic(code(roto::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wraps an I/O error raised while working on the sandbox root.
    pub fn root(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Root {
            context: context.into(),
            source,
        }
    }

    /// Wraps a generic I/O error.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(ConfigError::InvalidArchitecture { .. }) => EXIT_INVALID_ARCH,
            Self::Config(_) => EXIT_BAD_CMDLINE,
            Self::Privilege(_) => EXIT_GENERIC,
            Self::Lock(_) => EXIT_LOCKED,
            Self::Mount(MountError::Unshare(_)) => EXIT_UNSHARE,
            Self::Mount(_) | Self::Device(_) | Self::Root { .. } | Self::RootCommand { .. } => {
                EXIT_ROOT
            }
            Self::Plugin(PluginError::NotImplemented { .. }) => EXIT_BAD_CMDLINE,
            Self::Plugin(_) => EXIT_ROOT,
            Self::Pkg(_) => EXIT_PKG,
            Self::Installer(_) => EXIT_INSTALLER,
            Self::Build(_) => EXIT_BUILD,
            Self::ResultDir(_) => EXIT_RESULTDIR,
            Self::Exec(ExecError::Timeout { .. }) => EXIT_BUILD,
            Self::Exec(_) => EXIT_GENERIC,
            Self::System(_) => EXIT_GENERIC,
            Self::Scm(ScmError::Command { .. } | ScmError::WorkDir { .. }) => EXIT_GENERIC,
            Self::Scm(ScmError::SpecQuery { .. }) => EXIT_PKG,
            Self::Scm(_) => EXIT_BAD_CMDLINE,
            Self::Usage(_) | Self::Io { .. } => EXIT_GENERIC,
            Self::CommandExit { code } => *code,
        }
    }
}

/// Errors in the command line or configuration files.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Several source packages need an explicit result directory
    #[error("Must specify --resultdir when building multiple RPMS.")]
    #[diagnostic(
        code(roto::config::resultdir_required),
        help("Pass --resultdir DIR so the results of each build are kept together")
    )]
    ResultDirRequired,

    /// Unknown plugin name given to --enable-plugin/--disable-plugin
    #[error("Unknown plugin '{name}'")]
    #[diagnostic(
        code(roto::config::unknown_plugin),
        help("Known plugins: tmpfs, root_cache, yum_cache, bind_mount, ccache, selinux")
    )]
    UnknownPlugin { name: String },

    /// A -D/--define value without an expression
    #[error("Invalid macro definition '{value}'")]
    #[diagnostic(
        code(roto::config::define),
        help("Use -D 'NAME EXPRESSION', for example -D '_smp_mflags -j4'")
    )]
    InvalidDefine { value: String },

    /// Target architecture not supported by the host
    #[error("Cannot build target {target} on arch {host}")]
    #[diagnostic(code(roto::config::arch))]
    InvalidArchitecture { target: String, host: String },

    /// Mode needs an argument that was not given
    #[error("Missing argument: {0}")]
    #[diagnostic(code(roto::config::missing_argument))]
    MissingArgument(String),

    /// Configuration file could not be read
    #[error("Failed to read configuration file {}", path.display())]
    #[diagnostic(code(roto::config::read))]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON
    #[error("Failed to parse configuration file {}", path.display())]
    #[diagnostic(
        code(roto::config::parse),
        help("Configuration files are JSON objects whose keys mirror the command-line options")
    )]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An --scm-option value that is not KEY=VALUE or names no known key
    #[error("Bad option for '--scm-option' ({value}).  Use --scm-option 'key=value'")]
    #[diagnostic(
        code(roto::config::scm_option),
        help("Known keys: method, cvs_get, git_get, svn_get, spec, ext_src_dir, write_tar, package, branch")
    )]
    BadScmOption { value: String },
}

/// Errors switching user and group identities.
#[derive(Error, Debug, Diagnostic)]
pub enum PrivilegeError {
    /// Reading the current ids failed
    #[error("Failed to read process credentials")]
    #[diagnostic(code(roto::privilege::read))]
    ReadIds(#[source] Errno),

    /// Setting uids failed
    #[error("Failed to switch to uid {uid}")]
    #[diagnostic(
        code(roto::privilege::setuid),
        help("The controller must be started as root through sudo or userhelper")
    )]
    SetUid {
        uid: u32,
        #[source]
        source: Errno,
    },

    /// Setting gids failed
    #[error("Failed to switch to gid {gid}")]
    #[diagnostic(code(roto::privilege::setgid))]
    SetGid {
        gid: u32,
        #[source]
        source: Errno,
    },

    /// restore() without a matching push()
    #[error("Privilege restore without a saved state")]
    #[diagnostic(code(roto::privilege::unbalanced))]
    Unbalanced,

    /// Process lacks the privileges the controller needs
    #[error("roto must be run as root (euid is {euid})")]
    #[diagnostic(
        code(roto::privilege::not_root),
        help("Run through sudo so the invoking user can be recorded")
    )]
    NotRoot { euid: u32 },

    /// Started as plain root, so no unprivileged identity is known
    #[error("roto will not run as root without SUDO_UID or USERHELPER_UID")]
    #[diagnostic(
        code(roto::privilege::direct_root),
        help("Run roto from a regular account with sudo")
    )]
    DirectRoot,

    /// Ownership of a result could not be handed to the invoking user
    #[error("Failed to change owner of {}", path.display())]
    #[diagnostic(code(roto::privilege::chown))]
    Chown {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to advisory file locks.
#[derive(Error, Debug, Diagnostic)]
pub enum LockError {
    /// Lock file could not be opened or created
    #[error("Failed to open lock file {}", path.display())]
    #[diagnostic(code(roto::lock::open))]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// flock(2) failed for a reason other than contention
    #[error("Failed to lock {}", path.display())]
    #[diagnostic(
        code(roto::lock::acquire),
        help("Another roto process may be holding the lock in an unusual state")
    )]
    Acquire {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

/// Errors related to mount namespace and mount operations.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// unshare(CLONE_NEWNS) failed
    #[error("Namespace unshare failed: {0}")]
    #[diagnostic(
        code(roto::mount::unshare),
        help("Pass --nounshare to run without a private mount namespace")
    )]
    Unshare(String),

    /// mount(2) failed
    #[error("Failed to mount {source_name} on {}: {reason}", target.display())]
    #[diagnostic(code(roto::mount::mount))]
    Mount {
        source_name: String,
        target: PathBuf,
        reason: String,
    },

    /// umount2(2) failed even with MNT_DETACH
    #[error("Failed to unmount {}: {reason}", target.display())]
    #[diagnostic(code(roto::mount::unmount))]
    Unmount { target: PathBuf, reason: String },

    /// Mount point could not be created
    #[error("Failed to create mount point {}", path.display())]
    #[diagnostic(code(roto::mount::mkdir))]
    CreateTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Mount table could not be read
    #[error("Failed to read mount table {}", path.display())]
    #[diagnostic(code(roto::mount::read_table))]
    ReadTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors populating `/dev` inside the sandbox.
#[derive(Error, Debug, Diagnostic)]
pub enum DeviceError {
    /// Filesystem operation on the device tree failed
    #[error("Device setup failed: {context}")]
    #[diagnostic(code(roto::device::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// mknod(2) failed
    #[error("Failed to create device node {}", path.display())]
    #[diagnostic(
        code(roto::device::mknod),
        help("Device nodes can only be created with root privileges")
    )]
    Mknod {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    /// chown/chmod on a device node failed
    #[error("Failed to set ownership of {}", path.display())]
    #[diagnostic(code(roto::device::chown))]
    Ownership {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

/// Errors from plugins and hook actions.
#[derive(Error, Debug, Diagnostic)]
pub enum PluginError {
    /// Plugin is known but has no implementation
    #[error("Plugin '{name}' is not implemented")]
    #[diagnostic(
        code(roto::plugin::not_implemented),
        help("Remove --enable-plugin={name} or disable it in the configuration")
    )]
    NotImplemented { name: String },

    /// Hook action failed
    #[error("{plugin} hook failed: {reason}")]
    #[diagnostic(code(roto::plugin::hook))]
    Hook { plugin: String, reason: String },

    /// Filesystem operation in a hook failed
    #[error("{plugin}: {context}")]
    #[diagnostic(code(roto::plugin::io))]
    Io {
        plugin: String,
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors in the source package being built.
#[derive(Error, Debug, Diagnostic)]
pub enum PkgError {
    /// No spec file after unpacking
    #[error("No Spec file found in srpm: {}", srpm.display())]
    #[diagnostic(code(roto::pkg::no_spec))]
    NoSpec { srpm: PathBuf },

    /// More than one spec file after unpacking
    #[error("Multiple spec files found in srpm {}: {}", srpm.display(), specs.join(", "))]
    #[diagnostic(code(roto::pkg::multiple_specs))]
    MultipleSpecs { srpm: PathBuf, specs: Vec<String> },

    /// Input package missing or unreadable
    #[error("Source package not readable: {}", path.display())]
    #[diagnostic(code(roto::pkg::missing))]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the external package installer.
#[derive(Error, Debug, Diagnostic)]
pub enum InstallerError {
    /// Installer exited non-zero
    #[error("Installer command failed with status {code}: {command}")]
    #[diagnostic(code(roto::installer::failed))]
    Failed { command: String, code: i32 },

    /// Installer reported a missing package
    #[error("Installer could not find a package: {line}")]
    #[diagnostic(
        code(roto::installer::no_package),
        help("Check the repository configuration in yum.conf")
    )]
    NoPackage { line: String },

    /// Installer could not be started
    #[error("Failed to run installer")]
    #[diagnostic(code(roto::installer::exec))]
    Exec(#[source] ExecError),
}

/// Errors from rpmbuild and artifact collection.
#[derive(Error, Debug, Diagnostic)]
pub enum BuildError {
    /// rpmbuild or rpm exited non-zero
    #[error("{step} failed with status {code}")]
    #[diagnostic(code(roto::build::failed), help("See the build output above"))]
    Failed { step: String, code: i32 },

    /// Expected artifacts missing
    #[error("No build results found in {}", dir.display())]
    #[diagnostic(code(roto::build::no_artifacts))]
    NoArtifacts { dir: PathBuf },

    /// Filesystem failure while staging inputs or collecting results
    #[error("Build I/O failed: {context}")]
    #[diagnostic(code(roto::build::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// The result directory could not be used.
#[derive(Error, Debug, Diagnostic)]
#[error("Result directory not accessible: {}", path.display())]
#[diagnostic(
    code(roto::resultdir),
    help("Make sure the invoking user can create and write the directory")
)]
pub struct ResultDirError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Errors running commands.
#[derive(Error, Debug, Diagnostic)]
pub enum ExecError {
    /// Empty or unusable command
    #[error("Invalid command: {0}")]
    #[diagnostic(code(roto::exec::invalid))]
    InvalidCommand(String),

    /// Command could not be spawned
    #[error("Failed to spawn {command}")]
    #[diagnostic(code(roto::exec::spawn))]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the command failed
    #[error("Failed to wait for {command}")]
    #[diagnostic(code(roto::exec::wait))]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exceeded its time limit
    #[error("Command timed out after {timeout_seconds} seconds: {command}")]
    #[diagnostic(
        code(roto::exec::timeout),
        help("Raise --rpmbuild_timeout or set it to 0 to disable the limit")
    )]
    Timeout {
        command: String,
        timeout_seconds: u64,
    },
}

/// Errors related to host requirements.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemError {
    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(roto::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invoking user could not be determined
    #[error("Could not determine the invoking user: {0}")]
    #[diagnostic(
        code(roto::system::user),
        help("SUDO_UID and SUDO_GID must be numeric when set")
    )]
    InvokingUser(String),
}

/// Errors fetching and preparing sources from source control.
#[derive(Error, Debug, Diagnostic)]
pub enum ScmError {
    /// The configured method has no checkout command
    #[error("Unsupported SCM method: {method}")]
    #[diagnostic(
        code(roto::scm::method),
        help("Use --scm-option method=git, method=svn or method=cvs")
    )]
    UnsupportedMethod { method: String },

    /// No package name to check out
    #[error("Trying to use SCM, package not defined")]
    #[diagnostic(
        code(roto::scm::package),
        help("Pass --scm-option package=NAME")
    )]
    PackageNotDefined,

    /// Checkout command cannot be split into words
    #[error("Cannot parse SCM command: {command}")]
    #[diagnostic(code(roto::scm::command_syntax))]
    BadCommand { command: String },

    /// The checkout has no spec file
    #[error("Can't find spec file {}", path.display())]
    #[diagnostic(
        code(roto::scm::no_spec),
        help("Set --scm-option spec=FILE to the spec file name in the checkout")
    )]
    SpecNotFound { path: PathBuf },

    /// Checkout, tarball or spec query command failed
    #[error("{command} failed with status {code}")]
    #[diagnostic(code(roto::scm::command))]
    Command { command: String, code: i32 },

    /// Spec file lacks the tags needed to name the sources
    #[error("Spec file {} does not define {tag}", spec.display())]
    #[diagnostic(code(roto::scm::spec_query))]
    SpecQuery { spec: PathBuf, tag: String },

    /// Scratch directory for the checkout could not be prepared
    #[error("SCM work directory failed: {context}")]
    #[diagnostic(code(roto::scm::workdir))]
    WorkDir {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
