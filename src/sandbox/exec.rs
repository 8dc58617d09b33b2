//! Running commands inside the build root.
//!
//! [`ChrootCommand`] describes one invocation: argv, optional chroot, working
//! directory, identity, personality, environment and timeout. The child is
//! prepared between `fork` and `exec`:
//!
//! 1. `setsid()` so the whole process group can be signalled on timeout
//!    (skipped for interactive commands without a timeout)
//! 2. `personality()` for 32-bit targets on 64-bit hosts
//! 3. `chroot()` into the root (root privileges are regained for this step)
//! 4. supplementary groups, gid, then uid of the requested user
//! 5. `chdir()` into the working directory
//!
//! # Output and timeouts
//!
//! Captured stdout/stderr are drained on their own threads while the parent
//! polls `try_wait`, so a chatty child can never block on a full pipe. When the
//! timeout expires the process group receives SIGTERM and, one second later,
//! SIGKILL.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, instrument, trace, warn};

use crate::error::ExecError;

/// `PATH` inside the root.
pub const CHROOT_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Linux personality value for native execution.
pub const PER_LINUX: libc::c_ulong = 0x0000;
/// Linux personality value for 32-bit execution on 64-bit hosts.
pub const PER_LINUX32: libc::c_ulong = 0x0008;

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returns the personality for a target architecture.
#[must_use]
pub fn personality_for(arch: &str) -> libc::c_ulong {
    match arch {
        "i386" | "i586" | "i686" | "ppc" | "sparc" | "sparcv9" | "s390" => PER_LINUX32,
        _ => PER_LINUX,
    }
}

/// Output from a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output; empty when output was inherited.
    pub stdout: String,
    /// Captured standard error; empty when output was inherited.
    pub stderr: String,
    /// Exit code, or 128 + signal number when killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns `true` if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut all = self.stdout.clone();
        all.push_str(&self.stderr);
        all
    }
}

/// Where the child's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Collect into [`CommandOutput`].
    #[default]
    Capture,
    /// Share the controller's terminal.
    Inherit,
}

/// A command to run, optionally inside a chroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootCommand {
    argv: Vec<String>,
    chroot: Option<PathBuf>,
    cwd: Option<PathBuf>,
    user: Option<(u32, u32)>,
    personality: Option<libc::c_ulong>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    output: OutputMode,
}

impl ChrootCommand {
    /// Creates a command from its argv.
    #[must_use]
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), CHROOT_PATH.to_string());
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            chroot: None,
            cwd: None,
            user: None,
            personality: None,
            env,
            timeout: None,
            output: OutputMode::Capture,
        }
    }

    /// Runs `script` through `/bin/sh -c`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["/bin/sh".to_string(), "-c".to_string(), script.into()])
    }

    #[must_use]
    pub fn in_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.chroot = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Runs the child as `uid`/`gid`.
    #[must_use]
    pub fn as_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some((uid, gid));
        self
    }

    /// Sets the execution personality from the target architecture.
    #[must_use]
    pub fn with_personality(mut self, arch: &str) -> Self {
        self.personality = Some(personality_for(arch));
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Kills the command after `timeout`; `None` waits forever.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.chroot.as_deref()
    }

    #[must_use]
    pub fn output(&self) -> OutputMode {
        self.output
    }

    #[must_use]
    pub fn user(&self) -> Option<(u32, u32)> {
        self.user
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The argv joined for log messages.
    #[must_use]
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }

    fn build(&self) -> Result<Command, ExecError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ExecError::InvalidCommand(
                "command cannot be empty".to_string(),
            ));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(&self.env);

        match self.output {
            OutputMode::Capture => {
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdin(Stdio::inherit());
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }

        let setup = ChildSetup {
            chroot: self.chroot.as_deref().map(c_path).transpose()?,
            cwd: self.cwd.as_deref().map(c_path).transpose()?,
            user: self.user,
            personality: self.personality,
            new_session: self.output == OutputMode::Capture || self.timeout.is_some(),
        };

        setup.install(&mut cmd);
        Ok(cmd)
    }

    /// Runs the command to completion.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `ExecError::InvalidCommand` if argv is empty or a path has a NUL byte
    /// - `ExecError::Spawn` if the command cannot be started
    /// - `ExecError::Wait` if waiting for it fails
    /// - `ExecError::Timeout` if it ran longer than its timeout
    #[instrument(skip(self), fields(command = %self.display(), root = ?self.chroot, user = ?self.user))]
    pub fn execute(&self) -> Result<CommandOutput, ExecError> {
        let mut cmd = self.build()?;

        trace!("Spawning child process");
        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
            command: self.display(),
            source: e,
        })?;

        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        let start = Instant::now();
        let status = self.wait(&mut child, start)?;

        let stdout = stdout_rx.and_then(|rx| rx.recv().ok()).unwrap_or_default();
        let stderr = stderr_rx.and_then(|rx| rx.recv().ok()).unwrap_or_default();

        let exit_code = exit_code(status);
        debug!(exit_code, elapsed_ms = %start.elapsed().as_millis(), "Command completed");
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn wait(&self, child: &mut Child, start: Instant) -> Result<ExitStatus, ExecError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if let Some(limit) = self.timeout {
                        if start.elapsed() > limit {
                            debug!(elapsed_ms = %start.elapsed().as_millis(), "Command timed out");
                            terminate_group(child);
                            return Err(ExecError::Timeout {
                                command: self.display(),
                                timeout_seconds: limit.as_secs(),
                            });
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(ExecError::Wait {
                        command: self.display(),
                        source: e,
                    });
                }
            }
        }
    }
}

/// Executes [`ChrootCommand`]s.
///
/// Hooks and the installer go through this trait so they can be exercised
/// without root.
pub trait CommandRunner {
    /// Runs `command` to completion.
    ///
    /// # Errors
    ///
    /// See [`ChrootCommand::execute`].
    fn run(&self, command: &ChrootCommand) -> Result<CommandOutput, ExecError>;
}

/// Runs commands for real.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ChrootCommand) -> Result<CommandOutput, ExecError> {
        command.execute()
    }
}

fn c_path(path: &Path) -> Result<CString, ExecError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ExecError::InvalidCommand(format!("path contains NUL: {}", path.display())))
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> Option<mpsc::Receiver<Vec<u8>>> {
    let mut reader = reader?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    Some(rx)
}

fn terminate_group(child: &mut Child) {
    let Ok(raw) = i32::try_from(child.id()) else {
        let _ = child.kill();
        let _ = child.wait();
        return;
    };
    let group = Pid::from_raw(raw);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        trace!(error = %e, "SIGTERM to process group failed");
    }

    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!(pid = raw, "Process group ignored SIGTERM, sending SIGKILL");
    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Child-side setup, run between fork and exec.
struct ChildSetup {
    chroot: Option<CString>,
    cwd: Option<CString>,
    user: Option<(u32, u32)>,
    personality: Option<libc::c_ulong>,
    /// Interactive children keep the controlling terminal.
    new_session: bool,
}

impl ChildSetup {
    #[allow(unsafe_code)]
    fn install(self, cmd: &mut Command) {
        // SAFETY: the closure only issues async-signal-safe syscalls on data
        // prepared before fork.
        unsafe {
            cmd.pre_exec(move || self.apply());
        }
    }

    #[allow(unsafe_code)]
    fn apply(&self) -> io::Result<()> {
        // SAFETY: plain libc calls on owned, NUL-terminated buffers.
        unsafe {
            if self.new_session {
                check(libc::setsid())?;
            }

            if let Some(persona) = self.personality {
                check(libc::personality(persona))?;
            }

            if let Some(root) = &self.chroot {
                chroot_as_root(root)?;
            }

            if let Some((uid, gid)) = self.user {
                switch_user(uid, gid)?;
            }

            if let Some(cwd) = &self.cwd {
                check(libc::chdir(cwd.as_ptr()))?;
            }
        }
        Ok(())
    }
}

#[allow(unsafe_code)]
unsafe fn chroot_as_root(root: &CStr) -> io::Result<()> {
    // SAFETY: called from the forked child only.
    unsafe {
        let uid = libc::getuid();
        let euid = libc::geteuid();
        check(libc::setresuid(0, 0, 0))?;
        check(libc::chdir(root.as_ptr()))?;
        check(libc::chroot(root.as_ptr()))?;
        check(libc::chdir(c"/".as_ptr()))?;
        check(libc::setresuid(uid, euid, 0))?;
    }
    Ok(())
}

#[allow(unsafe_code)]
unsafe fn switch_user(uid: u32, gid: u32) -> io::Result<()> {
    // SAFETY: called from the forked child only.
    unsafe {
        if libc::getuid() == uid && libc::geteuid() == uid && libc::getgid() == gid {
            return Ok(());
        }
        if libc::geteuid() != 0 {
            check(libc::setresuid(0, 0, 0))?;
        }
        let groups = [gid];
        check(libc::setgroups(1, groups.as_ptr()))?;
        check(libc::setresgid(gid, gid, gid))?;
        check(libc::setresuid(uid, uid, uid))?;
    }
    Ok(())
}

fn check<T: PartialEq + From<i8>>(ret: T) -> io::Result<()> {
    if ret == T::from(-1) {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
