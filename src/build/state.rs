//! Build root states and their history.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// State of the build root during one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    #[default]
    Unstarted,
    InitPlugins,
    Start,
    LockBuildroot,
    Init,
    RunningYum,
    Setup,
    Buildsrpm,
    Build,
    Clean,
    UnlockBuildroot,
    End,
    InitFailed,
}

impl State {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::InitPlugins => "init-plugins",
            Self::Start => "start",
            Self::LockBuildroot => "lock-buildroot",
            Self::Init => "init",
            Self::RunningYum => "running-yum",
            Self::Setup => "setup",
            Self::Buildsrpm => "buildsrpm",
            Self::Build => "build",
            Self::Clean => "clean",
            Self::UnlockBuildroot => "unlock-buildroot",
            Self::End => "end",
            Self::InitFailed => "initfailed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: State,
    pub at: DateTime<Utc>,
}

/// Current state plus every change made during this invocation.
///
/// Once a file is attached, each change is also appended to it as
/// `<RFC 3339 timestamp> State Changed: <state>`. Writing the file is best
/// effort; the in-memory history is authoritative.
#[derive(Debug, Default)]
pub struct StateLog {
    current: State,
    history: Vec<StateChange>,
    file: Option<PathBuf>,
}

impl StateLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> State {
        self.current
    }

    /// States entered so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<State> {
        self.history.iter().map(|c| c.state).collect()
    }

    #[must_use]
    pub fn changes(&self) -> &[StateChange] {
        &self.history
    }

    /// Appends later changes to `path`.
    pub fn attach(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!(path = %path.display(), "State log attached");
        self.file = Some(path);
    }

    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Enters `state`.
    pub fn set(&mut self, state: State) {
        self.current = state;
        info!("State Changed: {state}");

        let change = StateChange {
            state,
            at: Utc::now(),
        };
        if let Some(path) = &self.file {
            if let Err(e) = append_line(path, &change) {
                debug!(path = %path.display(), error = %e, "State log not written");
            }
        }
        self.history.push(change);
    }
}

fn append_line(path: &Path, change: &StateChange) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "{} State Changed: {}",
        change.at.to_rfc3339_opts(SecondsFormat::Secs, true),
        change.state
    )
}
