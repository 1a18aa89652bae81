//! Cancellable, time-bounded external process invocation.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} not found")]
    NotFound { tool: String },

    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    TimedOut { tool: String, timeout_secs: u64 },

    #[error("{tool} was cancelled")]
    Cancelled { tool: String },

    #[error("{tool} exited with code {code}: {detail}")]
    NonZeroExit {
        tool: String,
        code: i32,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled { .. })
    }
}

/// Captured result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; -1 when terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stderr if present, else stdout, trimmed.
    pub fn detail(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() { self.stdout.trim() } else { err }
    }

    /// Turn a non-zero exit into an error.
    pub fn check(self, tool: &str) -> Result<Self, ToolError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ToolError::NonZeroExit {
                tool: tool.to_string(),
                code: self.code,
                detail: self.detail().to_string(),
            })
        }
    }
}

/// An external executable with a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: PathBuf,
    timeout: Duration,
}

impl ExternalTool {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// `name` inside `dir` when a directory is configured, else `name` on PATH.
    pub fn locate(dir: Option<&Path>, name: &str, timeout: Duration) -> Self {
        let program = match dir {
            Some(dir) => dir.join(executable_name(name)),
            None => PathBuf::from(executable_name(name)),
        };
        Self::new(program, timeout)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True if the program exists: the configured path itself, or a match on
    /// `PATH` for a bare name. Nothing is spawned.
    pub fn is_available(&self) -> bool {
        resolve_program(&self.program).is_some()
    }

    /// Run with `args`, capturing output.
    ///
    /// The child is killed if `cancel` fires or the timeout elapses.
    #[instrument(level = "debug", skip(self, cancel), fields(tool = %self.name()))]
    pub fn run(&self, args: &[&str], cancel: &CancelToken) -> Result<ToolOutput, ToolError> {
        let tool = self.name();
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled { tool });
        }

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ToolError::NotFound { tool: tool.clone() }
                } else {
                    ToolError::Spawn {
                        tool: tool.clone(),
                        source,
                    }
                }
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait(&mut child, cancel) {
            Ok(status) => status,
            Err(reason) => {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "Failed to kill child process");
                }
                let _ = child.wait();
                return Err(match reason {
                    Stop::Cancelled => ToolError::Cancelled { tool },
                    Stop::TimedOut => ToolError::TimedOut {
                        tool,
                        timeout_secs: self.timeout.as_secs(),
                    },
                    Stop::Io(e) => ToolError::Io(e),
                });
            }
        };

        let output = ToolOutput {
            code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        debug!(code = output.code, "Tool finished");
        Ok(output)
    }

    fn wait(&self, child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus, Stop> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(Stop::Io)? {
                return Ok(status);
            }
            if cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(Stop::TimedOut);
            }
            thread::sleep(WAIT_SLICE);
        }
    }
}

enum Stop {
    Cancelled,
    TimedOut,
    Io(std::io::Error),
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Where `program` would be started from, if anywhere.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    let has_dir = program
        .parent()
        .is_some_and(|parent| !parent.as_os_str().is_empty());
    if has_dir {
        return program.is_file().then(|| program.to_path_buf());
    }

    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}
