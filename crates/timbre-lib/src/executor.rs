//! Engine execution, one interpreter process per conversion.
//!
//! The engine's exit status is logged but not trusted: whether it produced an
//! output file is what the cache bridge checks afterwards.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ConversionError;

#[derive(Debug, Clone)]
pub struct EngineRunner {
    interpreter: PathBuf,
    script: PathBuf,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl EngineRunner {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// Run `<interpreter> <script>` in the engine root and wait for it.
    ///
    /// `env` is layered over the inherited environment. On timeout the whole
    /// process group is killed and [`ConversionError::Timeout`] returned.
    pub async fn run(&self, env: &[(String, String)]) -> Result<ExitStatus, ConversionError> {
        let mut command = std::process::Command::new(&self.interpreter);
        // Own process group, so a deadline kill also reaches the engine's children.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = Command::from(command)
            .arg(&self.script)
            .current_dir(&self.working_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConversionError::processing_caused_by(
                    format!("failed to start {}", self.interpreter.display()),
                    e,
                )
            })?;

        info!(
            "engine started (pid {:?}): {} {}",
            child.id(),
            self.interpreter.display(),
            self.script.display()
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        let waited = match self.timeout {
            Some(limit) => {
                let finished = tokio::time::timeout(limit, child.wait()).await;
                match finished {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("engine exceeded {limit:?}; killing it");
                        kill_process_group(&child);
                        if let Err(e) = child.kill().await {
                            warn!("failed to kill engine: {e}");
                        }
                        return Err(ConversionError::Timeout(limit));
                    }
                }
            }
            None => child.wait().await,
        };

        let status = waited.map_err(|e| {
            ConversionError::processing_caused_by("failed to wait for the engine", e)
        })?;
        if status.success() {
            info!("engine finished");
        } else {
            warn!("engine exited with {status}");
        }
        Ok(status)
    }
}

#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    let Some(pid) = child.id() else { return };
    // SAFETY: killpg has no memory-safety preconditions; the group id is the
    // pid of a child we spawned as a group leader and have not yet reaped.
    if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
        warn!(
            "failed to kill engine process group {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &tokio::process::Child) {}

async fn forward_lines(stream: impl AsyncRead + Unpin, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[engine {name}] {line}");
    }
}
