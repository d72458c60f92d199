//! Lifecycle of the spectrometer server executable.
//!
//! The server is a separate program that must be running before the TCP
//! protocol is usable. [`InstrumentProcess`] launches it with piped output,
//! forwards every output line to the log on a background task, and stops it
//! with a terminate request followed by a forced kill once the grace period
//! runs out.

use crate::error::{AppResult, SpectroError};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

/// Log target for forwarded server output.
pub const OUTPUT_TARGET: &str = "spectro_daq::instrument_process";

/// How long the drain task may take to flush after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A running spectrometer server process.
pub struct InstrumentProcess {
    child: Child,
    drain: JoinHandle<()>,
    executable: String,
}

impl InstrumentProcess {
    /// Launch `executable` with `args`.
    ///
    /// # Errors
    /// Returns [`SpectroError::ProcessSpawn`] if the program cannot be started.
    pub fn spawn<S: AsRef<str>>(executable: &Path, args: &[S]) -> AppResult<Self> {
        let name = executable.display().to_string();
        let mut child = Command::new(executable)
            .args(args.iter().map(AsRef::as_ref))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpectroError::ProcessSpawn {
                executable: name.clone(),
                source,
            })?;

        info!("Started {} (pid {:?})", name, child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let span = info_span!("server_output", pid = ?child.id());
        let drain = tokio::spawn(
            async move {
                let out = async {
                    if let Some(stdout) = stdout {
                        forward_lines(stdout, "stdout").await;
                    }
                };
                let err = async {
                    if let Some(stderr) = stderr {
                        forward_lines(stderr, "stderr").await;
                    }
                };
                tokio::join!(out, err);
            }
            .instrument(span),
        );

        Ok(Self {
            child,
            drain,
            executable: name,
        })
    }

    /// OS process id, if the process is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the process: terminate, wait up to `grace`, then kill.
    ///
    /// Returns the exit status if one could be collected.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            info!("{} already exited with {}", self.executable, status);
            self.finish_drain().await;
            return Some(status);
        }

        info!("Stopping {}...", self.executable);
        self.request_terminate();

        let status = match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait for {}: {}", self.executable, e);
                None
            }
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing it",
                    self.executable, grace
                );
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill {}: {}", self.executable, e);
                }
                self.child.try_wait().ok().flatten()
            }
        };

        self.finish_drain().await;
        if let Some(status) = status {
            info!("{} exited with {}", self.executable, status);
        }
        status
    }

    #[cfg(unix)]
    fn request_terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to {}: {}", self.executable, e);
        }
    }

    #[cfg(not(unix))]
    fn request_terminate(&mut self) {
        // No graceful terminate request outside unix.
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to stop {}: {}", self.executable, e);
        }
    }

    async fn finish_drain(&mut self) {
        if timeout(DRAIN_TIMEOUT, &mut self.drain).await.is_err() {
            debug!("Output drain still busy, aborting it");
            self.drain.abort();
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, stream_name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: OUTPUT_TARGET, stream = stream_name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading server {}: {}", stream_name, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    #[tokio::test]
    #[traced_test]
    async fn test_output_is_forwarded() {
        let process =
            InstrumentProcess::spawn(&sh(), &["-c", "echo server booting; echo oops >&2"]).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = process.shutdown(Duration::from_secs(5)).await;
        assert!(status.is_some());
        assert!(logs_contain("server booting"));
        assert!(logs_contain("oops"));
    }

    #[tokio::test]
    async fn test_terminate_stops_sleeping_process() {
        let mut process = InstrumentProcess::spawn(&sh(), &["-c", "sleep 30"]).unwrap();
        assert!(process.is_running());
        assert!(process.id().is_some());

        let start = std::time::Instant::now();
        let status = process.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_kill_after_grace_when_terminate_ignored() {
        let process = InstrumentProcess::spawn(
            &sh(),
            &["-c", "trap '' TERM; echo ready; while true; do sleep 0.05; done"],
        )
        .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = std::time::Instant::now();
        let status = process.shutdown(Duration::from_millis(200)).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        if let Some(status) = status {
            assert!(!status.success());
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let result = InstrumentProcess::spawn(Path::new("/nonexistent/spectro-server"), &[] as &[&str]);
        assert!(matches!(result, Err(SpectroError::ProcessSpawn { .. })));
    }
}
