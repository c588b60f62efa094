use super::error::{ProvisionError, TeardownError};
use std::ffi::OsStr;
use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A control plane component running as a child process.
///
/// The child is killed if the value is dropped without being stopped.
#[derive(Debug)]
pub(crate) struct ControlPlaneProcess {
    name: String,
    child: Child,
}

impl ControlPlaneProcess {
    /// Spawns `binary`. Unless `attach_output` is set, the process output is forwarded to the logs line by line.
    pub fn spawn<I, S>(
        name: &str,
        binary: &Path,
        args: I,
        attach_output: bool,
    ) -> Result<Self, ProvisionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (stdout, stderr) = if attach_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::piped(), Stdio::piped())
        };

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                name: name.to_string(),
                source,
            })?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_output(name.to_string(), out));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_output(name.to_string(), err));
        }
        debug!(process = name, pid = ?child.id(), "control plane process started");

        Ok(Self {
            name: name.to_string(),
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fails if the process is no longer running.
    pub fn ensure_running(&mut self) -> Result<(), ProvisionError> {
        match self.child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(ProvisionError::ProcessExited {
                name: self.name.clone(),
                status,
            }),
        }
    }

    /// Asks the process to terminate and kills it if it is still running after `timeout`.
    pub async fn stop(mut self, timeout: Duration) -> Result<(), TeardownError> {
        let name = self.name.clone();
        let stop_error = |reason: String| TeardownError::StopProcess {
            name: name.clone(),
            reason,
        };

        if let Some(status) = self.child.try_wait().map_err(|e| stop_error(e.to_string()))? {
            debug!(process = %self.name, %status, "control plane process already exited");
            return Ok(());
        }

        self.terminate();
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(process = %self.name, %status, "control plane process stopped");
                Ok(())
            }
            Ok(Err(err)) => Err(stop_error(err.to_string())),
            Err(_) => {
                warn!(process = %self.name, ?timeout, "control plane process did not exit in time, killing it");
                self.child
                    .kill()
                    .await
                    .map_err(|e| stop_error(format!("killing after {timeout:?}: {e}")))
            }
        }
    }

    #[cfg(target_family = "unix")]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(process = %self.name, %err, "failed sending SIGTERM");
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!(process = %self.name, %err, "failed killing process");
        }
    }
}

async fn forward_output<R>(name: String, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(process = %name, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(process = %name, %err, "stopped reading process output");
                break;
            }
        }
    }
}

/// Asks the kernel for a free loopback port.
///
/// The port is released before returning, so another process could grab it before the control plane binds it.
pub(crate) fn free_port() -> Result<u16, ProvisionError> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(ProvisionError::PortAllocation)
}
