//! Managed Process - one server jar child process with stdio capture
//!
//! - stdout/stderr lines pushed into the server's [`ConsoleBridge`] as they arrive
//! - stdin command injection through a writer task
//! - exit observed by a single waiter task and published once through a watch channel
//! - graceful stop (engine stop command + grace period) escalating to a forced kill

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::console::{ConsoleBridge, LogSource};
use super::error::{Result, SupervisorError};
use crate::engine::LaunchCommand;
use crate::instance::ServerInstance;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitObservation {
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct TerminateOutcome {
    pub exit: ExitObservation,
    /// The process was killed rather than exiting on its own.
    pub forced: bool,
    /// Killed because the grace period ran out (not cut short by `force_kill`).
    pub timed_out: bool,
}

pub struct ManagedProcess {
    name: String,
    /// Channel to send commands to stdin
    stdin_tx: mpsc::Sender<String>,
    pub pid: u32,
    exit_rx: watch::Receiver<Option<ExitObservation>>,
    /// Cancelling this kills the child (the waiter task owns it).
    kill: CancellationToken,
    stop_command: String,
}

impl ManagedProcess {
    /// Spawn the server jar for `instance`.
    ///
    /// Fails with `MissingArtifact` if the working directory or jar is absent,
    /// `PortInUse` if the configured port is bound, `SpawnFailed` on OS errors.
    pub async fn launch(
        instance: &ServerInstance,
        command: &LaunchCommand,
        console: Arc<ConsoleBridge>,
    ) -> Result<Self> {
        if !instance.directory.is_dir() {
            return Err(SupervisorError::MissingArtifact(format!(
                "working directory {} does not exist",
                instance.directory.display()
            )));
        }
        let jar = instance.jar_path();
        if !jar.is_file() {
            return Err(SupervisorError::MissingArtifact(format!(
                "server jar {} does not exist",
                jar.display()
            )));
        }
        if !crate::utils::port_available(instance.port) {
            return Err(SupervisorError::PortInUse(instance.port));
        }

        let mut cmd = TokioCommand::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&instance.directory)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            SupervisorError::SpawnFailed(format!("'{}': {}", command.program, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::SpawnFailed("process exited before reporting a PID".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(256);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        console.system(format!("Started server with command: {}", command.display()));

        let mut readers = Vec::new();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let console = console.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    console.publish(LogSource::Stdout, line);
                }
            }));
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = stderr {
            let console = console.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    console.publish(LogSource::Stderr, line);
                }
            }));
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    let data = if cmd.ends_with('\n') { cmd } else { format!("{}\n", cmd) };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let console = console.clone();
            let kill = kill.clone();
            let name = instance.name.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("[{}] Failed to kill pid {}: {}", name, pid, e);
                        }
                        child.wait().await
                    }
                };
                // 종료 전에 출력된 줄이 모두 콘솔에 들어간 뒤에 종료를 알림.
                // 자식의 자식이 파이프를 잡고 있을 수 있으므로 대기 시간은 제한
                let drained = futures_util::future::join_all(readers);
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained).await.is_err() {
                    tracing::debug!("[{}] Output streams still open after exit", name);
                }
                let observation = match status {
                    Ok(status) => ExitObservation {
                        code: status.code(),
                        success: status.success(),
                        description: format!("Process exited with {}", status),
                    },
                    Err(e) => ExitObservation {
                        code: None,
                        success: false,
                        description: format!("Failed to wait for process: {}", e),
                    },
                };
                tracing::info!("[{}] {}", name, observation.description);
                console.system(observation.description.clone());
                let _ = exit_tx.send(Some(observation));
            });
        }

        tracing::info!("[{}] Server process started with PID {}", instance.name, pid);

        Ok(Self {
            name: instance.name.clone(),
            stdin_tx,
            pid,
            exit_rx,
            kill,
            stop_command: console.profile().stop_command.clone(),
        })
    }

    /// Queue one line for the process's stdin.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        if self.has_exited() {
            return Err(SupervisorError::NotRunning(self.name.clone()));
        }
        self.stdin_tx
            .send(text.to_string())
            .await
            .map_err(|_| SupervisorError::NotRunning(self.name.clone()))
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves once the process has exited; every caller sees the same observation.
    pub async fn wait_exit(&self) -> ExitObservation {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(lost_exit)
    }

    /// Kill now, cancelling any grace period in progress.
    pub fn force_kill(&self) {
        self.kill.cancel();
    }

    /// Stop the process. The graceful path sends the engine stop command and
    /// waits up to `grace` before killing; a concurrent [`force_kill`] cuts
    /// the wait short. Always resolves to the exit observation.
    ///
    /// [`force_kill`]: ManagedProcess::force_kill
    pub async fn terminate(&self, graceful: bool, grace: Duration) -> TerminateOutcome {
        if self.has_exited() {
            return TerminateOutcome { exit: self.wait_exit().await, forced: false, timed_out: false };
        }

        let mut timed_out = false;
        if graceful {
            match self.write_line(&self.stop_command).await {
                Ok(()) => {
                    tokio::select! {
                        exit = self.wait_exit() => {
                            return TerminateOutcome { exit, forced: false, timed_out: false };
                        }
                        _ = tokio::time::sleep(grace) => {
                            tracing::warn!(
                                "[{}] Did not stop within {:?}, killing pid {}",
                                self.name, grace, self.pid
                            );
                            timed_out = true;
                        }
                        _ = self.kill.cancelled() => {
                            tracing::info!("[{}] Grace period cancelled, killing pid {}", self.name, self.pid);
                        }
                    }
                }
                Err(e) => {
                    if self.has_exited() {
                        return TerminateOutcome { exit: self.wait_exit().await, forced: false, timed_out: false };
                    }
                    tracing::warn!("[{}] Could not send stop command: {}", self.name, e);
                }
            }
        }

        self.kill.cancel();
        let exit = self.wait_exit().await;
        TerminateOutcome { exit, forced: true, timed_out }
    }
}

fn lost_exit() -> ExitObservation {
    ExitObservation {
        code: None,
        success: false,
        description: "Process waiter ended without an exit status".to_string(),
    }
}
