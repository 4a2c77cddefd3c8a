//! One managed server: its state machine, process slot, console and files.
//!
//! All lifecycle requests (start/stop/restart/acknowledge) for a server are
//! serialized by `lifecycle`. State changes happen under `state`, which also
//! emits the status event, so every subscriber sees the same order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::console::{ConsoleBridge, ConsoleSubscription, LineKind, LogSource};
use super::error::{Result, SupervisorError};
use super::events::ServerEvent;
use super::managed_process::ManagedProcess;
use super::players::{PlayerEvent, PlayerRoster};
use super::state_machine::{ProcessState, StateMachine, StatusChange, TransitionCause, TransitionError};
use crate::config::GlobalConfig;
use crate::engine::{EngineProfile, LaunchCommand, VersionCatalog};
use crate::files::{FileManager, FileWatcher};
use crate::instance::{self, ServerInstance, ServerProperties, SettingsPatch};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// API view of a server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    #[serde(flatten)]
    pub instance: ServerInstance,
    pub directory: String,
    pub status: ProcessState,
    pub players: Vec<String>,
    pub eula_accepted: bool,
    pub pid: Option<u32>,
}

enum StartupOutcome {
    Ready,
    Exited,
    TimedOut,
}

pub struct ManagedServer {
    name: String,
    config: Arc<GlobalConfig>,
    profile: Arc<EngineProfile>,
    instance: RwLock<ServerInstance>,
    state: StdMutex<StateMachine>,
    state_tx: watch::Sender<ProcessState>,
    state_rx: watch::Receiver<ProcessState>,
    events: broadcast::Sender<ServerEvent>,
    console: Arc<ConsoleBridge>,
    files: FileManager,
    players: StdMutex<PlayerRoster>,
    process: RwLock<Option<Arc<ManagedProcess>>>,
    lifecycle: Mutex<()>,
    shutdown: CancellationToken,
}

impl ManagedServer {
    /// Build the server and start its file watcher.
    pub fn new(instance: ServerInstance, config: Arc<GlobalConfig>) -> Result<Arc<Self>> {
        let profile = EngineProfile::resolve(instance.engine, &config)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ProcessState::Offline);
        let console = Arc::new(ConsoleBridge::new(config.console_backlog, profile.clone()));
        let watcher = Arc::new(FileWatcher::new(
            &instance.name,
            &instance.directory,
            events.clone(),
            config.file_debounce(),
        ));
        let shutdown = CancellationToken::new();
        watcher.clone().spawn(config.file_scan_interval(), shutdown.clone());

        Ok(Arc::new(Self {
            name: instance.name.clone(),
            config,
            profile,
            instance: RwLock::new(instance),
            state: StdMutex::new(StateMachine::new()),
            state_tx,
            state_rx,
            events,
            console,
            files: FileManager::new(watcher),
            players: StdMutex::new(PlayerRoster::default()),
            process: RwLock::new(None),
            lifecycle: Mutex::new(()),
            shutdown,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.lock_state().state()
    }

    pub async fn instance(&self) -> ServerInstance {
        self.instance.read().await.clone()
    }

    pub fn console(&self) -> &Arc<ConsoleBridge> {
        &self.console
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn players(&self) -> Vec<String> {
        self.lock_players().names()
    }

    pub fn is_retired(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn summary(&self) -> ServerSummary {
        let instance = self.instance().await;
        let pid = self.current_process().await.map(|p| p.pid);
        ServerSummary {
            directory: instance.directory.display().to_string(),
            eula_accepted: instance::eula_accepted(&instance.directory),
            status: self.state(),
            players: self.players(),
            pid,
            instance,
        }
    }

    // ─── State ───────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, StateMachine> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_players(&self) -> MutexGuard<'_, PlayerRoster> {
        self.players.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition and emit while the state lock is held.
    fn apply(
        &self,
        machine: &mut StateMachine,
        to: ProcessState,
        cause: TransitionCause,
    ) -> std::result::Result<StatusChange, TransitionError> {
        let change = machine.transition(to, cause)?;
        tracing::info!(
            "[{}] State transition: {:?} -> {:?} ({:?})",
            self.name, change.previous, change.status, cause
        );
        let _ = self.state_tx.send(change.status);
        let _ = self.events.send(ServerEvent::Status(change.clone()));
        Ok(change)
    }

    fn transition(
        &self,
        to: ProcessState,
        cause: TransitionCause,
    ) -> std::result::Result<StatusChange, TransitionError> {
        let mut machine = self.lock_state();
        self.apply(&mut machine, to, cause)
    }

    /// Transition only if the current state is `from`.
    fn transition_from(&self, from: ProcessState, to: ProcessState, cause: TransitionCause) -> bool {
        let mut machine = self.lock_state();
        machine.state() == from && self.apply(&mut machine, to, cause).is_ok()
    }

    async fn wait_until(&self, pred: impl Fn(ProcessState) -> bool) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| pred(*s)).await;
    }

    fn emit_error(&self, message: impl Into<String>, code: &'static str) {
        let _ = self.events.send(ServerEvent::Error { message: message.into(), code });
    }

    fn clear_players(&self) {
        let changed = self.lock_players().clear();
        if changed {
            let _ = self.events.send(ServerEvent::Players(Vec::new()));
        }
    }

    async fn current_process(&self) -> Option<Arc<ManagedProcess>> {
        self.process.read().await.clone()
    }

    /// Empty the process slot if it still holds `process`.
    async fn release_process(&self, process: &Arc<ManagedProcess>) {
        let mut slot = self.process.write().await;
        if slot.as_ref().map_or(false, |p| Arc::ptr_eq(p, process)) {
            *slot = None;
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_retired() {
            return Err(SupervisorError::NotFound(format!("server '{}'", self.name)));
        }
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Start the server. A no-op when already starting or online.
    pub async fn request_start(self: &Arc<Self>) -> Result<()> {
        self.ensure_active()?;
        if matches!(self.state(), ProcessState::Starting | ProcessState::Online) {
            return Ok(());
        }
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Stop the server. A no-op when offline or crashed; `force` skips the grace
    /// period, and cuts short one already in progress.
    pub async fn request_stop(self: &Arc<Self>, force: bool) -> Result<()> {
        match self.state() {
            ProcessState::Offline | ProcessState::Crashed => return Ok(()),
            ProcessState::Stopping if force => {
                if let Some(process) = self.current_process().await {
                    process.force_kill();
                }
            }
            _ => {}
        }
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(force).await
    }

    /// Stop (bounded, escalating to a kill) then start, under one guard.
    pub async fn request_restart(self: &Arc<Self>) -> Result<()> {
        self.ensure_active()?;
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(false).await?;
        self.start_locked().await
    }

    /// crashed -> offline
    pub async fn acknowledge_crash(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ProcessState::Crashed {
            self.transition(ProcessState::Offline, TransitionCause::Acknowledged)?;
        }
        Ok(())
    }

    async fn start_locked(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ProcessState::Starting | ProcessState::Online => return Ok(()),
            // 콘솔에서 stop 을 입력한 경우: 종료가 끝난 뒤 시작
            ProcessState::Stopping => self.stop_locked(false).await?,
            ProcessState::Offline | ProcessState::Crashed => {}
        }
        if self.state() == ProcessState::Crashed {
            self.transition(ProcessState::Offline, TransitionCause::Acknowledged)?;
        }

        let instance = self.instance().await;
        if !instance::eula_accepted(&instance.directory) {
            let message = format!("Server '{}' needs the Minecraft EULA accepted before it can start", self.name);
            let _ = self.events.send(ServerEvent::NeedEula(message));
            return Err(SupervisorError::EulaNotAccepted(self.name.clone()));
        }

        self.transition(ProcessState::Starting, TransitionCause::Requested)?;
        self.clear_players();

        // 프로세스 출력보다 먼저 구독해야 준비 완료 줄을 놓치지 않음
        let live = self.console.subscribe_live();
        let launched = match LaunchCommand::build(&self.config, &self.profile, &instance) {
            Ok(command) => ManagedProcess::launch(&instance, &command, self.console.clone()).await,
            Err(e) => Err(e),
        };
        let process = match launched {
            Ok(process) => Arc::new(process),
            Err(e) => {
                tracing::warn!("[{}] Failed to start: {}", self.name, e);
                self.console.system(format!("Failed to start: {}", e));
                let _ = self.transition(ProcessState::Offline, TransitionCause::SpawnFailed);
                return Err(e);
            }
        };
        *self.process.write().await = Some(process.clone());

        let (ready_tx, mut ready_rx) = watch::channel(false);
        tokio::spawn(self.clone().watch_process(live, process.clone(), ready_tx));

        let timeout = self.config.startup_timeout();
        let outcome = tokio::select! {
            ready = wait_ready(&mut ready_rx) => {
                if ready { StartupOutcome::Ready } else { StartupOutcome::Exited }
            }
            _ = process.wait_exit() => StartupOutcome::Exited,
            _ = tokio::time::sleep(timeout) => StartupOutcome::TimedOut,
        };

        match outcome {
            StartupOutcome::Ready
                if self.transition_from(ProcessState::Starting, ProcessState::Online, TransitionCause::Ready) =>
            {
                Ok(())
            }
            StartupOutcome::TimedOut => {
                // 준비 완료 문구가 엔진 버전에 따라 다를 수 있으므로 종료하지 않고 online 으로 간주
                let message = format!(
                    "Server '{}' did not report ready within {}s, assuming it is online",
                    self.name,
                    timeout.as_secs()
                );
                tracing::warn!("{}", message);
                if self.transition_from(ProcessState::Starting, ProcessState::Online, TransitionCause::StartupTimeout) {
                    self.console.system(message.clone());
                    self.emit_error(message, "TIMEOUT");
                    Ok(())
                } else {
                    // 그 사이 프로세스가 종료됨
                    let exit = process.wait_exit().await;
                    self.wait_until(|s| s != ProcessState::Starting).await;
                    Err(SupervisorError::SpawnFailed(format!(
                        "server exited during startup ({})",
                        exit.description
                    )))
                }
            }
            _ => {
                // 시작 도중 종료: watch_process 가 crashed 로 전환할 때까지 대기
                let exit = process.wait_exit().await;
                self.wait_until(|s| s != ProcessState::Starting).await;
                Err(SupervisorError::SpawnFailed(format!(
                    "server exited during startup ({})",
                    exit.description
                )))
            }
        }
    }

    async fn stop_locked(&self, force: bool) -> Result<()> {
        let state = self.state();
        if !matches!(state, ProcessState::Online | ProcessState::Stopping) {
            return Ok(());
        }
        let Some(process) = self.current_process().await else {
            // 프로세스는 이미 종료됨, watch_process 가 상태를 정리할 때까지 대기
            self.wait_until(ProcessState::is_settled).await;
            return Ok(());
        };

        if state == ProcessState::Online
            && !self.transition_from(ProcessState::Online, ProcessState::Stopping, TransitionCause::Requested)
        {
            // 그 사이 크래시로 전환됨
            return Ok(());
        }

        let grace = self.config.shutdown_timeout();
        let outcome = process.terminate(!force, grace).await;
        if outcome.timed_out {
            self.emit_error(
                format!(
                    "Server '{}' did not stop within {}s and was killed",
                    self.name,
                    grace.as_secs()
                ),
                "TIMEOUT",
            );
        }
        self.wait_until(ProcessState::is_settled).await;
        Ok(())
    }

    /// Follows one process until it exits: readiness, console-initiated
    /// shutdown, players and EULA notices, then settles the exit.
    ///
    /// Output is published before the exit is, so handling pending lines first
    /// guarantees a `Stopping server` line is seen before the exit settles.
    async fn watch_process(
        self: Arc<Self>,
        mut live: ConsoleSubscription,
        process: Arc<ManagedProcess>,
        ready_tx: watch::Sender<bool>,
    ) {
        let mut ready_tx = Some(ready_tx);
        // 콘솔에서 시작된 종료가 제한 시간 안에 끝나지 않으면 강제 종료
        let mut stop_deadline: Option<tokio::time::Instant> = None;
        loop {
            let deadline = async move {
                match stop_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let line = tokio::select! {
                biased;
                line = live.next() => match line {
                    Some(line) => line,
                    None => break,
                },
                _ = process.wait_exit() => break,
                _ = deadline => {
                    stop_deadline = None;
                    if self.state() == ProcessState::Stopping {
                        let grace = self.config.shutdown_timeout();
                        let message = format!(
                            "Server '{}' did not stop within {}s and was killed",
                            self.name,
                            grace.as_secs()
                        );
                        tracing::warn!("{}", message);
                        self.emit_error(message, "TIMEOUT");
                        process.force_kill();
                    }
                    continue;
                }
            };
            if line.source == LogSource::System {
                continue;
            }

            if ready_tx.is_some() && self.profile.ready.is_match(&line.text) {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(true);
                }
            }

            if self.profile.shutdown.is_match(&line.text)
                && self.transition_from(ProcessState::Online, ProcessState::Stopping, TransitionCause::ConsoleStop)
            {
                tracing::info!("[{}] Shutdown initiated from the server console", self.name);
                stop_deadline = Some(tokio::time::Instant::now() + self.config.shutdown_timeout());
            }

            if let Some(event) = PlayerEvent::parse(&self.profile, &line.text) {
                let names = {
                    let mut roster = self.lock_players();
                    roster.apply(event).then(|| roster.names())
                };
                if let Some(names) = names {
                    let _ = self.events.send(ServerEvent::Players(names));
                }
            }

            if line.classification == LineKind::Eula {
                let _ = self.events.send(ServerEvent::NeedEula(line.text.clone()));
            }
        }
        drop(ready_tx);
        self.settle_exit(&process).await;
    }

    async fn settle_exit(&self, process: &Arc<ManagedProcess>) {
        let exit = process.wait_exit().await;
        self.release_process(process).await;
        self.clear_players();

        let mut machine = self.lock_state();
        match machine.state() {
            ProcessState::Stopping => {
                let _ = self.apply(&mut machine, ProcessState::Offline, TransitionCause::Exited);
            }
            ProcessState::Starting | ProcessState::Online => {
                tracing::warn!("[{}] Server process died unexpectedly: {}", self.name, exit.description);
                let _ = self.apply(&mut machine, ProcessState::Crashed, TransitionCause::UnexpectedExit);
                drop(machine);
                self.emit_error(
                    format!("Server '{}' crashed: {}", self.name, exit.description),
                    "CRASHED",
                );
            }
            ProcessState::Offline | ProcessState::Crashed => {}
        }
    }

    // ─── Console ─────────────────────────────────────────────

    /// Forward a command line to the running process.
    pub async fn submit_command(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SupervisorError::InvalidSpec("command must not be empty".into()));
        }
        let process = match self.current_process().await {
            Some(process) if !process.has_exited() => process,
            _ => return Err(SupervisorError::ServerOffline(self.name.clone())),
        };
        self.console.system(format!("> {}", text));
        process
            .write_line(text)
            .await
            .map_err(|_| SupervisorError::ServerOffline(self.name.clone()))
    }

    // ─── Offline-only edits ──────────────────────────────────

    fn ensure_offline(&self) -> Result<()> {
        if self.state().is_settled() {
            Ok(())
        } else {
            Err(SupervisorError::ServerRunning(self.name.clone()))
        }
    }

    pub async fn accept_eula(&self) -> Result<()> {
        let dir = self.instance.read().await.directory.clone();
        instance::accept_eula(&dir)?;
        self.console.system("EULA accepted");
        self.files.watcher().invalidate();
        Ok(())
    }

    /// Apply settings to `server.json` and `server.properties`. Offline only.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<ServerInstance> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_offline()?;
        let mut instance = self.instance.write().await;
        let mut next = instance.clone();
        next.apply(patch)?;
        next.save()?;
        ServerProperties::sync_from_instance(&next.directory, &next)?;
        *instance = next.clone();
        self.files.watcher().invalidate();
        Ok(next)
    }

    pub async fn properties(&self) -> Result<BTreeMap<String, String>> {
        let dir = self.instance.read().await.directory.clone();
        Ok(ServerProperties::load(&dir)?.entries())
    }

    /// Set `server.properties` keys. Port and player limits go through the
    /// instance config so both files agree. Offline only.
    pub async fn update_properties(&self, values: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_offline()?;

        let mut patch = SettingsPatch::default();
        if let Some(port) = values.get("server-port") {
            patch.port = Some(port.parse().map_err(|_| {
                SupervisorError::InvalidSpec(format!("server-port '{}' is not a port", port))
            })?);
        }
        if let Some(max) = values.get("max-players") {
            patch.max_players = Some(max.parse().map_err(|_| {
                SupervisorError::InvalidSpec(format!("max-players '{}' is not a number", max))
            })?);
        }

        let mut instance = self.instance.write().await;
        let mut next = instance.clone();
        next.apply(&patch)?;

        let mut props = ServerProperties::load(&next.directory)?;
        for (key, value) in values {
            if key.is_empty() || key.contains('=') || key.contains('\n') || value.contains('\n') {
                return Err(SupervisorError::InvalidSpec(format!("invalid property '{}'", key)));
            }
            props.set(key, value.clone());
        }
        props.save(&next.directory)?;
        next.save()?;
        *instance = next;
        self.files.watcher().invalidate();
        Ok(props.entries())
    }

    /// Download the engine jar for the configured version. Offline only.
    pub async fn install_jar(&self, catalog: &VersionCatalog) -> Result<u64> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_offline()?;
        let instance = self.instance().await;
        self.console.system(format!("Downloading {} {}...", instance.engine, instance.version));
        match catalog.download_jar(instance.engine, &instance.version, &instance.jar_path()).await {
            Ok(bytes) => {
                self.console.system(format!("Installed {} ({} bytes)", instance.jar_file, bytes));
                self.files.watcher().invalidate();
                Ok(bytes)
            }
            Err(e) => {
                let message = format!("Failed to download {} {}: {:#}", instance.engine, instance.version, e);
                self.console.system(message.clone());
                self.emit_error(message.clone(), "DOWNLOAD_FAILED");
                Err(SupervisorError::Download(message))
            }
        }
    }

    /// Mark the server deleted. Fails with `ServerRunning` unless offline
    /// (a crashed server is acknowledged first).
    pub async fn retire(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ProcessState::Crashed {
            self.transition(ProcessState::Offline, TransitionCause::Acknowledged)?;
        }
        if self.state() != ProcessState::Offline {
            return Err(SupervisorError::ServerRunning(self.name.clone()));
        }
        self.shutdown.cancel();
        let _ = self.events.send(ServerEvent::Removed);
        Ok(())
    }
}

async fn wait_ready(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|ready| *ready).await.is_ok()
}
