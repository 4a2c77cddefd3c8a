//! Console Bridge - per-server fan-out of process output
//!
//! - Bounded ring buffer of recent lines, replayed to new subscribers
//! - Live broadcast to any number of subscribers, each with its own cursor
//! - Best-effort classification of every line
//!
//! Publishing never waits on subscribers. A subscriber that falls behind the
//! broadcast channel resumes from the ring buffer by line id.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::EngineProfile;
use crate::utils::current_timestamp;

const LIVE_CHANNEL_CAPACITY: usize = 2048;

// ─── Line Types ──────────────────────────────────────────────

/// A single line of console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    /// Sequential ID for polling (`GET /console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub classification: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the supervisor itself
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Info,
    Warning,
    Error,
    Debug,
    Startup,
    Shutdown,
    Eula,
    System,
    Other,
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent console lines with sequential IDs.
struct LogBuffer {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size),
            next_id: 1,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, text: String, classification: LineKind) -> ConsoleLine {
        let line = ConsoleLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            classification,
            text,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with id > `since_id`.
    fn get_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

// ─── Classification ──────────────────────────────────────────

/// Classify one line. Misclassification is cosmetic; this never fails.
pub fn classify(profile: &EngineProfile, source: LogSource, text: &str) -> LineKind {
    if source == LogSource::System {
        return LineKind::System;
    }

    let kind = classify_text(profile, text);
    // stderr lines default to at least Warning
    if source == LogSource::Stderr && matches!(kind, LineKind::Info | LineKind::Other) {
        LineKind::Warning
    } else {
        kind
    }
}

fn classify_text(profile: &EngineProfile, text: &str) -> LineKind {
    if profile.ready.is_match(text) {
        return LineKind::Startup;
    }
    if profile.shutdown.is_match(text) {
        return LineKind::Shutdown;
    }
    if profile.eula.is_match(text) {
        return LineKind::Eula;
    }

    if let Some(level) = profile.level.captures(text).and_then(|c| c.name("level")) {
        return match level.as_str() {
            "ERROR" | "SEVERE" | "FATAL" => LineKind::Error,
            "WARN" | "WARNING" => LineKind::Warning,
            "DEBUG" | "TRACE" => LineKind::Debug,
            _ if text.to_ascii_lowercase().contains("starting minecraft server") => {
                LineKind::Startup
            }
            _ => LineKind::Info,
        };
    }

    // 로그 포맷이 없는 줄: 스택 트레이스 정도만 구분
    let trimmed = text.trim_start();
    if trimmed.starts_with("at ") || trimmed.starts_with("Caused by:") || text.contains("Exception") {
        return LineKind::Error;
    }
    LineKind::Other
}

// ─── Bridge ──────────────────────────────────────────────────

pub struct ConsoleBridge {
    buffer: Mutex<LogBuffer>,
    live: broadcast::Sender<ConsoleLine>,
    profile: Arc<EngineProfile>,
}

impl ConsoleBridge {
    pub fn new(capacity: usize, profile: Arc<EngineProfile>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            buffer: Mutex::new(LogBuffer::with_capacity(capacity)),
            live,
            profile,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        // 버퍼는 push 도중 panic 할 수 없으므로 poison 상태여도 그대로 사용
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn profile(&self) -> &Arc<EngineProfile> {
        &self.profile
    }

    /// Classify, append and broadcast one line.
    pub fn publish(&self, source: LogSource, text: impl Into<String>) -> ConsoleLine {
        let text = text.into();
        let kind = classify(&self.profile, source, &text);
        let mut buffer = self.lock();
        let line = buffer.push(source, text, kind);
        // 버퍼 잠금 안에서 전송해야 subscribe 스냅샷과 순서가 어긋나지 않음
        let _ = self.live.send(line.clone());
        line
    }

    pub fn system(&self, text: impl Into<String>) -> ConsoleLine {
        self.publish(LogSource::System, text)
    }

    /// Backlog (most recent lines) first, then live lines.
    pub fn subscribe(self: &Arc<Self>) -> ConsoleSubscription {
        let buffer = self.lock();
        let backlog: VecDeque<ConsoleLine> = buffer.lines.iter().cloned().collect();
        let rx = self.live.subscribe();
        drop(buffer);
        ConsoleSubscription {
            bridge: Arc::clone(self),
            backlog,
            rx,
            last_id: None,
        }
    }

    /// Live lines only, starting after the newest buffered line.
    pub fn subscribe_live(self: &Arc<Self>) -> ConsoleSubscription {
        let buffer = self.lock();
        let last_id = buffer.lines.back().map(|l| l.id);
        let rx = self.live.subscribe();
        drop(buffer);
        ConsoleSubscription {
            bridge: Arc::clone(self),
            backlog: VecDeque::new(),
            rx,
            last_id,
        }
    }

    pub fn lines_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lock().get_since(since_id)
    }

    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.lock().get_recent(count)
    }
}

/// One subscriber's independent cursor over a [`ConsoleBridge`].
pub struct ConsoleSubscription {
    bridge: Arc<ConsoleBridge>,
    backlog: VecDeque<ConsoleLine>,
    rx: broadcast::Receiver<ConsoleLine>,
    last_id: Option<u64>,
}

impl ConsoleSubscription {
    /// Next line in production order; `None` once the bridge is gone.
    pub async fn next(&mut self) -> Option<ConsoleLine> {
        loop {
            if let Some(line) = self.take_buffered() {
                return Some(line);
            }
            match self.rx.recv().await {
                Ok(line) => {
                    if self.last_id.map_or(false, |last| line.id <= last) {
                        continue;
                    }
                    self.last_id = Some(line.id);
                    return Some(line);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Console subscriber lagged by {} lines, catching up from buffer", skipped);
                    let since = self.last_id.unwrap_or(0);
                    self.backlog = self.bridge.lines_since(since).into();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Pop a replayed line without waiting for live output.
    pub fn take_buffered(&mut self) -> Option<ConsoleLine> {
        let line = self.backlog.pop_front()?;
        self.last_id = Some(line.id);
        Some(line)
    }
}

// ─── Tests ───────────────────────────────────────────────────
