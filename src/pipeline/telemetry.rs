use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    UserContext,
    Classification,
    QueryBuild,
    Retrieval,
    Formatting,
    Generation,
    Validation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::UserContext => "user_context",
            Stage::Classification => "classification",
            Stage::QueryBuild => "query_build",
            Stage::Retrieval => "retrieval",
            Stage::Formatting => "formatting",
            Stage::Generation => "generation",
            Stage::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub user_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl StageEvent {
    pub fn new(stage: Stage, user_id: &str, elapsed: Duration, error: Option<String>) -> Self {
        Self {
            stage,
            user_id: user_id.to_string(),
            success: error.is_none(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            error,
            at: Utc::now(),
        }
    }
}

/// Receives one event per stage. Must return immediately and never fail.
pub trait StageSink: Send + Sync {
    fn record(&self, event: StageEvent);
}

fn log_event(event: &StageEvent) {
    match &event.error {
        None => info!(
            stage = event.stage.as_str(),
            duration_ms = event.duration_ms,
            user = %event.user_id,
            "Stage completed"
        ),
        Some(error) => warn!(
            stage = event.stage.as_str(),
            duration_ms = event.duration_ms,
            user = %event.user_id,
            error = %error,
            "Stage failed"
        ),
    }
}

/// Logs inline.
pub struct TracingSink;

impl StageSink for TracingSink {
    fn record(&self, event: StageEvent) {
        log_event(&event);
    }
}

/// Hands events to a background task over an unbounded channel, so the
/// request path never waits on whatever the consumer does.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StageEvent>,
}

impl ChannelSink {
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StageEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                log_event(&event);
            }
        });
        (Self { tx }, handle)
    }
}

impl StageSink for ChannelSink {
    fn record(&self, event: StageEvent) {
        // A closed consumer only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Keeps the newest `capacity` events for inspection.
pub struct RecordingSink {
    capacity: usize,
    events: Mutex<VecDeque<StageEvent>>,
}

impl RecordingSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<StageEvent> {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        events.iter().cloned().collect()
    }
}

impl StageSink for RecordingSink {
    fn record(&self, event: StageEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn StageSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn StageSink>>) -> Self {
        Self { sinks }
    }
}

impl StageSink for FanoutSink {
    fn record(&self, event: StageEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}
