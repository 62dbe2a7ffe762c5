use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::pipeline::{AnswerPipeline, RecordingSink};

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub pipeline: Arc<AnswerPipeline>,
    // Recent stage events, shown by the status endpoint
    pub stage_log: Arc<RecordingSink>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<AnswerPipeline>, stage_log: Arc<RecordingSink>) -> Self {
        Self {
            config,
            pipeline,
            stage_log,
            startup_time: Utc::now(),
        }
    }
}
