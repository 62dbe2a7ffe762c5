//! Question answering: classify, build, retrieve, format, generate, validate.
//!
//! Every call produces a well-formed [`AnswerResponse`]. Classification,
//! query building and retrieval abort the run with a scaled-down confidence;
//! formatting and generation degrade to a cruder answer instead.

pub mod error;
pub mod format;
pub mod prompts;
pub mod telemetry;
pub mod validate;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::SmartQueryCache;
use crate::db::{QueryExecutor, Row, UserContextProvider};
use crate::intent::{ClassifiedIntent, IntentGuard, QueryCategory};
use crate::llm::{CompletionRequest, LanguageModel, LlmError, extract_json};
use crate::query::{BuildOptions, QueryBuilder, QueryBuilderResult, UserContext};
use crate::session::{ConversationTurn, SessionManager};
use crate::util::truncate_chars;

pub use error::StageError;
pub use format::{ContextFormatter, FormatError, GroundingFormatter};
pub use telemetry::{ChannelSink, FanoutSink, RecordingSink, Stage, StageEvent, StageSink, TracingSink};
pub use validate::{Validation, validate_answer};

const BUILD_PENALTY: f64 = 0.3;
const EXECUTION_PENALTY: f64 = 0.5;
const FORMAT_PENALTY: f64 = 0.9;
const GENERATION_PENALTY: f64 = 0.6;
const UNVERIFIED_PENALTY: f64 = 0.8;

const CLASSIFICATION_APOLOGY: &str =
    "Sorry, I couldn't understand that question well enough to look it up. Could you rephrase it?";
const NO_DATA_ANSWER: &str = "I couldn't find any data matching that question.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    #[default]
    Data,
    Coach,
}

impl AnswerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerMode::Data => "data",
            AnswerMode::Coach => "coach",
        }
    }

    /// Unknown values fall back to `Data`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "coach" | "coaching" => AnswerMode::Coach,
            _ => AnswerMode::Data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerRequest {
    pub user_id: String,
    pub question: String,
    pub mode: AnswerMode,
    pub options: BuildOptions,
}

impl AnswerRequest {
    pub fn new(user_id: &str, question: &str, mode: AnswerMode) -> Self {
        Self {
            user_id: user_id.to_string(),
            question: question.to_string(),
            mode,
            options: BuildOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub confidence: f64,
    pub mode: AnswerMode,
    pub category: Option<QueryCategory>,
    pub explanation: String,
    /// Placeholder form; bound values never appear here.
    pub sql: Option<String>,
    pub row_count: usize,
    pub cached: bool,
    pub degraded: Vec<Stage>,
    pub unverified: Vec<String>,
    pub warnings: Vec<String>,
    pub session_id: Option<String>,
}

impl AnswerResponse {
    fn new(mode: AnswerMode, answer: String, confidence: f64) -> Self {
        Self {
            answer,
            confidence: confidence.clamp(0.0, 1.0),
            mode,
            category: None,
            explanation: String::new(),
            sql: None,
            row_count: 0,
            cached: false,
            degraded: Vec::new(),
            unverified: Vec::new(),
            warnings: Vec::new(),
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Stage(StageEvent),
    Delta { text: String },
    Complete(AnswerResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub max_grounding_rows: usize,
    pub max_value_chars: usize,
    pub history_turns: usize,
    pub sql_excerpt_chars: usize,
    pub raw_dump_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_grounding_rows: 50,
            max_value_chars: 200,
            history_turns: 6,
            sql_excerpt_chars: 240,
            raw_dump_chars: 4000,
        }
    }
}

/// Per-run event plumbing: every stage goes to the sink, and to the stream
/// when the caller asked for one.
struct Run<'a> {
    user_id: &'a str,
    sink: &'a dyn StageSink,
    events: Option<&'a mpsc::UnboundedSender<PipelineEvent>>,
}

impl Run<'_> {
    fn emit(&self, stage: Stage, started: Instant, error: Option<String>) {
        let event = StageEvent::new(stage, self.user_id, started.elapsed(), error);
        if let Some(tx) = self.events {
            let _ = tx.send(PipelineEvent::Stage(event.clone()));
        }
        self.sink.record(event);
    }
}

pub struct AnswerPipeline {
    llm: Arc<dyn LanguageModel>,
    builder: Arc<QueryBuilder>,
    cache: Arc<SmartQueryCache>,
    executor: Arc<dyn QueryExecutor>,
    users: Arc<dyn UserContextProvider>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn StageSink>,
    formatter: Arc<dyn ContextFormatter>,
    guard: IntentGuard,
    settings: PipelineSettings,
}

impl AnswerPipeline {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        builder: Arc<QueryBuilder>,
        cache: Arc<SmartQueryCache>,
        executor: Arc<dyn QueryExecutor>,
        users: Arc<dyn UserContextProvider>,
        sessions: Arc<SessionManager>,
        settings: PipelineSettings,
    ) -> Self {
        let guard = IntentGuard::new(&builder.heuristics().fallback_table);
        let formatter = GroundingFormatter {
            max_rows: settings.max_grounding_rows,
            max_value_chars: settings.max_value_chars,
        };
        Self {
            llm,
            builder,
            cache,
            executor,
            users,
            sessions,
            sink: Arc::new(TracingSink),
            formatter: Arc::new(formatter),
            guard,
            settings,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StageSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn ContextFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn cache(&self) -> &Arc<SmartQueryCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn answer(&self, request: AnswerRequest) -> AnswerResponse {
        self.run(request, None).await
    }

    /// Same stages as [`answer`](Self::answer), reported as they happen. The
    /// stream always ends with exactly one `Complete` event.
    pub fn answer_stream(self: &Arc<Self>, request: AnswerRequest) -> BoxStream<'static, PipelineEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let response = pipeline.run(request, Some(&tx)).await;
            let _ = tx.send(PipelineEvent::Complete(response));
        });

        Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        })
    }

    async fn run(
        &self,
        request: AnswerRequest,
        events: Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> AnswerResponse {
        let run = Run {
            user_id: &request.user_id,
            sink: self.sink.as_ref(),
            events,
        };
        let question = request.question.trim();
        let mode = request.mode;
        info!("Answering {} question for user {}", mode.as_str(), request.user_id);

        let user = self.user_context(&run, &request.user_id).await;
        let recent = self
            .sessions
            .recent_turns(&request.user_id, self.settings.history_turns)
            .await;

        let started = Instant::now();
        let classified = match self.classify(question, &recent).await {
            Ok(classified) => {
                run.emit(Stage::Classification, started, None);
                classified
            }
            Err(e) => {
                error!("Classification failed for user {}: {}", request.user_id, e);
                run.emit(Stage::Classification, started, Some(e.to_string()));
                let response = AnswerResponse::new(mode, CLASSIFICATION_APOLOGY.to_string(), 0.0);
                return self.finish(&request, response, None).await;
            }
        };
        let intent_json = serde_json::to_value(&classified.intent).ok();
        let confidence = classified.confidence;

        let options = merge_options(&request.options, &classified);
        let started = Instant::now();
        let built = match self.builder.build_query(&classified.intent, Some(&user), &options) {
            Ok(built) => {
                run.emit(Stage::QueryBuild, started, None);
                built
            }
            Err(e) => {
                let e = StageError::from(e);
                error!("Query build failed for user {}: {}", request.user_id, e);
                run.emit(Stage::QueryBuild, started, Some(e.to_string()));
                let mut response = AnswerResponse::new(mode, build_failure_answer(&classified), confidence * BUILD_PENALTY);
                response.category = Some(classified.intent.category);
                response.explanation = classified.explanation.clone();
                response.warnings = classified.warnings.clone();
                return self.finish(&request, response, intent_json).await;
            }
        };
        debug!("Built SQL for user {}:\n{}", request.user_id, built.sql);

        let mut response = AnswerResponse::new(mode, String::new(), confidence);
        response.category = Some(classified.intent.category);
        response.explanation = built.explanation.clone();
        response.sql = Some(built.sql.clone());
        response.warnings = classified.warnings.iter().chain(&built.warnings).cloned().collect();

        let started = Instant::now();
        let rows = match self.retrieve(&request.user_id, &built).await {
            Ok((rows, cached)) => {
                run.emit(Stage::Retrieval, started, None);
                response.cached = cached;
                rows
            }
            Err(e) => {
                error!("Retrieval failed for user {}: {}", request.user_id, e);
                run.emit(Stage::Retrieval, started, Some(e.to_string()));
                response.answer = format!(
                    "I couldn't retrieve the data for that question. Query attempted: {}",
                    truncate_chars(&built.sql, self.settings.sql_excerpt_chars)
                );
                response.confidence = (confidence * EXECUTION_PENALTY).clamp(0.0, 1.0);
                return self.finish(&request, response, intent_json).await;
            }
        };
        response.row_count = rows.len();

        if rows.is_empty() && mode == AnswerMode::Data {
            info!("No rows for user {}, skipping generation", request.user_id);
            response.answer = NO_DATA_ANSWER.to_string();
            return self.finish(&request, response, intent_json).await;
        }

        let mut confidence = confidence;
        let started = Instant::now();
        let grounding = match self.formatter.format(&rows, &user, &built) {
            Ok(text) => {
                run.emit(Stage::Formatting, started, None);
                text
            }
            Err(e) => {
                let e = StageError::from(e);
                warn!("Formatting degraded to raw rows: {}", e);
                run.emit(Stage::Formatting, started, Some(e.to_string()));
                response.degraded.push(Stage::Formatting);
                confidence *= FORMAT_PENALTY;
                format::raw_dump(&rows, self.settings.raw_dump_chars)
            }
        };

        let prompt = prompts::answer_request(mode, question, &grounding, &recent);
        let started = Instant::now();
        let generated = match events {
            Some(tx) => self.generate_streaming(&prompt, tx).await,
            None => self.llm.complete(&prompt).await.map_err(StageError::from),
        };
        let generated = generated.and_then(|text| {
            if text.trim().is_empty() {
                Err(StageError::Generation(LlmError::Response("empty answer".to_string())))
            } else {
                Ok(text)
            }
        });

        match generated {
            Ok(text) => {
                run.emit(Stage::Generation, started, None);
                let started = Instant::now();
                let checked = validate_answer(text.trim(), &grounding);
                run.emit(Stage::Validation, started, None);
                if !checked.unverified.is_empty() {
                    warn!("Answer cites {} unverified figure(s)", checked.unverified.len());
                    confidence *= UNVERIFIED_PENALTY;
                }
                response.answer = checked.answer;
                response.unverified = checked.unverified;
            }
            Err(e) => {
                warn!("Generation degraded to grounding text: {}", e);
                run.emit(Stage::Generation, started, Some(e.to_string()));
                response.degraded.push(Stage::Generation);
                confidence *= GENERATION_PENALTY;
                response.answer = grounding;
            }
        }

        response.confidence = confidence.clamp(0.0, 1.0);
        self.finish(&request, response, intent_json).await
    }

    async fn user_context(&self, run: &Run<'_>, user_id: &str) -> UserContext {
        let started = Instant::now();
        match self.users.user_context(user_id).await {
            Ok(Some(user)) => {
                run.emit(Stage::UserContext, started, None);
                user
            }
            Ok(None) => {
                debug!("No directory entry for {}, using anonymous context", user_id);
                run.emit(Stage::UserContext, started, None);
                UserContext::anonymous(user_id)
            }
            Err(e) => {
                warn!("User lookup failed for {}: {}", user_id, e);
                run.emit(Stage::UserContext, started, Some(e.to_string()));
                UserContext::anonymous(user_id)
            }
        }
    }

    async fn classify(&self, question: &str, recent: &[ConversationTurn]) -> Result<ClassifiedIntent, StageError> {
        if question.is_empty() {
            return Err(StageError::Classification("empty question".to_string()));
        }
        let request = prompts::classification_request(self.builder.registry(), question, recent);
        let raw = self.llm.complete(&request).await.map_err(|e| StageError::Classification(e.to_string()))?;
        let value = extract_json(&raw)
            .ok_or_else(|| StageError::Classification("model reply contained no JSON object".to_string()))?;
        Ok(self.guard.validate(&value)?)
    }

    /// Cached rows when fresh, otherwise executes the rendered SQL and
    /// caches the result.
    async fn retrieve(&self, user_id: &str, built: &QueryBuilderResult) -> Result<(Vec<Row>, bool), StageError> {
        if let Some(rows) = self.cache.get(&built.sql, user_id, &built.params).await {
            return Ok((rows, true));
        }
        let sql = built.rendered_sql()?;
        let rows = self.executor.execute(&sql).await?;
        self.cache.set(&built.sql, user_id, &built.params, &rows).await;
        Ok((rows, false))
    }

    async fn generate_streaming(
        &self,
        request: &CompletionRequest,
        tx: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<String, StageError> {
        let mut stream = self.llm.complete_stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            text.push_str(&chunk);
            let _ = tx.send(PipelineEvent::Delta { text: chunk });
        }
        Ok(text)
    }

    async fn finish(
        &self,
        request: &AnswerRequest,
        mut response: AnswerResponse,
        intent: Option<serde_json::Value>,
    ) -> AnswerResponse {
        match self
            .sessions
            .record_turn(
                &request.user_id,
                &request.question,
                Some(&response.answer),
                request.mode,
                intent,
            )
            .await
        {
            Ok(turn) => response.session_id = Some(turn.session_id),
            Err(e) => warn!("Failed to record turn for user {}: {}", request.user_id, e),
        }
        info!(
            "Answered user {} with confidence {:.2} ({} rows, cached: {})",
            request.user_id, response.confidence, response.row_count, response.cached
        );
        response
    }
}

/// Caller options win; the classifier fills whatever they leave open.
fn merge_options(requested: &BuildOptions, classified: &ClassifiedIntent) -> BuildOptions {
    let mut options = requested.clone();
    if options.group_by.is_empty() {
        options.group_by = classified.group_by.clone();
    }
    if options.aggregate_field.is_none() {
        options.aggregate_field = classified.aggregate_field.clone();
    }
    options
}

fn build_failure_answer(classified: &ClassifiedIntent) -> String {
    if classified.explanation.trim().is_empty() {
        "I understood the question but couldn't build a query for it.".to_string()
    } else {
        format!(
            "I understood the question ({}) but couldn't build a query for it.",
            classified.explanation.trim()
        )
    }
}
