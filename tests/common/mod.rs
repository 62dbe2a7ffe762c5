#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nl_insight::cache::{CacheSettings, SmartQueryCache};
use nl_insight::db::{ExecutionError, QueryExecutor, Row, UserContextProvider};
use nl_insight::llm::{CompletionRequest, LanguageModel, LlmError, TextStream};
use nl_insight::pipeline::{AnswerPipeline, PipelineSettings, RecordingSink};
use nl_insight::query::{BuilderHeuristics, QueryBuilder, UserContext};
use nl_insight::schema::SchemaRegistry;
use nl_insight::session::{MemoryConversationStore, SessionManager, SessionSettings};
use nl_insight::util::SystemClock;

pub const HIGH_ENGAGEMENT: &str = r#"{
    "category": "ACCOUNT_QUERY",
    "tables": ["accounts"],
    "filters": {"accounts.engagement_score": {"gt": 70}},
    "confidence": 0.9,
    "explanation": "accounts with high engagement"
}"#;

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row literal is an object")
}

/// Answers classification requests (JSON mode) and answer requests from
/// fixed scripts, recording every prompt it sees.
pub struct ScriptedLlm {
    classification: String,
    answer: Option<String>,
    pub answer_calls: AtomicUsize,
    pub prompts: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(classification: &str, answer: Option<&str>) -> Self {
        Self {
            classification: classification.to_string(),
            answer: answer.map(str::to_string),
            answer_calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn next_answer(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(request.clone());
        if request.json {
            return Ok(self.classification.clone());
        }
        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .clone()
            .ok_or_else(|| LlmError::Connection("model offline".to_string()))
    }

    pub fn classification_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.json)
            .map(|r| r.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.next_answer(request)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, LlmError> {
        let text = self.next_answer(request)?;
        let chunks: Vec<Result<String, LlmError>> = text
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

pub struct FakeExecutor {
    rows: Vec<Row>,
    fail: bool,
    pub executed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn returning(rows: Vec<Row>) -> Self {
        Self {
            rows,
            fail: false,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            rows: Vec::new(),
            fail: true,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.executed.lock().unwrap().len()
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecutionError> {
        self.executed.lock().unwrap().push(sql.to_string());
        if self.fail {
            return Err(ExecutionError::Remote("connection refused".to_string()));
        }
        Ok(self.rows.clone())
    }
}

pub struct FakeUsers {
    role: Option<String>,
}

impl FakeUsers {
    pub fn with_role(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
        }
    }

    pub fn broken() -> Self {
        Self { role: None }
    }
}

#[async_trait]
impl UserContextProvider for FakeUsers {
    async fn user_context(&self, user_id: &str) -> Result<Option<UserContext>, ExecutionError> {
        match &self.role {
            Some(role) => Ok(Some(UserContext::new(user_id, role))),
            None => Err(ExecutionError::Remote("directory unavailable".to_string())),
        }
    }
}

pub struct Harness {
    pub pipeline: Arc<AnswerPipeline>,
    pub llm: Arc<ScriptedLlm>,
    pub executor: Arc<FakeExecutor>,
    pub recorder: Arc<RecordingSink>,
    pub store: Arc<MemoryConversationStore>,
}

pub fn harness(llm: ScriptedLlm, executor: FakeExecutor, users: FakeUsers) -> Harness {
    harness_with(llm, executor, users, |p| p)
}

pub fn harness_with(
    llm: ScriptedLlm,
    executor: FakeExecutor,
    users: FakeUsers,
    customize: impl FnOnce(AnswerPipeline) -> AnswerPipeline,
) -> Harness {
    let registry = Arc::new(SchemaRegistry::crm_default().expect("bundled schema loads"));
    let builder = Arc::new(QueryBuilder::new(registry, BuilderHeuristics::default()));
    let clock = Arc::new(SystemClock);
    let cache = Arc::new(SmartQueryCache::new(CacheSettings::default(), clock.clone()));
    let store = Arc::new(MemoryConversationStore::default());
    let sessions = Arc::new(SessionManager::new(store.clone(), clock, SessionSettings::default()));
    let recorder = Arc::new(RecordingSink::new(100));
    let llm = Arc::new(llm);
    let executor = Arc::new(executor);

    let pipeline = AnswerPipeline::new(
        llm.clone(),
        builder,
        cache,
        executor.clone(),
        Arc::new(users),
        sessions,
        PipelineSettings::default(),
    )
    .with_sink(recorder.clone());

    Harness {
        pipeline: Arc::new(customize(pipeline)),
        llm,
        executor,
        recorder,
        store,
    }
}
