use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use nl_insight::cache::SmartQueryCache;
use nl_insight::config::{AppConfig, CliArgs};
use nl_insight::db::{self, DuckDbExecutor, DuckDbUserDirectory};
use nl_insight::llm::LlmManager;
use nl_insight::pipeline::{AnswerPipeline, ChannelSink, FanoutSink, RecordingSink, StageSink};
use nl_insight::query::QueryBuilder;
use nl_insight::schema::SchemaRegistry;
use nl_insight::session::{DuckDbConversationStore, SessionManager};
use nl_insight::util::logging::init_tracing;
use nl_insight::util::{Clock, SystemClock};
use nl_insight::web::{self, state::AppState};

const STAGE_LOG_CAPACITY: usize = 200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    init_tracing(&config.logging);

    let registry = match &config.schema.path {
        Some(path) => {
            info!("Loading schema registry from {}", path.display());
            SchemaRegistry::load(path)?
        }
        None => SchemaRegistry::crm_default()?,
    };
    let registry = Arc::new(registry);
    info!("Schema registry has {} tables", registry.table_names().len());

    let pool = db::build_pool(&config.database.connection_string, config.database.pool_size)?;
    if config.schema.bootstrap {
        db::bootstrap_schema(&pool, &registry).await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let cache = Arc::new(SmartQueryCache::new(config.cache.clone(), clock.clone()));
    cache.start_sweeper();

    let store = DuckDbConversationStore::open(pool.clone()).await?;
    let sessions = Arc::new(SessionManager::new(Arc::new(store), clock, config.session.clone()));
    sessions.start_sweeper();

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm = Arc::new(LlmManager::new(&config.llm)?);

    let builder = Arc::new(QueryBuilder::new(registry, config.builder.clone()));
    let executor = Arc::new(DuckDbExecutor::new(pool.clone()));
    let users = Arc::new(DuckDbUserDirectory::new(pool, &config.users.table));

    let stage_log = Arc::new(RecordingSink::new(STAGE_LOG_CAPACITY));
    let (channel_sink, _stage_consumer) = ChannelSink::spawn();
    let sinks: Vec<Arc<dyn StageSink>> = vec![Arc::new(channel_sink), stage_log.clone()];

    let pipeline = AnswerPipeline::new(
        llm,
        builder,
        cache,
        executor,
        users,
        sessions,
        config.pipeline.clone(),
    )
    .with_sink(Arc::new(FanoutSink::new(sinks)));

    let app_state = Arc::new(AppState::new(config.clone(), Arc::new(pipeline), stage_log));

    // Start the web server
    info!("Starting NL-Insight server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
