use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CacheSettings;
use crate::pipeline::PipelineSettings;
use crate::query::BuilderHeuristics;
use crate::session::SessionSettings;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "nl-insight.db".to_string(),
            pool_size: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "remote" (OpenAI-compatible) or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "llama3.1".to_string(),
            api_key: None,
            api_url: None,
            timeout_secs: 60,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SchemaConfig {
    /// Registry JSON; the built-in CRM registry when unset.
    pub path: Option<PathBuf>,
    /// Create missing registry tables on startup.
    pub bootstrap: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UsersConfig {
    pub table: String,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            table: "employees".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
    pub schema: SchemaConfig,
    pub users: UsersConfig,
    pub cache: CacheSettings,
    pub session: SessionSettings,
    pub pipeline: PipelineSettings,
    pub builder: BuilderHeuristics,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// DuckDB database file, or :memory:
    #[arg(long)]
    pub database: Option<String>,

    /// Schema registry JSON file
    #[arg(long, value_name = "FILE")]
    pub schema: Option<PathBuf>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-insight/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NLI__WEB__PORT=8080 overrides web.port
        config_builder = config_builder.add_source(
            Environment::with_prefix("NLI")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }
        if let Some(schema) = &args.schema {
            config.schema.path = Some(schema.clone());
        }

        Ok(config)
    }
}
