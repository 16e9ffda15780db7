use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use sql_insight::config::EngineConfig;
use sql_insight::llm::LlmConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// URL prefix of the engine endpoints
    pub base_path: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            base_path: "/api".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DemoConfig {
    /// SQLite file to create and seed on startup
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub engine: EngineConfig,
    pub demo: Option<DemoConfig>,
}

#[derive(Parser, Debug)]
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

    /// SQL generator backend: pattern, ollama or remote
    #[arg(long)]
    pub llm_backend: Option<String>,

    /// Create and seed a demo SQLite database at this path
    #[arg(long, value_name = "FILE")]
    pub demo_database: Option<PathBuf>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/sql-insight/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // SQL_INSIGHT__LLM__API_KEY and friends
        config_builder = config_builder.add_source(Environment::with_prefix("SQL_INSIGHT").separator("__"));

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(backend) = &args.llm_backend {
            config.llm.backend = backend.clone();
        }
        if let Some(database_path) = &args.demo_database {
            config.demo = Some(DemoConfig {
                database_path: database_path.clone(),
            });
        }

        Ok(config)
    }
}
