use axum::{routing::get, Router};
use clap::Parser;
use sql_insight::llm::build_generator;
use sql_insight::{QueryEngine, QueryEngineLayer};
use tracing::{error, info};

mod config;
mod demo;
mod logging;

use crate::config::{AppConfig, CliArgs};
use crate::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = CliArgs::parse();

    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Some(demo) = &config.demo {
        let connection = demo::prepare(&demo.database_path).await?;
        info!(%connection, "demo database ready");
    }

    info!(backend = %config.llm.backend, model = %config.llm.model, "initializing SQL generator");
    let generator = build_generator(&config.llm)?;
    let engine = QueryEngine::new(config.engine.clone(), generator);

    let app = Router::new()
        .route("/", get(root_handler))
        .merge(QueryEngineLayer::new(config.web.base_path.as_str(), engine).into_router());

    let address = format!("{}:{}", config.web.host, config.web.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!("Server running at http://{}", address);
    info!("Health check at http://{}{}/health", address, config.web.base_path);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn root_handler() -> &'static str {
    "sql-insight server: POST /execute and /predictive-analysis under the configured base path"
}
