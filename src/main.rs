//! Source Runtime command-line entry point
//!
//! Wires the preference database, rate limiter, challenge-aware fetcher and
//! engine provider together and runs one command against them.

use source_runtime::core::challenge::{ChallengeAwareFetcher, FetchRequest, ReqwestTransport};
use source_runtime::core::config::{CliArgs, Command, Config};
use source_runtime::core::error::ErrorReport;
use source_runtime::core::preferences::SqlitePreferenceStore;
use source_runtime::core::{Logger, RateLimiter, SourceFetch, SourceRuntime};
use source_runtime::db::DatabaseManager;
use source_runtime::plugin::{BundledEngineFactory, EngineFactory, EnginePool, EngineProvider, InMemoryEngineRegistry};

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration (CLI args, env vars, and config file)
    let config = match Config::load_from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Source Runtime v{}", source_runtime::VERSION);
    info!(
        max_pool_size = config.pool.max_pool_size,
        max_concurrent_executions = config.pool.max_concurrent_executions,
        max_cache_size_bytes = config.pool.max_cache_size_bytes,
        "Pool configuration"
    );

    if !config.storage.data_dir.exists() {
        info!("Creating directory: {:?}", config.storage.data_dir);
        std::fs::create_dir_all(&config.storage.data_dir)
            .with_context(|| format!("Failed to create directory {:?}", config.storage.data_dir))?;
    }

    let db = Arc::new(DatabaseManager::new(
        &config.storage.preferences_db,
        4,
        Duration::from_millis(config.storage.busy_timeout_ms),
    )?);
    info!(path = ?db.db_path(), "Preference database ready");

    let store = Arc::new(SqlitePreferenceStore::new(db));
    let limiter = Arc::new(RateLimiter::new(store, config.rate_limit.clone()));

    let transport = Arc::new(ReqwestTransport::new(config.retry.request_timeout())?);
    let fetcher = Arc::new(ChallengeAwareFetcher::new(transport, &config.retry));

    let bundled: Arc<dyn EngineFactory> = Arc::new(BundledEngineFactory::new());
    let pool = Arc::new(EnginePool::new(config.pool.clone(), bundled.clone()));
    let registry = Arc::new(InMemoryEngineRegistry::new());
    let provider = Arc::new(EngineProvider::new(pool, registry, bundled).await);

    let runtime = SourceRuntime::new(provider, limiter, fetcher, config.pool.evaluation_timeout());

    let outcome = run(&runtime, args.command.unwrap_or(Command::Status)).await;
    runtime.shutdown().await;

    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }
    outcome
}

async fn run(runtime: &SourceRuntime, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            let snapshot = runtime.provider().snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Bucket { source } => {
            let bucket = runtime.limiter().bucket(&source).await?;
            println!("{}", bucket);
        }
        Command::Eval { file, key } => {
            let script = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read script {:?}", file))?;

            match runtime.evaluate(&key, &script).await {
                Ok(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    if let Some(metrics) = runtime.provider().pool().get_metrics(&key) {
                        println!("{}", serde_json::to_string_pretty(&metrics)?);
                    }
                }
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&ErrorReport::from_error(&e))?);
                    return Err(e.into());
                }
            }
        }
        Command::Fetch { url, source } => {
            let request = FetchRequest::get(url);
            match runtime.fetch(source.as_deref(), &request).await {
                Ok(SourceFetch::Completed(response)) => {
                    info!(status = response.status, bytes = response.body.len(), "Fetch completed");
                    println!("{}", serde_json::to_string_pretty(&SourceFetch::Completed(response))?);
                }
                Ok(throttled) => {
                    println!("{}", serde_json::to_string_pretty(&throttled)?);
                }
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&ErrorReport::from_error(&e))?);
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
