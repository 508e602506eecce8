use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;

use refine_core::events::ProgressEvent;
use refine_core::security::{env_vars, ApiKey};
use refine_core::session::Stage;
use refine_engine::prompts::StagePrompts;
use refine_engine::providers::ProviderSet;
use refine_engine::{DeliveryMode, EngineConfig};
use refine_llm::{OpenAiProvider, ProviderConfig};
use refine_server::{EngineOrchestrator, ServerConfig, SessionOrchestrator};
use refine_store::sessions::SessionRepo;
use refine_store::Database;
use refine_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "refine", about = "Multi-stage document rewriting server")]
struct Cli {
    /// Port for the WebSocket/HTTP server
    #[arg(long, default_value_t = 9091)]
    port: u16,

    /// Path to the session database (defaults to ~/.refine/database/refine.db)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Sessions allowed to process concurrently
    #[arg(long, default_value_t = 5)]
    max_concurrent: usize,

    /// Segments below this length (CJK-aware) are skipped as headings
    #[arg(long, default_value_t = 15)]
    skip_threshold: usize,

    /// History length that triggers compression
    #[arg(long, default_value_t = 5000)]
    compression_threshold: usize,

    /// How stage output reaches clients: "streaming" or "buffered"
    #[arg(long, default_value = "buffered")]
    delivery: DeliveryMode,

    /// Base URL of the OpenAI-compatible endpoint
    #[arg(long)]
    base_url: Option<String>,

    /// Default model for all stages
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Model override for the polish stage
    #[arg(long)]
    polish_model: Option<String>,

    /// Model override for the enhance stage
    #[arg(long)]
    enhance_model: Option<String>,

    /// Model override for the emotion rewrite stage
    #[arg(long)]
    emotion_model: Option<String>,

    /// Model override for history compression
    #[arg(long)]
    compress_model: Option<String>,

    /// Disable persisting warn+ logs to SQLite
    #[arg(long)]
    no_log_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let refine_dir = home_dir().join(".refine");

    let _telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: !cli.no_log_db,
        log_db_path: refine_dir.join("database/logs.db"),
        ..TelemetryConfig::default()
    });

    tracing::info!("Starting refine server");

    let db_path = match cli.db {
        Some(path) => path,
        None => {
            let db_dir = refine_dir.join("database");
            std::fs::create_dir_all(&db_dir)
                .with_context(|| format!("creating {}", db_dir.display()))?;
            db_dir.join("refine.db")
        }
    };

    let db = Database::open(&db_path)
        .with_context(|| format!("opening database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    // Sessions left processing or queued by a previous run can never resume;
    // mark them failed so clients see a retryable state.
    let recovered = SessionRepo::new(db.clone()).recover_interrupted("interrupted by restart")?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "Recovered interrupted sessions");
    }

    let api_key = ApiKey::from_env(env_vars::REFINE_API_KEY)
        .or_else(|| ApiKey::from_env(env_vars::OPENAI_API_KEY));
    if api_key.is_none() {
        tracing::warn!(
            "No API key found in {} or {}; upstream calls will be unauthenticated",
            env_vars::REFINE_API_KEY,
            env_vars::OPENAI_API_KEY
        );
    }

    let make_provider = |model: &str| -> anyhow::Result<Arc<OpenAiProvider>> {
        let mut config = ProviderConfig::new(model);
        if let Some(ref url) = cli.base_url {
            config = config.with_base_url(url.clone());
        }
        if let Some(ref key) = api_key {
            config = config.with_api_key(key.clone());
        }
        Ok(Arc::new(OpenAiProvider::new(config)?))
    };

    let mut providers = ProviderSet::uniform(make_provider(&cli.model)?);
    if let Some(ref model) = cli.polish_model {
        providers = providers.with_stage(Stage::Polish, make_provider(model)?);
    }
    if let Some(ref model) = cli.enhance_model {
        providers = providers.with_stage(Stage::Enhance, make_provider(model)?);
    }
    if let Some(ref model) = cli.emotion_model {
        providers = providers.with_stage(Stage::EmotionRewrite, make_provider(model)?);
    }
    if let Some(ref model) = cli.compress_model {
        providers = providers.with_compression(make_provider(model)?);
    }

    let engine_config = EngineConfig {
        skip_threshold: cli.skip_threshold,
        compression_threshold: cli.compression_threshold,
        max_concurrent: cli.max_concurrent,
        delivery: cli.delivery,
        ..EngineConfig::default()
    };

    let (event_tx, _) = broadcast::channel::<ProgressEvent>(1024);

    let orchestrator: Arc<dyn SessionOrchestrator> = Arc::new(EngineOrchestrator::new(
        db.clone(),
        providers,
        StagePrompts::default(),
        &engine_config,
        event_tx.clone(),
    ));

    let server_config = ServerConfig {
        port: cli.port,
        ..ServerConfig::default()
    };
    let handle = refine_server::start(server_config, db, Arc::clone(&orchestrator), event_tx)
        .await
        .context("starting server")?;

    tracing::info!(port = handle.port, "Refine server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    let stopped = orchestrator.stop_all();
    if stopped > 0 {
        tracing::info!(stopped = stopped, "Stopped active sessions");
    }
    tracing::info!("Shutting down");

    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
