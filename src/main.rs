use clap::Parser;
use copilot_override::config::config_search_paths;
use copilot_override::{build_router, AppState, ServiceConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "copilot-override",
    about = "Rewrite code-assistant completion requests for any OpenAI-compatible provider",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8181 (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Event journal path (JSON lines)
    #[arg(long, default_value = "copilot-override.log")]
    log_file: PathBuf,

    /// Log inbound, outbound and response bodies at debug level
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "copilot_override=debug,tower_http=debug"
    } else {
        "copilot_override=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ServiceConfig::find_and_load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let logger = SharedLogger::new(&cli.log_file)?;

    let mut state = AppState::from_config(&config, logger.clone())?;
    state.log_payloads = cli.debug;
    let state = Arc::new(state);

    info!("copilot-override v{}", env!("CARGO_PKG_VERSION"));
    for line in config.summary().lines() {
        info!("{line}");
    }
    info!("  Code family: {:?}", state.code.family);
    info!("  Log file:    {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting copilot-override bind={} code_model={} chat_default={}",
            config.bind, config.code.model, config.chat.model_default
        ),
    );

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    logger.info("shutdown", "Server stopped");
    info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl-C. The limiter is closed first so queued requests fail fast.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    state.upstream.close();
    info!("Shutdown signal received, draining connections");
}
