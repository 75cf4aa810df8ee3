use anyhow::Context;
use clap::Parser;
use realtime_edge::{
    audio::{CpalDevices, DEFAULT_FRAME_MS},
    config::{load_config, AppConfig, DEFAULT_LOG_LEVEL},
    realtime::{SessionConfig, WebSocketConnector},
    session::{Orchestrator, SessionSettings},
    tools::{create_default_registry, hotel::McpClient},
    wake::{TcpWakeDetector, WakeError, WakeLoop},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "realtime-edge")]
#[command(about = "Wakeword-triggered realtime voice assistant")]
struct Args {
    /// Wakeword event server address (overrides WAKEWORD_SERVER)
    #[arg(long)]
    wakeword_server: Option<String>,

    /// MCP server base URL (overrides MCP_SERVER_URL)
    #[arg(long)]
    mcp_url: Option<String>,

    /// Agent voice (overrides OPENAI_VOICE)
    #[arg(long)]
    voice: Option<String>,

    /// Pause after each session before listening again
    #[arg(long, default_value = "1000")]
    cooldown_ms: u64,

    /// Maximum session length in seconds, 0 for no limit
    #[arg(long, default_value = "300")]
    max_session_secs: u64,

    /// Log level when RUST_LOG is not set (overrides LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Start even if the MCP server does not answer its health check
    #[arg(long)]
    no_mcp_check: bool,
}

fn init_logging(args: &Args) {
    dotenvy::dotenv().ok();
    let level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
        .to_lowercase();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Environment configuration with command-line overrides applied
fn load_merged_config(args: &Args) -> realtime_edge::Result<AppConfig> {
    let mut config = load_config()?;
    if let Some(server) = &args.wakeword_server {
        config.wakeword_server = server.clone();
    }
    if let Some(url) = &args.mcp_url {
        config.mcp_server_url = url.trim_end_matches('/').to_string();
    }
    if let Some(voice) = &args.voice {
        config.voice = voice.clone();
    }
    Ok(config)
}

async fn connect_detector(config: &AppConfig) -> realtime_edge::Result<TcpWakeDetector> {
    let address = config.wakeword_server.clone();
    let wake_word = config.wake_word.clone();
    let detector =
        tokio::task::spawn_blocking(move || TcpWakeDetector::connect(&address, &wake_word))
            .await
            .map_err(|e| WakeError::Task(e.to_string()))??;
    Ok(detector)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);
    log::info!("🚀 Initializing realtime-edge");

    let config = match load_merged_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let mcp = Arc::new(McpClient::new(&config.mcp_server_url).context("building MCP client")?);
    if mcp.health_check().await {
        log::info!("🏨 MCP server healthy at {}", mcp.base_url());
    } else if args.no_mcp_check {
        log::warn!("⚠️ MCP server at {} is not healthy, continuing anyway", mcp.base_url());
    } else {
        log::error!("❌ MCP server at {} failed its health check", mcp.base_url());
        std::process::exit(1);
    }

    let registry = Arc::new(create_default_registry(mcp));
    log::info!("🔧 {} tools registered", registry.len());

    let settings = SessionSettings {
        max_duration: (args.max_session_secs > 0).then(|| Duration::from_secs(args.max_session_secs)),
        ..Default::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(WebSocketConnector::new(&config.realtime_url, config.openai_key())),
        Arc::new(CpalDevices::new(DEFAULT_FRAME_MS)),
        registry,
        SessionConfig::default().with_voice(&config.voice),
        settings,
    ));

    let detector = match connect_detector(&config).await {
        Ok(detector) => detector,
        Err(e) => {
            log::error!(
                "❌ Could not connect to wakeword server at {}: {}",
                config.wakeword_server,
                e
            );
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("🛑 Shutdown requested");
        trigger.cancel();
    });

    println!("🎧 Listening for '{}'", config.wake_word);
    println!("   Press Ctrl+C to exit");

    let summary = WakeLoop::new(Box::new(detector), orchestrator, shutdown)
        .with_cooldown(Duration::from_millis(args.cooldown_ms))
        .run()
        .await?;

    log::info!(
        "👋 Exiting after {} session(s), {} detector error(s)",
        summary.sessions_run,
        summary.detector_errors
    );
    Ok(())
}
