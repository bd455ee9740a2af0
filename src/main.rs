mod cache;
mod catalog;
mod config;
mod control;
mod engine;
mod error;
mod inspector;
mod lifecycle;
mod playlist;
mod proxy;
mod retry;
mod signing;
mod state;
mod supervisor;
mod web;

use clap::Parser;
use config::AppConfig;
use state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// FM Relay - signed HLS relay for radio streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "fm-relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fm_relay=info,tower_http=warn")),
        )
        .init();

    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    info!(
        "FM Relay initialized. Control-plane: {}, channels: {}",
        config.control_plane.base_url,
        config.channels.len()
    );

    let listen = config.server.listen.clone();
    let monitor_on_boot = config.lifecycle.monitor_on_boot;
    let state = AppState::build(config)?;

    // 启动控制面看门狗
    if monitor_on_boot {
        state.lifecycle.start_monitor();
    }

    let app = web::router(state.clone());

    info!("Listening on {}", listen);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.lifecycle.stop_monitor();
    let stopped = state.engine.stop_all().await;
    info!(stopped, "FM Relay shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
