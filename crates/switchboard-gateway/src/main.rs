//! Switchboard gateway binary.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use switchboard_core::auth::spawn_refresher;
use switchboard_core::config::GatewayConfig;
use switchboard_core::providers::llm::OpenAiClient;

use switchboard_gateway::{build_router, build_state};

#[derive(Debug, Parser)]
#[command(name = "switchboard-gateway", about = "AI-query gateway", version)]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(long, short, default_value = "switchboard.yaml", env = "SWITCHBOARD_CONFIG")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long, env = "SWITCHBOARD_LISTEN_ADDR")]
    listen: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "SWITCHBOARD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,switchboard_core=debug"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match GatewayConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "fatal: failed to load config");
            process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    let llm = match OpenAiClient::from_settings(&config.model) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "fatal: model provider setup failed");
            process::exit(1);
        }
    };

    let refresh_interval = Duration::from_millis(config.revocation.refresh_interval_ms);
    let listen_addr = config.listen_addr.clone();

    let state = match build_state(config, llm) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise");
            process::exit(1);
        }
    };

    let refresher = spawn_refresher(
        Arc::clone(&state.revocations),
        state.store.clone(),
        refresh_interval,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %listen_addr,
        servers = state.router.server_names().len(),
        "starting"
    );

    let app = build_router(Arc::clone(&state));
    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %listen_addr, "failed to bind");
            process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }

    refresher.shutdown();
    info!("shutdown complete");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install shutdown handler");
    }
}
