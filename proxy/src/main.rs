use anyhow::{Context, Result};
use clap::Parser;
use proxycop_core::{AdmissionController, FailurePolicy};
use proxycop_proxy::api::create_router;
use proxycop_proxy::config::ProxyConfig;
use proxycop_proxy::server::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Forward proxy that keeps you off distraction sites")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "PROXYCOP_CONFIG")]
    config: Option<String>,

    /// Address the proxy listens on
    #[clap(short, long)]
    listen: Option<SocketAddr>,

    /// Address the status API listens on
    #[clap(long)]
    api_listen: Option<SocketAddr>,

    /// Policy store file
    #[clap(long)]
    db_path: Option<PathBuf>,

    /// What to do when the policy store fails: closed or open
    #[clap(long)]
    failure_policy: Option<FailurePolicy>,

    /// Do not apply the configured seed policies at startup
    #[clap(long)]
    no_seed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration, then let flags override it
    let mut config = ProxyConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(api_listen) = args.api_listen {
        config.api_addr = api_listen;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(failure_policy) = args.failure_policy {
        config.admission.failure_policy = failure_policy;
    }

    // Initialize logging; `log` records from the library crates are bridged
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting proxycop {}", env!("CARGO_PKG_VERSION"));

    let controller = AdmissionController::open(&config.db_path, config.admission.clone())
        .with_context(|| format!("Failed to open policy store {}", config.db_path.display()))?;
    if !args.no_seed {
        controller.seed(&config.seed)?;
    }
    let controller = Arc::new(controller);
    tracing::info!(
        "Policy store {} ready, failure policy {:?}",
        config.db_path.display(),
        controller.failure_policy()
    );

    let shutdown = CancellationToken::new();

    // Proxy
    let server = Arc::new(ProxyServer::new(config.clone(), controller.clone())?);
    let listener = server.bind().await?;
    let mut proxy_task = tokio::spawn(server.run(listener, shutdown.clone()));

    // Status API
    let api_listener = tokio::net::TcpListener::bind(config.api_addr)
        .await
        .with_context(|| format!("Failed to bind status API to {}", config.api_addr))?;
    tracing::info!("Status API listening on {}", config.api_addr);
    let api_shutdown = shutdown.clone();
    let app = create_router(controller.clone());
    let api_task = tokio::spawn(async move {
        axum::serve(api_listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
    });

    // Wait for Ctrl+C, or for the proxy to die on its own
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutting down");
            None
        }
        result = &mut proxy_task => Some(result),
    };
    shutdown.cancel();
    let proxy_result = match finished {
        Some(result) => result,
        None => proxy_task.await,
    };
    proxy_result??;
    api_task.await??;

    match Arc::try_unwrap(controller) {
        Ok(controller) => controller.close()?,
        Err(_) => tracing::warn!("Policy store still in use at exit"),
    }
    tracing::info!("Server stopped");

    Ok(())
}
