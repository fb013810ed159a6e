//! Credit ledger HTTP gateway binary

use anyhow::Context;
use credit_gateway::{build_app, build_internal_app, AppState};
use credit_ledger::{Config, Ledger, RequestHandlers};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path)),
        Err(_) => Config::from_env().context("reading environment"),
    }
}

async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_tracing(config.json_logs);

    tracing::info!(
        service = %config.service_name,
        data_dir = %config.data_dir.display(),
        "Starting credit ledger gateway"
    );

    let public_addr = config.http_listen_addr.clone();
    let internal_addr = config.internal_listen_addr.clone();
    let ledger = Arc::new(Ledger::open(config).await.context("opening ledger")?);

    let state = AppState {
        handlers: RequestHandlers::new(ledger.clone()),
    };
    let app = build_app(state.clone());
    let internal_app = build_internal_app(state);

    let public_listener = bind(&public_addr).await?;
    let internal_listener = bind(&internal_addr).await?;
    tracing::info!(addr = %public_addr, "Gateway listening");
    tracing::info!(addr = %internal_addr, "Catalog sync listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    tokio::try_join!(
        axum::serve(public_listener, app)
            .with_graceful_shutdown(wait_for(shutdown_rx.clone()))
            .into_future(),
        axum::serve(internal_listener, internal_app)
            .with_graceful_shutdown(wait_for(shutdown_rx))
            .into_future(),
    )?;

    tracing::info!("Shutting down credit ledger gateway");
    ledger.shutdown().await?;
    Ok(())
}
