//! Records hub server

use anyhow::Result;
use clap::Parser;
use records_hub::{app, build_state, Config};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    let state = build_state(&config)?;
    info!(
        items = state.engine.items().len(),
        history = state.engine.history_log().len(),
        data_dir = ?config.data_dir,
        "stores opened"
    );

    let listener = TcpListener::bind(config.addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
