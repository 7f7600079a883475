pub mod api;
pub mod config;

use anyhow::Result;
use axum::Router;
use records_hub_core::auth::{Hs256Verifier, TokenVerifier};
use records_hub_core::blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
use records_hub_core::MutationEngine;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use config::Config;

/// Open the stores named by `config` and build the application state.
pub fn build_state(config: &Config) -> Result<api::AppState> {
    let engine = MutationEngine::open(&config.store_config())?;
    let blobs: Arc<dyn BlobStore> = match config.blob_dir() {
        Some(dir) => Arc::new(FsBlobStore::new(dir)?),
        None => Arc::new(InMemoryBlobStore::new()),
    };
    let verifier: Arc<dyn TokenVerifier> = Arc::new(Hs256Verifier::new(config.jwt_secret.clone()));
    Ok(api::AppState {
        engine: Arc::new(engine),
        blobs,
        verifier,
    })
}

/// The full HTTP application with request tracing and CORS.
pub fn app(state: api::AppState) -> Router {
    api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}
