//! Ingest API front-end.
//!
//! Accepts built artifacts from trusted CI pipelines (`POST /upload`),
//! verifies the caller via OIDC, publishes the artifact tree to object
//! storage, and updates the per-repository page index.

pub mod errors;
pub mod metrics_defs;
pub mod oidc;
pub mod upload;

use crate::oidc::{IssuerSet, OidcVerifier};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{post, put};
use pages::storage::MemoryBackend;
use pages::{ConfigError, IndexCache, Page, PageRegistry, PageStore, StaticPagesConfig};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Uploads carry whole site builds; the axum default of 2 MiB is far too
/// small.
const UPLOAD_BODY_LIMIT: usize = 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ApiRunError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build OIDC client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Everything the upload handler needs, shared across requests.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PageRegistry>,
    pub cache: Arc<IndexCache>,
    pub verifier: OidcVerifier,
    pub issuers: IssuerSet,
    pub stores: StoreProvider,
}

/// Where page stores come from: the configured bucket in production, a
/// shared in-memory backend in tests.
#[derive(Clone)]
pub enum StoreProvider {
    S3,
    Memory(Arc<MemoryBackend>),
}

impl StoreProvider {
    pub fn store_for(&self, page: &Page) -> Result<PageStore, ConfigError> {
        match self {
            StoreProvider::S3 => PageStore::for_page(page),
            StoreProvider::Memory(backend) => Ok(PageStore::with_backend(
                backend.clone(),
                page.git.repository.clone(),
            )),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload::upload_handler))
        .route("/activate", put(upload::activate_handler))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .with_state(state)
}

/// Serves the ingest API until `shutdown` fires.
pub async fn run(
    config: &StaticPagesConfig,
    registry: Arc<PageRegistry>,
    cache: Arc<IndexCache>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ApiRunError> {
    let issuers = IssuerSet::from_pages(registry.iter().map(|page| page.as_ref()))?;

    let state = AppState {
        registry,
        cache,
        verifier: OidcVerifier::new()?,
        issuers,
        stores: StoreProvider::S3,
    };

    let (host, port) = config.api_bind_addr();
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
