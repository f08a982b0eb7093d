//! Reverse proxy front-end.
//!
//! Maps each incoming request to a concrete origin URL below
//! `<origin>/<repository>/<commit>/…` and forwards it. The interesting work
//! happens in [`resolver`] (version selection) and [`prober`] (finding a path
//! the origin will actually serve).

pub mod errors;
pub mod metrics_defs;
pub mod paths;
pub mod prober;
pub mod resolver;
pub mod service;
pub mod singleflight;

use crate::errors::ProxyError;
use crate::resolver::Resolver;
use crate::service::ProxyService;
use pages::{IndexCache, PageRegistry, StaticPagesConfig};
use shared::http::run_http_service;
use std::sync::Arc;
use tokio::sync::watch;

/// Serves the proxy until `shutdown` fires.
pub async fn run(
    config: &StaticPagesConfig,
    registry: Arc<PageRegistry>,
    cache: Arc<IndexCache>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let resolver = Arc::new(Resolver::new(registry, cache)?);
    let service = ProxyService::new(resolver, &config.proxy)?;

    let (host, port) = config.proxy_bind_addr();
    run_http_service(&host, port, service, shutdown).await
}
