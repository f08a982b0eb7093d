use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::body::Body;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// How long in-flight connections get to finish once shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Accepts connections on `host:port` and serves them with `service` until
/// `shutdown` fires, then drains open connections within the grace period.
///
/// Each connection runs h1/h2 auto-detection on its own task; the service is
/// shared across all of them.
pub async fn run_http_service<S, B, E>(
    host: &str,
    port: u16,
    service: S,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);
    let graceful = GracefulShutdown::new();

    tracing::info!(host, port, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer_addr) = accepted?;
                let _ = stream.set_nodelay(true);
                let io = TokioIo::new(stream);
                let svc = service_arc.clone();

                // Hand the connection to hyper; auto-detect h1/h2 on this socket
                let conn = Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, svc)
                    .into_owned();
                let watched = graceful.watch(conn);
                tokio::spawn(async move {
                    let _ = watched.await;
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::info!(host, port, "listener stopping, draining connections");
    tokio::select! {
        () = graceful.shutdown() => {}
        () = tokio::time::sleep(SHUTDOWN_GRACE) => {
            tracing::warn!(host, port, "grace period expired with connections still open");
        }
    }

    Ok(())
}

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

// For HTTP/1.x connections, hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers
// - any extra headers listed in the Connection header value
// - keep-alive header for HTTP/0.9 and HTTP/1.0 only
//
// HTTP/2 and HTTP/3 don't use hop-by-hop headers, so no filtering is performed.
/// Should be applied to proxied requests in both directions
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    // Parse the Connection header to find additional headers to drop
    let mut extra_drops = Vec::new();
    if let Some(connection) = headers.get(CONNECTION)
        && let Ok(s) = connection.to_str()
    {
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                extra_drops.push(name);
            }
        }
    }

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }

    // Remove headers listed in the Connection header
    for name in extra_drops {
        headers.remove(&name);
    }

    // For HTTP/0.9 and HTTP/1.0, also remove keep-alive
    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }

    headers
}

/// Creates an error response with the status message as body.
pub fn make_error_response(status_code: StatusCode) -> Response<Bytes> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Bytes::from(message));
    *response.status_mut() = status_code;
    response
}

/// Boxed version for services that need BoxBody (e.g., streaming proxies)
pub fn make_boxed_error_response<E>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>>
where
    E: 'static,
{
    make_error_response(status_code)
        .map(Full::new)
        .map(|body| body.map_err(|e| match e {}).boxed())
}
