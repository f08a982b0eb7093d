use crate::errors::{ProxyError, ResolveError};
use crate::metrics_defs::{REQUESTS_REJECTED, UPSTREAM_RESPONSES};
use crate::resolver::Resolver;
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, HOST, USER_AGENT};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use pages::config::ProxyTransportConfig;
use shared::http::{filter_hop_by_hop, make_boxed_error_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Non-standard status for a client that went away mid-request.
const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

const DEFAULT_USER_AGENT: &str = "pagesrv-proxy";

/// The proxy front-end: gates methods, asks the resolver where a request
/// belongs, and forwards it over a shared origin transport.
///
/// The origin response body is collected before it is passed on, the same
/// way the ingest side treats its upstreams. Static assets are small; the
/// simplicity is worth it.
pub struct ProxyService {
    resolver: Arc<Resolver>,
    client: reqwest::Client,
    strip_accept_encoding: bool,
}

impl ProxyService {
    pub fn new(
        resolver: Arc<Resolver>,
        transport: &ProxyTransportConfig,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(transport.timeout)
            .pool_max_idle_per_host(transport.max_idle_conns_per_host)
            .build()?;

        Ok(ProxyService {
            resolver,
            client,
            // Without transparent compression the closest observable analog
            // is to not advertise encodings upstream at all.
            strip_accept_encoding: !transport.compression,
        })
    }
}

impl HyperService<Request<Incoming>> for ProxyService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        if request.method() != Method::GET {
            tracing::warn!(
                method = %request.method(),
                path = %request.uri().path(),
                "received invalid request"
            );
            metrics::counter!(REQUESTS_REJECTED.name, "reason" => "method").increment(1);
            return Box::pin(async {
                Ok(make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED))
            });
        }

        let resolver = self.resolver.clone();
        let client = self.client.clone();
        let strip_accept_encoding = self.strip_accept_encoding;

        Box::pin(async move {
            let host = request
                .headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .or_else(|| request.uri().host().map(str::to_string))
                .unwrap_or_default();
            let request_path = request.uri().path().to_string();

            let target = match resolver.resolve(&host, &request_path).await {
                Ok(target) => target,
                Err(error) => {
                    log_resolve_failure(&host, &request_path, &error);
                    metrics::counter!(REQUESTS_REJECTED.name, "reason" => "unresolved")
                        .increment(1);
                    return Ok(make_boxed_error_response(StatusCode::BAD_GATEWAY));
                }
            };

            let (mut parts, _body) = request.into_parts();
            filter_hop_by_hop(&mut parts.headers, parts.version);

            if strip_accept_encoding {
                parts.headers.remove(ACCEPT_ENCODING);
            }
            if !parts.headers.contains_key(USER_AGENT) {
                parts
                    .headers
                    .insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
            }
            // The Host header of the outgoing request comes from the origin
            // URL, not from the tenant host
            parts.headers.remove(HOST);
            if let Ok(value) = HeaderValue::from_str(&host) {
                parts.headers.insert("x-forwarded-host", value);
            }
            if let Ok(value) = HeaderValue::from_str(&target.origin_host) {
                parts.headers.insert("x-origin-host", value);
            }

            let upstream = client
                .get(target.url.clone())
                .headers(parts.headers)
                .send()
                .await;

            match upstream {
                Ok(response) => {
                    inspect_response(&target.url, response.status());

                    let status = response.status();
                    let mut headers = response.headers().clone();
                    let version = response.version();

                    match response.bytes().await {
                        Ok(body) => {
                            filter_hop_by_hop(&mut headers, version);
                            // Content-Length is re-derived from the collected
                            // body; a stale one from a HEAD-agreeing origin
                            // would poison the client connection
                            headers.remove(http::header::CONTENT_LENGTH);

                            let mut out =
                                Response::new(Full::new(body).map_err(|e| match e {}).boxed());
                            *out.status_mut() = status;
                            *out.headers_mut() = headers;
                            Ok(out)
                        }
                        Err(error) => {
                            tracing::error!(host, url = %target.url, error = %error, "failed to read origin response");
                            Ok(make_boxed_error_response(StatusCode::BAD_GATEWAY))
                        }
                    }
                }
                Err(error) => {
                    let status = translate_transport_error(&error);
                    tracing::error!(
                        host,
                        url = %target.url,
                        error = %error,
                        http.code = status.as_u16(),
                        "proxy error"
                    );
                    Ok(make_boxed_error_response(status))
                }
            }
        })
    }
}

fn log_resolve_failure(host: &str, path: &str, error: &ResolveError) {
    match error {
        ResolveError::NoPage(_) => tracing::error!(host, "no page found"),
        ResolveError::NoCommit { branch, .. } => {
            tracing::error!(host, branch = %branch, "could not find a commit to serve page for");
        }
        ResolveError::NoPath { candidate, source } => {
            tracing::error!(host, candidate = %candidate, error = %source, "no path found");
        }
        other => tracing::error!(host, path, error = %other, "unable to resolve request"),
    }
}

/// Logs any non-2xx origin response; redirects and errors are the
/// interesting ones.
fn inspect_response(url: &url::Url, status: StatusCode) {
    let class = match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    metrics::counter!(UPSTREAM_RESPONSES.name, "class" => class).increment(1);

    if status.as_u16() >= 300 {
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(http.code = status.as_u16(), request_url = %url, "received response");
        } else {
            tracing::info!(http.code = status.as_u16(), request_url = %url, "received response");
        }
    }
}

/// A canceled upstream call means our client went away: 499. Everything
/// else is a plain bad gateway.
fn translate_transport_error(error: &(dyn std::error::Error + 'static)) -> StatusCode {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = source {
        if let Some(hyper_error) = current.downcast_ref::<hyper::Error>()
            && hyper_error.is_canceled()
        {
            return StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::BAD_GATEWAY);
        }
        source = current.source();
    }
    StatusCode::BAD_GATEWAY
}
