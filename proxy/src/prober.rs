use crate::errors::ProxyError;
use crate::metrics_defs::PATH_LOOKUP_DURATION;
use crate::paths::clean_join;
use crate::singleflight::SingleFlight;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use url::Url;

/// Per-probe client timeout. Probes exist to fail fast; the slow path is the
/// actual proxied request afterwards.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wall-clock budget for one `lookup_path` race across all suffixes.
const LOOKUP_DEADLINE: Duration = Duration::from_secs(5);

/// Outcome of a single HEAD probe: the observed status, or the transport
/// error (which callers treat as a 404).
type ProbeOutcome = Result<u16, String>;

/// Probes candidate origin paths with HEAD requests.
///
/// Concurrent lookups for the same `(host, candidate, suffix)` triple share
/// one upstream probe through the single-flight group.
#[derive(Clone)]
pub struct PathProber {
    inner: Arc<ProberInner>,
}

struct ProberInner {
    client: reqwest::Client,
    flights: SingleFlight<String, ProbeOutcome>,
}

impl PathProber {
    pub fn new() -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;

        Ok(PathProber {
            inner: Arc::new(ProberInner {
                client,
                flights: SingleFlight::new(),
            }),
        })
    }

    /// Finds the first path under `candidate` the origin will serve.
    ///
    /// Races one probe per entry of `["" , suffixes…]` against
    /// `<origin>/<candidate>/<suffix>`; the first response with a status
    /// below 400 wins and the remaining probes are cancelled. Fails with
    /// [`ProxyError::LookupDeadline`] after five seconds, or
    /// [`ProxyError::NoValidPath`] once every probe has come back negative.
    pub async fn lookup_path(
        &self,
        host: &str,
        origin: &Url,
        candidate: &str,
        suffixes: &[String],
    ) -> Result<String, ProxyError> {
        let start = Instant::now();
        let mut probes = JoinSet::new();

        let search: Vec<String> = std::iter::once(String::new())
            .chain(suffixes.iter().cloned())
            .collect();

        for suffix in search {
            let prober = self.inner.clone();
            let flight_key = format!("{host}-{candidate}-{suffix}");
            let test_path = clean_join([candidate, suffix.as_str()]);
            let url = probe_url(origin, &test_path);

            probes.spawn(async move {
                let outcome = prober
                    .flights
                    .run(flight_key, || probe(prober.client.clone(), url))
                    .await;
                (test_path, outcome)
            });
        }

        let deadline = tokio::time::sleep(LOOKUP_DEADLINE);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                _ = &mut deadline => break Err(ProxyError::LookupDeadline),
                joined = probes.join_next() => match joined {
                    None => break Err(ProxyError::NoValidPath),
                    Some(Ok((path, Ok(status)))) if status < 400 => break Ok(path),
                    // Negative probe or transport failure; keep waiting on the rest
                    Some(Ok(_)) => {}
                    Some(Err(join_error)) if join_error.is_cancelled() => {}
                    Some(Err(join_error)) => {
                        tracing::error!(error = %join_error, "probe task panicked");
                    }
                },
            }
        };

        probes.abort_all();

        let outcome_tag = match &result {
            Ok(_) => "hit",
            Err(ProxyError::LookupDeadline) => "deadline",
            Err(_) => "miss",
        };
        metrics::histogram!(PATH_LOOKUP_DURATION.name, "outcome" => outcome_tag)
            .record(start.elapsed().as_secs_f64());

        result
    }
}

async fn probe(client: reqwest::Client, url: String) -> ProbeOutcome {
    match client.head(&url).send().await {
        Ok(response) => Ok(response.status().as_u16()),
        Err(error) => {
            // Losing probes die of timeouts and cancellation; that is
            // expected and not worth an error log.
            if !error.is_timeout() {
                tracing::error!(url, error = %error, "failed to probe path");
            }
            Err(error.to_string())
        }
    }
}

fn probe_url(origin: &Url, path: &str) -> String {
    format!("{}{}", origin.as_str().trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn suffixes() -> Vec<String> {
        vec!["/index.html".to_string(), "/index.htm".to_string()]
    }

    #[tokio::test]
    async fn test_direct_hit_wins() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/repo/sha/about"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let prober = PathProber::new().unwrap();
        let origin = Url::parse(&server.uri()).unwrap();
        let found = prober
            .lookup_path("a.example.com", &origin, "/repo/sha/about", &suffixes())
            .await
            .unwrap();
        assert_eq!(found, "/repo/sha/about");
    }

    #[tokio::test]
    async fn test_index_suffix_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/repo/sha/about/index.html"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let prober = PathProber::new().unwrap();
        let origin = Url::parse(&server.uri()).unwrap();
        let found = prober
            .lookup_path("a.example.com", &origin, "/repo/sha/about", &suffixes())
            .await
            .unwrap();
        assert_eq!(found, "/repo/sha/about/index.html");
    }

    #[tokio::test]
    async fn test_all_probes_negative() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let prober = PathProber::new().unwrap();
        let origin = Url::parse(&server.uri()).unwrap();
        let result = prober
            .lookup_path("a.example.com", &origin, "/repo/sha/missing", &suffixes())
            .await;
        assert!(matches!(result, Err(ProxyError::NoValidPath)));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_not_a_hit() {
        // Nothing is listening on this port
        let prober = PathProber::new().unwrap();
        let origin = Url::parse("http://127.0.0.1:9").unwrap();
        let result = prober
            .lookup_path("a.example.com", &origin, "/repo/sha", &[])
            .await;
        assert!(matches!(result, Err(ProxyError::NoValidPath)));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_probes() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/repo/sha/about"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(100)))
            .mount(&server)
            .await;

        let prober = PathProber::new().unwrap();
        let origin = Url::parse(&server.uri()).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let prober = prober.clone();
            let origin = origin.clone();
            tasks.push(tokio::spawn(async move {
                prober
                    .lookup_path(
                        "a.example.com",
                        &origin,
                        "/repo/sha/about",
                        &["/index.html".to_string()],
                    )
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "/repo/sha/about");
        }
        // the .expect(1) on the winning mock verifies exactly one upstream
        // HEAD for the shared (host, candidate, suffix) triple
        server.verify().await;
    }
}
