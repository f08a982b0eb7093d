use crate::errors::ResolveError;
use crate::paths::clean_join;
use crate::prober::PathProber;
use pages::{IndexCache, Page, PageIndex, PageRegistry, PageStore};
use std::sync::Arc;
use url::Url;

/// Where a request gets rewritten to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteTarget {
    /// Full origin URL: scheme and host from the tenant's origin config, the
    /// probed path below it.
    pub url: Url,
    /// Origin host, for the `X-Origin-Host` header.
    pub origin_host: String,
}

/// Resolves incoming requests to origin URLs.
///
/// The pipeline per request: host → tenant → subdomain → page index (cached)
/// → commit selection → candidate path → probe. Every step that comes up
/// empty ends the resolution; the transport turns that into a 502.
pub struct Resolver {
    registry: Arc<PageRegistry>,
    cache: Arc<IndexCache>,
    prober: PathProber,
}

impl Resolver {
    pub fn new(
        registry: Arc<PageRegistry>,
        cache: Arc<IndexCache>,
    ) -> Result<Self, crate::errors::ProxyError> {
        Ok(Resolver {
            registry,
            cache,
            prober: PathProber::new()?,
        })
    }

    pub async fn resolve(
        &self,
        host_header: &str,
        request_path: &str,
    ) -> Result<RewriteTarget, ResolveError> {
        let host = strip_port(host_header);

        let page = self
            .registry
            .lookup(host)
            .ok_or_else(|| ResolveError::NoPage(host.to_string()))?;

        let sub = page.domain.subdomain_of(host)?;
        let index = self.load_index(&page).await?;
        let chosen = select_commit(&page, &index, host, &sub)?;

        let base = clean_join([
            page.origin.path.as_str(),
            page.git.repository.as_str(),
            chosen.as_str(),
        ]);

        let candidate = clean_join([base.as_str(), request_path]);
        let probed = match self
            .prober
            .lookup_path(host, &page.origin.url, &candidate, &page.origin.search_path)
            .await
        {
            Ok(path) => path,
            Err(first_error) => {
                // One retry against the tenant's not-found asset
                let fallback = clean_join([base.as_str(), page.origin.not_found.as_str()]);
                match self
                    .prober
                    .lookup_path(host, &page.origin.url, &fallback, &page.origin.search_path)
                    .await
                {
                    Ok(path) => {
                        tracing::warn!(host, request_path, "no path found, serving not-found asset");
                        path
                    }
                    Err(_) => {
                        return Err(ResolveError::NoPath {
                            candidate,
                            source: first_error,
                        });
                    }
                }
            }
        };

        let mut url = page.origin.url.clone();
        url.set_path(&probed);
        url.set_query(None);
        let origin_host = host_with_port(&url);

        tracing::debug!(
            host,
            request_path,
            backend_path = %probed,
            backend_url = %url,
            "transformed request"
        );

        Ok(RewriteTarget { url, origin_host })
    }

    async fn load_index(&self, page: &Page) -> Result<Arc<PageIndex>, ResolveError> {
        if let Some(index) = self.cache.get(&page.domain) {
            return Ok(index);
        }

        let store = PageStore::for_page(page)?;
        let index = store.read_index().await?;
        Ok(self.cache.put(page.domain.clone(), index))
    }
}

/// Picks the commit to serve: the main branch when preview is off or no
/// subdomain was given, otherwise the subdomain interpreted as a branch
/// first and a commit id second.
fn select_commit(
    page: &Page,
    index: &PageIndex,
    host: &str,
    sub: &str,
) -> Result<String, ResolveError> {
    if !page.preview.enabled || sub.is_empty() {
        let branch = &page.git.main_branch;
        return index
            .latest_for_branch(branch)
            .map(|meta| meta.commit_id.clone())
            .ok_or_else(|| ResolveError::NoCommit {
                host: host.to_string(),
                branch: branch.clone(),
            });
    }

    if let Some(meta) = index.latest_for_branch(sub) {
        return Ok(meta.commit_id.clone());
    }
    if index.get_by_commit(sub).is_some() {
        return Ok(sub.to_string());
    }

    Err(ResolveError::NoCommit {
        host: host.to_string(),
        branch: sub.to_string(),
    })
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pages::config::test_support::test_page;
    use pages::{CommitMeta, DomainScope};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn indexed(commits: &[(&str, &str, u32)]) -> PageIndex {
        let mut index = PageIndex::new();
        for (commit, branch, hour) in commits {
            index.merge(CommitMeta::new(
                "org/repo",
                *commit,
                *branch,
                "",
                Utc.with_ymd_and_hms(2024, 5, 1, *hour, 0, 0).unwrap(),
            ));
        }
        index
    }

    #[test]
    fn test_select_commit_main_branch_mode() {
        let page = test_page("specht.av0.de", "org/repo");
        let index = indexed(&[("sha1", "main", 10)]);

        // preview disabled: subdomain is ignored
        let chosen = select_commit(&page, &index, "dev.specht.av0.de", "dev").unwrap();
        assert_eq!(chosen, "sha1");

        let chosen = select_commit(&page, &index, "specht.av0.de", "").unwrap();
        assert_eq!(chosen, "sha1");
    }

    #[test]
    fn test_select_commit_preview_branch() {
        let mut page = test_page("specht.av0.de", "org/repo");
        page.preview.enabled = true;
        page.preview.branch = true;

        let index = indexed(&[("shaA", "feature-x", 10), ("shaB", "main", 12)]);
        let chosen = select_commit(&page, &index, "feature-x.specht.av0.de", "feature-x").unwrap();
        assert_eq!(chosen, "shaA");
    }

    #[test]
    fn test_select_commit_preview_falls_through_to_commit() {
        let mut page = test_page("specht.av0.de", "org/repo");
        page.preview.enabled = true;
        page.preview.commit = true;

        // "abc123" is not a branch name, so branch lookup misses and the
        // subdomain is retried as a commit id
        let index = indexed(&[("abc123", "main", 10)]);
        let chosen = select_commit(&page, &index, "abc123.specht.av0.de", "abc123").unwrap();
        assert_eq!(chosen, "abc123");
    }

    #[test]
    fn test_select_commit_preview_miss() {
        let mut page = test_page("specht.av0.de", "org/repo");
        page.preview.enabled = true;

        let index = indexed(&[("shaA", "main", 10)]);
        let result = select_commit(&page, &index, "gone.specht.av0.de", "gone");
        assert!(matches!(result, Err(ResolveError::NoCommit { .. })));
    }

    #[test]
    fn test_select_commit_empty_index() {
        let page = test_page("specht.av0.de", "org/repo");
        let result = select_commit(&page, &index_of_nothing(), "specht.av0.de", "");
        assert!(matches!(result, Err(ResolveError::NoCommit { .. })));
    }

    fn index_of_nothing() -> PageIndex {
        PageIndex::new()
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
    }

    #[tokio::test]
    async fn test_resolve_end_to_end() {
        let origin = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file/bucket/org/repo/sha1/about/index.html"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&origin)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&origin)
            .await;

        let mut page = test_page("specht.av0.de", "org/repo");
        page.origin.url = Url::parse(&origin.uri()).unwrap();
        page.origin.path = "/file/bucket".to_string();

        let registry = Arc::new(PageRegistry::from_pages(vec![page]));
        let cache = Arc::new(IndexCache::new());
        // Pre-warm the cache so resolution never talks to object storage
        cache.put(
            DomainScope::new("specht.av0.de"),
            indexed(&[("sha1", "main", 10)]),
        );

        let resolver = Resolver::new(registry, cache).unwrap();
        let target = resolver
            .resolve("dev.specht.av0.de:8080", "/about")
            .await
            .unwrap();

        assert_eq!(target.url.path(), "/file/bucket/org/repo/sha1/about/index.html");
    }

    #[tokio::test]
    async fn test_resolve_not_found_fallback() {
        let origin = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/org/repo/sha1/404.html"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&origin)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&origin)
            .await;

        let mut page = test_page("specht.av0.de", "org/repo");
        page.origin.url = Url::parse(&origin.uri()).unwrap();

        let registry = Arc::new(PageRegistry::from_pages(vec![page]));
        let cache = Arc::new(IndexCache::new());
        cache.put(
            DomainScope::new("specht.av0.de"),
            indexed(&[("sha1", "main", 10)]),
        );

        let resolver = Resolver::new(registry, cache).unwrap();
        let target = resolver.resolve("specht.av0.de", "/missing").await.unwrap();
        assert_eq!(target.url.path(), "/org/repo/sha1/404.html");
    }

    #[tokio::test]
    async fn test_resolve_unknown_host() {
        let registry = Arc::new(PageRegistry::from_pages(vec![]));
        let cache = Arc::new(IndexCache::new());
        let resolver = Resolver::new(registry, cache).unwrap();

        let result = resolver.resolve("unknown.example.com", "/").await;
        assert!(matches!(result, Err(ResolveError::NoPage(_))));
    }
}
