use crate::config::Page;
use crate::domain::DomainScope;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps request hosts to tenant configurations by longest-suffix match.
///
/// With scopes `specht.av0.de` and `cedi.av0.de` configured, a lookup for
/// `dev.specht.av0.de` returns the `specht.av0.de` tenant.
///
/// The registry is immutable after construction; a config reload builds a new
/// one and the old instance is dropped with its listeners.
#[derive(Debug, Default)]
pub struct PageRegistry {
    pages: HashMap<DomainScope, Arc<Page>>,
}

impl PageRegistry {
    pub fn from_pages(pages: Vec<Page>) -> Self {
        let mut registry = PageRegistry {
            pages: HashMap::with_capacity(pages.len()),
        };

        for page in pages {
            if registry.pages.contains_key(&page.domain) {
                tracing::warn!(domain = %page.domain, "duplicate page domain configured");
            }

            if let Some(parent) = registry.lookup(page.domain.as_str()) {
                tracing::warn!(
                    domain = %page.domain,
                    is_child_of = %parent.domain,
                    "nested page domains configured"
                );
            }

            registry.pages.insert(page.domain.clone(), Arc::new(page));
        }

        registry
    }

    /// Finds the most specific tenant whose scope contains `host`.
    ///
    /// Specificity is the scope's label count; ties go to the longer scope
    /// string. Returns `None` when no scope matches.
    pub fn lookup(&self, host: &str) -> Option<Arc<Page>> {
        self.best_match(host).map(|(_, page)| page.clone())
    }

    /// The winning scope for `host`, for diagnostics.
    pub fn matching_scope(&self, host: &str) -> Option<&DomainScope> {
        self.best_match(host).map(|(scope, _)| scope)
    }

    /// Finds the tenant pinning `repository`, used by the ingest path to
    /// authorize a verified token.
    pub fn find_by_repository(&self, repository: &str) -> Option<Arc<Page>> {
        self.pages
            .values()
            .find(|page| page.git.repository == repository)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.pages.values()
    }

    fn best_match(&self, host: &str) -> Option<(&DomainScope, &Arc<Page>)> {
        self.pages
            .iter()
            .filter(|(scope, _)| scope.is_in(host))
            .max_by_key(|(scope, _)| (scope.level(), scope.as_str().len()))
    }
}
