use crate::errors::LookupError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized domain name that matches itself and any of its subdomains.
///
/// ```
/// use pages::domain::DomainScope;
///
/// let scope = DomainScope::new("Example.com.");
/// assert!(scope.is_in("example.com"));
/// assert!(scope.is_in("foo.example.com"));
/// assert!(!scope.is_in("foo.bar.com"));
/// assert_eq!(scope.subdomain_of("foo.bar.example.com").unwrap(), "foo.bar");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct DomainScope(String);

impl DomainScope {
    /// Builds a scope from a raw domain name, lower-casing it and stripping a
    /// single trailing dot.
    pub fn new(domain: &str) -> Self {
        DomainScope(normalize(domain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff `domain` is exactly this scope or a subdomain of it.
    pub fn is_in(&self, domain: &str) -> bool {
        if self.0 == domain {
            return true;
        }

        domain.ends_with(&format!(".{}", self.0))
    }

    /// Extracts the subdomain part of `domain` relative to this scope.
    ///
    /// Empty when `domain` equals the scope; an error when `domain` is not
    /// inside the scope at all.
    pub fn subdomain_of(&self, domain: &str) -> Result<String, LookupError> {
        if !self.is_in(domain) {
            return Err(LookupError::NotInScope {
                domain: domain.to_string(),
                scope: self.0.clone(),
            });
        }

        if self.0 == domain {
            return Ok(String::new());
        }

        // Drop the scope and the separating dot
        let keep = domain.len() - self.0.len() - 1;
        Ok(domain[..keep].to_string())
    }

    /// Number of dot-separated labels; the specificity of this scope.
    pub fn level(&self) -> usize {
        if self.0.is_empty() {
            return 0;
        }
        self.0.split('.').count()
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

impl From<String> for DomainScope {
    fn from(value: String) -> Self {
        DomainScope::new(&value)
    }
}

impl fmt::Display for DomainScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
