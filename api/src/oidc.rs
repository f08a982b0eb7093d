//! Multi-issuer OIDC verification for the ingest path.
//!
//! Each configured issuer gets its own verification task; the first one to
//! accept the bearer token wins and the rest are cancelled. Trust is
//! anchored in the issuer URL alone, so audience checking is disabled.

use chrono::Utc;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use pages::config::ClaimMap;
use pages::errors::ConfigError;
use pages::{CommitMeta, Page};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Wall-clock budget for the whole verification race.
const VERIFY_DEADLINE: Duration = Duration::from_secs(10);

/// Per-request HTTP timeout for discovery and JWKS fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing or invalid Authorization header")]
    MissingBearer,

    #[error("failed to initialize OIDC provider {issuer}: {reason}")]
    Discovery { issuer: String, reason: String },

    #[error("failed to verify OIDC token against {issuer}: {reason}")]
    InvalidToken { issuer: String, reason: String },

    #[error("failed to extract {claim} claim from token")]
    MissingClaim { claim: &'static str },

    #[error("OIDC verification timed out")]
    Deadline,

    #[error("none of the configured OIDC providers accepted the token: {0}")]
    NoneAccepted(String),

    #[error("no OIDC issuers configured")]
    NoIssuers,
}

/// The candidate issuers for one request, deduplicated across all tenants.
#[derive(Debug, Clone, Default)]
pub struct IssuerSet {
    issuers: HashMap<String, ClaimMap>,
}

impl IssuerSet {
    pub fn from_pages<'a>(pages: impl Iterator<Item = &'a Page>) -> Result<Self, ConfigError> {
        let mut issuers = HashMap::new();
        for page in pages {
            let issuer = page.git.oidc_issuer(&page.domain)?;
            let claims = page.git.claim_map(&page.domain)?;
            // identical issuers collapse onto one entry
            issuers.insert(issuer, claims);
        }
        Ok(IssuerSet { issuers })
    }

    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }
}

/// Races token verification across an [`IssuerSet`].
#[derive(Clone)]
pub struct OidcVerifier {
    http: reqwest::Client,
    /// When set, tokens are validated with this HS256 secret instead of the
    /// issuer's JWKS. Tests and local development only.
    hs256_secret: Option<String>,
}

impl OidcVerifier {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(OidcVerifier {
            http,
            hs256_secret: None,
        })
    }

    pub fn hs256_for_tests(secret: impl Into<String>) -> Self {
        OidcVerifier {
            http: reqwest::Client::new(),
            hs256_secret: Some(secret.into()),
        }
    }

    /// Verifies `token` against every issuer in parallel.
    ///
    /// The first successful verification wins; its siblings are cancelled
    /// and their errors discarded. When nobody accepts the token, the
    /// first-observed issuer error is reported. The deadline outranks
    /// everything else.
    pub async fn verify(
        &self,
        token: &str,
        issuers: &IssuerSet,
    ) -> Result<CommitMeta, AuthError> {
        if issuers.is_empty() {
            return Err(AuthError::NoIssuers);
        }

        let mut tasks = JoinSet::new();
        for (issuer, claims) in &issuers.issuers {
            let verifier = self.clone();
            let token = token.to_string();
            let issuer = issuer.clone();
            let claims = claims.clone();

            tasks.spawn(async move { verifier.verify_with_issuer(&token, &issuer, &claims).await });
        }

        let deadline = tokio::time::sleep(VERIFY_DEADLINE);
        tokio::pin!(deadline);

        let mut first_error: Option<AuthError> = None;
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tasks.abort_all();
                    return Err(AuthError::Deadline);
                }
                joined = tasks.join_next() => match joined {
                    None => {
                        let reason = first_error
                            .map(|error| error.to_string())
                            .unwrap_or_else(|| "no verification attempted".to_string());
                        return Err(AuthError::NoneAccepted(reason));
                    }
                    Some(Ok(Ok(meta))) => {
                        tasks.abort_all();
                        return Ok(meta);
                    }
                    Some(Ok(Err(error))) => {
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                    Some(Err(join_error)) if join_error.is_cancelled() => {}
                    Some(Err(join_error)) => {
                        tracing::error!(error = %join_error, "verification task panicked");
                    }
                },
            }
        }
    }

    /// One issuer's verification: discovery → JWKS → signature and standard
    /// claims → claim extraction. Fails fast at the first broken step.
    async fn verify_with_issuer(
        &self,
        token: &str,
        issuer: &str,
        claims: &ClaimMap,
    ) -> Result<CommitMeta, AuthError> {
        let token_claims = match &self.hs256_secret {
            Some(secret) => self.decode_hs256(token, issuer, secret)?,
            None => self.decode_with_jwks(token, issuer).await?,
        };

        extract_commit_meta(&token_claims, claims)
    }

    fn decode_hs256(&self, token: &str, issuer: &str, secret: &str) -> Result<Value, AuthError> {
        let validation = validation_for(Algorithm::HS256, issuer);
        decode::<Value>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|error| AuthError::InvalidToken {
            issuer: issuer.to_string(),
            reason: error.to_string(),
        })
    }

    async fn decode_with_jwks(&self, token: &str, issuer: &str) -> Result<Value, AuthError> {
        let jwks = self.fetch_jwks(issuer).await?;

        let header = decode_header(token).map_err(|error| AuthError::InvalidToken {
            issuer: issuer.to_string(),
            reason: error.to_string(),
        })?;
        let kid = header.kid.ok_or_else(|| AuthError::InvalidToken {
            issuer: issuer.to_string(),
            reason: "token header carries no key id".to_string(),
        })?;
        let algorithm = match header.alg {
            Algorithm::RS256 | Algorithm::ES256 => header.alg,
            other => {
                return Err(AuthError::InvalidToken {
                    issuer: issuer.to_string(),
                    reason: format!("unsupported algorithm {other:?}"),
                });
            }
        };

        let jwk = jwks
            .keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid.as_str()))
            .ok_or_else(|| AuthError::InvalidToken {
                issuer: issuer.to_string(),
                reason: format!("no key {kid} in issuer JWKS"),
            })?;
        let key = DecodingKey::from_jwk(jwk).map_err(|error| AuthError::InvalidToken {
            issuer: issuer.to_string(),
            reason: format!("invalid jwk: {error}"),
        })?;

        let validation = validation_for(algorithm, issuer);
        decode::<Value>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|error| AuthError::InvalidToken {
                issuer: issuer.to_string(),
                reason: error.to_string(),
            })
    }

    async fn fetch_jwks(&self, issuer: &str) -> Result<JwkSet, AuthError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );

        let discovery: DiscoveryDocument = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| AuthError::Discovery {
                issuer: issuer.to_string(),
                reason: error.to_string(),
            })?
            .json()
            .await
            .map_err(|error| AuthError::Discovery {
                issuer: issuer.to_string(),
                reason: error.to_string(),
            })?;

        self.http
            .get(&discovery.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| AuthError::Discovery {
                issuer: issuer.to_string(),
                reason: error.to_string(),
            })?
            .json()
            .await
            .map_err(|error| AuthError::Discovery {
                issuer: issuer.to_string(),
                reason: error.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

fn validation_for(algorithm: Algorithm, issuer: &str) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss"]);
    // Client-ID checking is disabled on purpose; the issuer URL is the trust
    // anchor and tokens are minted by CI for many audiences.
    validation.validate_aud = false;
    validation
}

/// Reads the configured claims out of a verified token. Repository, commit,
/// and branch are required; a missing one fails this issuer's verification
/// outright. Environment is optional and defaults to empty.
fn extract_commit_meta(token_claims: &Value, map: &ClaimMap) -> Result<CommitMeta, AuthError> {
    let text = |name: &str| token_claims.get(name).and_then(Value::as_str);

    let repository = text(&map.repository).ok_or(AuthError::MissingClaim {
        claim: "repository",
    })?;
    let commit = text(&map.commit).ok_or(AuthError::MissingClaim { claim: "commit" })?;
    let branch_ref = text(&map.branch).ok_or(AuthError::MissingClaim { claim: "branch" })?;
    let branch = branch_ref.strip_prefix("refs/heads/").unwrap_or(branch_ref);
    let environment = text(&map.environment).unwrap_or_default();

    Ok(CommitMeta::new(
        repository,
        commit,
        branch,
        environment,
        Utc::now(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use pages::config::test_support::test_page;
    use pages::config::{GitProvider, OidcConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "test-secret";

    fn github_claim_map() -> ClaimMap {
        ClaimMap {
            repository: "repository".to_string(),
            commit: "sha".to_string(),
            branch: "ref".to_string(),
            environment: "environment".to_string(),
        }
    }

    fn issuer_set(issuers: &[&str]) -> IssuerSet {
        IssuerSet {
            issuers: issuers
                .iter()
                .map(|issuer| (issuer.to_string(), github_claim_map()))
                .collect(),
        }
    }

    fn signed_token(issuer: &str, extra: &[(&str, &str)]) -> String {
        let exp = (Utc::now() + chrono::Duration::hours(1)).timestamp();
        let mut claims = serde_json::json!({ "iss": issuer, "exp": exp });
        for (name, value) in extra {
            claims[*name] = Value::String(value.to_string());
        }
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("token")
    }

    fn github_token(issuer: &str) -> String {
        signed_token(
            issuer,
            &[
                ("repository", "org/site"),
                ("sha", "abc123"),
                ("ref", "refs/heads/main"),
                ("environment", "production"),
            ],
        )
    }

    #[tokio::test]
    async fn test_accepting_issuer_wins() {
        let verifier = OidcVerifier::hs256_for_tests(SECRET);
        let issuers = issuer_set(&["https://issuer-a.example", "https://issuer-b.example"]);

        // only issuer-b matches the token's iss claim
        let token = github_token("https://issuer-b.example");
        let meta = verifier.verify(&token, &issuers).await.unwrap();

        assert_eq!(meta.repository, "org/site");
        assert_eq!(meta.commit_id, "abc123");
        assert_eq!(meta.branch, "main");
        assert_eq!(meta.environment, "production");
    }

    #[tokio::test]
    async fn test_no_issuer_accepts() {
        let verifier = OidcVerifier::hs256_for_tests(SECRET);
        let issuers = issuer_set(&["https://issuer-a.example"]);

        let token = github_token("https://somewhere-else.example");
        let error = verifier.verify(&token, &issuers).await.unwrap_err();
        assert!(matches!(error, AuthError::NoneAccepted(_)));
        assert!(error.to_string().contains("issuer-a.example"));
    }

    #[tokio::test]
    async fn test_missing_required_claim_fails_issuer() {
        let verifier = OidcVerifier::hs256_for_tests(SECRET);
        let issuers = issuer_set(&["https://issuer-a.example"]);

        // no "sha" claim: the issuer task must fail, not emit a partial record
        let token = signed_token(
            "https://issuer-a.example",
            &[("repository", "org/site"), ("ref", "refs/heads/main")],
        );
        let error = verifier.verify(&token, &issuers).await.unwrap_err();
        assert!(matches!(error, AuthError::NoneAccepted(_)));
        assert!(error.to_string().contains("commit"));
    }

    #[tokio::test]
    async fn test_environment_claim_is_optional() {
        let verifier = OidcVerifier::hs256_for_tests(SECRET);
        let issuers = issuer_set(&["https://issuer-a.example"]);

        let token = signed_token(
            "https://issuer-a.example",
            &[
                ("repository", "org/site"),
                ("sha", "abc123"),
                ("ref", "main"),
            ],
        );
        let meta = verifier.verify(&token, &issuers).await.unwrap();
        assert_eq!(meta.environment, "");
        // branch without the refs/heads prefix passes through untouched
        assert_eq!(meta.branch, "main");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let verifier = OidcVerifier::hs256_for_tests(SECRET);
        let issuers = issuer_set(&["https://issuer-a.example"]);

        let exp = (Utc::now() - chrono::Duration::hours(1)).timestamp();
        let claims = serde_json::json!({
            "iss": "https://issuer-a.example",
            "exp": exp,
            "repository": "org/site",
            "sha": "abc123",
            "ref": "main",
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let error = verifier.verify(&token, &issuers).await.unwrap_err();
        assert!(matches!(error, AuthError::NoneAccepted(_)));
    }

    #[tokio::test]
    async fn test_unreachable_issuer_reports_discovery_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let verifier = OidcVerifier::new().unwrap();
        let issuers = issuer_set(&[server.uri().as_str()]);

        let token = github_token(server.uri().as_str());
        let error = verifier.verify(&token, &issuers).await.unwrap_err();
        assert!(matches!(error, AuthError::NoneAccepted(_)));
    }

    #[test]
    fn test_issuer_set_deduplicates() {
        let pages = vec![
            test_page("a.example.com", "org/site-a"),
            test_page("b.example.com", "org/site-b"),
        ];
        // both pages use the github preset, so one issuer remains
        let issuers = IssuerSet::from_pages(pages.iter()).unwrap();
        assert_eq!(issuers.len(), 1);
    }

    #[test]
    fn test_issuer_set_custom_provider() {
        let mut page = test_page("a.example.com", "org/site-a");
        page.git.provider = GitProvider::Custom;
        page.git.oidc = OidcConfig {
            issuer: "https://oidc.example".to_string(),
            claim_mappings: github_claim_map(),
        };

        let pages = vec![page, test_page("b.example.com", "org/site-b")];
        let issuers = IssuerSet::from_pages(pages.iter()).unwrap();
        assert_eq!(issuers.len(), 2);
    }
}
