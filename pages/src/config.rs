use crate::domain::DomainScope;
use crate::env_value::EnvValue;
use crate::errors::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Top-level configuration for both front-ends.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticPagesConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyTransportConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub pages: Vec<Page>,
}

impl StaticPagesConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: StaticPagesConfig = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    /// Validates every page; any failure is fatal at load.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for page in &self.pages {
            page.validate()?;
        }
        Ok(())
    }

    pub fn proxy_bind_addr(&self) -> (String, u16) {
        (self.server.host.clone(), self.server.proxy_port)
    }

    pub fn api_bind_addr(&self) -> (String, u16) {
        (self.server.host.clone(), self.server.api_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: String::new(),
            proxy_port: default_proxy_port(),
            api_port: default_api_port(),
        }
    }
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_api_port() -> u16 {
    8081
}

/// Tuning for the shared origin-facing transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyTransportConfig {
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    /// Idle connection timeout, e.g. `90s` or `2m`.
    #[serde(default = "default_idle_timeout", deserialize_with = "parse_duration")]
    pub timeout: Duration,
    #[serde(default = "default_true")]
    pub compression: bool,
}

impl Default for ProxyTransportConfig {
    fn default() -> Self {
        ProxyTransportConfig {
            max_idle_conns: default_max_idle_conns(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            timeout: default_idle_timeout(),
            compression: true,
        }
    }
}

fn default_max_idle_conns() -> usize {
    1000
}

fn default_max_idle_conns_per_host() -> usize {
    100
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

/// One hosted site, pinned to a domain scope, a bucket, a repository, and an
/// OIDC trust relationship.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Page {
    pub domain: DomainScope,
    pub bucket: BucketConfig,
    /// Origin settings live under the `proxy` key in the config file.
    #[serde(rename = "proxy")]
    pub origin: OriginConfig,
    /// Number of revisions to keep. Parsed for compatibility; pruning is not
    /// performed.
    #[serde(default)]
    pub history: u32,
    pub git: GitConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
}

impl Page {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bucket.validate(&self.domain)?;
        self.origin.validate(&self.domain)?;

        if self.git.repository.is_empty() {
            return Err(ConfigError::MissingField {
                domain: self.domain.to_string(),
                field: "git.repository",
            });
        }

        // Resolving the presets exercises the provider-specific requirements
        self.git.oidc_issuer(&self.domain)?;
        self.git.claim_map(&self.domain)?;

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketConfig {
    pub url: EnvValue,
    pub name: EnvValue,
    pub application_id: EnvValue,
    pub secret: EnvValue,
    #[serde(default)]
    pub region: EnvValue,
}

impl BucketConfig {
    fn validate(&self, domain: &DomainScope) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.url, "bucket.url"),
            (&self.name, "bucket.name"),
            (&self.application_id, "bucket.applicationId"),
            (&self.secret, "bucket.secret"),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingField {
                    domain: domain.to_string(),
                    field,
                });
            }
            value.resolve()?;
        }

        let endpoint = self.url.resolve()?;
        Url::parse(&endpoint).map_err(|source| ConfigError::InvalidUrl {
            domain: domain.to_string(),
            field: "bucket.url",
            source,
        })?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OriginConfig {
    /// Base URL requests are rewritten to.
    pub url: Url,
    /// Path prefix under which commit trees live at the origin.
    #[serde(default)]
    pub path: String,
    /// Index-document candidates probed after the raw path, in order.
    #[serde(default = "default_search_path")]
    pub search_path: Vec<String>,
    /// Asset served when no candidate path exists.
    #[serde(default = "default_not_found")]
    pub not_found: String,
}

impl OriginConfig {
    fn validate(&self, domain: &DomainScope) -> Result<(), ConfigError> {
        if self.url.host_str().is_none() {
            return Err(ConfigError::MissingField {
                domain: domain.to_string(),
                field: "proxy.url",
            });
        }
        Ok(())
    }
}

fn default_search_path() -> Vec<String> {
    vec!["/index.html".to_string(), "/index.htm".to_string()]
}

fn default_not_found() -> String {
    "404.html".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Custom,
}

pub const GITHUB_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitConfig {
    pub provider: GitProvider,
    pub repository: String,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default)]
    pub oidc: OidcConfig,
}

fn default_main_branch() -> String {
    "main".to_string()
}

impl GitConfig {
    /// The issuer URL trust is anchored in: the GitHub Actions issuer for the
    /// `github` preset, the configured one for `custom`.
    pub fn oidc_issuer(&self, domain: &DomainScope) -> Result<String, ConfigError> {
        match self.provider {
            GitProvider::Github => Ok(GITHUB_OIDC_ISSUER.to_string()),
            GitProvider::Custom => {
                if self.oidc.issuer.is_empty() {
                    return Err(ConfigError::InvalidProvider {
                        domain: domain.to_string(),
                        provider: "custom".to_string(),
                        reason: "custom provider requires git.oidc.issuer",
                    });
                }
                Ok(self.oidc.issuer.clone())
            }
        }
    }

    /// Which token claims carry repository, commit, branch, and environment.
    pub fn claim_map(&self, domain: &DomainScope) -> Result<ClaimMap, ConfigError> {
        match self.provider {
            GitProvider::Github => Ok(ClaimMap {
                repository: "repository".to_string(),
                commit: "sha".to_string(),
                branch: "ref".to_string(),
                environment: "environment".to_string(),
            }),
            GitProvider::Custom => {
                let map = self.oidc.claim_mappings.clone();
                if map.repository.is_empty()
                    || map.commit.is_empty()
                    || map.branch.is_empty()
                    || map.environment.is_empty()
                {
                    return Err(ConfigError::InvalidProvider {
                        domain: domain.to_string(),
                        provider: "custom".to_string(),
                        reason: "custom provider requires a complete git.oidc.claimMappings",
                    });
                }
                Ok(map)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OidcConfig {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub claim_mappings: ClaimMap,
}

/// Names of the token claims to read for each piece of commit metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimMap {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub environment: String,
}

/// Which preview axes are served via subdomain labels.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreviewConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Serve `<branch>.<domain>`.
    #[serde(default)]
    pub branch: bool,
    /// Serve `<commit>.<domain>`.
    #[serde(default, rename = "sha")]
    pub commit: bool,
    /// Serve `<environment>.<domain>`.
    #[serde(default)]
    pub environment: bool,
}

fn parse_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration_str(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_duration_str(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (number, unit) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => text.split_at(split),
        None => (text, "s"),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;

    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "ms" => Ok(Duration::from_millis(value)),
        _ => Err(format!("invalid duration unit {unit:?} in {text:?}")),
    }
}

#[doc(hidden)]
pub mod test_support {
    use super::*;

    /// A minimal valid page for tests; callers mutate fields as needed.
    pub fn test_page(domain: &str, repository: &str) -> Page {
        Page {
            domain: DomainScope::new(domain),
            bucket: BucketConfig {
                url: EnvValue::new("http://storage.local"),
                name: EnvValue::new("test-bucket"),
                application_id: EnvValue::new("test-id"),
                secret: EnvValue::new("test-secret"),
                region: EnvValue::new("auto"),
            },
            origin: OriginConfig {
                url: Url::parse("http://origin.local").expect("static url"),
                path: String::new(),
                search_path: default_search_path(),
                not_found: default_not_found(),
            },
            history: 0,
            git: GitConfig {
                provider: GitProvider::Github,
                repository: repository.to_string(),
                main_branch: "main".to_string(),
                oidc: OidcConfig::default(),
            },
            preview: PreviewConfig::default(),
        }
    }
}
