use pages::errors::LookupError;
use pages::{ConfigError, StorageError};
use thiserror::Error;

/// Errors that can occur while running the proxy front-end.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("no valid path found")]
    NoValidPath,

    #[error("path lookup deadline exceeded")]
    LookupDeadline,
}

/// Why a request could not be rewritten. All of these are answered with a
/// 502 by the transport; the variant drives what gets logged.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no page found for host {0}")]
    NoPage(String),

    #[error(transparent)]
    Subdomain(#[from] LookupError),

    #[error("invalid bucket configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("unable to load page index: {0}")]
    Index(#[from] StorageError),

    #[error("no commit to serve for host {host} (branch {branch:?})")]
    NoCommit { host: String, branch: String },

    #[error("no servable path for {candidate}: {source}")]
    NoPath {
        candidate: String,
        source: ProxyError,
    },
}
