use thiserror::Error;

/// Errors raised while loading or validating configuration. All of these are
/// fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required field {field} for page {domain}")]
    MissingField {
        domain: String,
        field: &'static str,
    },

    #[error("invalid URL in {field} for page {domain}: {source}")]
    InvalidUrl {
        domain: String,
        field: &'static str,
        source: url::ParseError,
    },

    #[error("environment variable {0} is not set")]
    UnresolvedEnv(String),

    #[error("invalid git provider {provider:?} for page {domain}: {reason}")]
    InvalidProvider {
        domain: String,
        provider: String,
        reason: &'static str,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors from the object-storage adapter. A missing page index is *not* an
/// error; it surfaces as an empty index.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage returned status {status} for key {key}")]
    Unexpected { key: String, status: u16 },

    #[error("failed to read upload directory: {0}")]
    Walk(std::io::Error),

    #[error("failed to read file {path} for upload: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("could not serialize page index: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("upload worker panicked")]
    WorkerPanic,
}

/// Lookup failures shared by both front-ends.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LookupError {
    #[error("{domain} is not associated with {scope}")]
    NotInScope { domain: String, scope: String },
}
