//! Core domain model for the static-pages service.
//!
//! Everything both front-ends share lives here: the configuration model,
//! domain-scope matching, the per-repository page index, the process-wide
//! index cache, and the object-storage adapter.

pub mod cache;
pub mod config;
pub mod domain;
pub mod env_value;
pub mod errors;
pub mod index;
pub mod metrics_defs;
pub mod registry;
pub mod s3;
pub mod storage;

pub use cache::IndexCache;
pub use config::{Page, StaticPagesConfig};
pub use domain::DomainScope;
pub use errors::{ConfigError, StorageError};
pub use index::{CommitMeta, PageIndex};
pub use registry::PageRegistry;
pub use storage::PageStore;
