//! Clients for remote systems.
//!
//! - elasticsearch: REST API of an Elasticsearch cluster (security, ILM, SLM,
//!   watcher endpoints)

pub mod elasticsearch;

pub use elasticsearch::{EsClient, EsError};
