//! eskeeper controller: keeps Elasticsearch security role mappings, index
//! and snapshot lifecycle policies and watches converged with manifests.

pub mod clients;
pub mod config;
pub mod connection;
pub mod manifest;
pub mod reconciler;
pub mod runtime;
