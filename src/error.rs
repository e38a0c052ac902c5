//! Crate-wide error type.
//!
//! Validation at API entry is fatal: operations surface errors immediately
//! rather than returning partial results. Inside parallel regions a worker
//! failure aborts the enclosing operation.

use crate::types::NodeId;
use thiserror::Error;

/// Errors surfaced by index construction, queries, and persistence.
#[derive(Error, Debug)]
pub enum Error {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("search list size {l} is smaller than k = {k}")]
    SearchListTooSmall { l: usize, k: usize },

    #[error("database and query sets cannot both be blocked")]
    BothBlocked,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("metric {0} is reserved and not yet supported")]
    UnsupportedMetric(&'static str),

    #[error("unknown storage version: {0:?}")]
    UnknownStorageVersion(String),

    #[error("group member {name:?} not found")]
    MissingMember { name: String },

    #[error("metadata key {key:?} not found")]
    MissingMetadata { key: String },

    #[error("array member {name:?} is corrupted: {reason}")]
    Corruption { name: String, reason: String },

    #[error("self edge on node {0}")]
    SelfEdge(NodeId),

    #[error("{ntotal} vectors overflow the node id type")]
    IdOverflow { ntotal: usize },

    #[error("thread pool: {0}")]
    ThreadPool(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
