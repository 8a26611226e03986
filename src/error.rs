//! Error types surfaced by the index client.
//!
//! Structural races (CAS conflicts, stale cache entries, torn leaf reads)
//! are recovered inside the traversal state machine and never reach these
//! types; what remains is transport-level failure and misconfiguration.

use thiserror::Error;

use crate::addr::GlobalAddress;

/// Errors raised by the one-sided remote memory transport.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The target range falls outside the node's registered region.
    #[error("address {0} is outside the registered region")]
    OutOfRange(GlobalAddress),

    /// Remote atomics operate on naturally aligned 64-bit words only.
    #[error("atomic at {0} is not 8-byte aligned")]
    Unaligned(GlobalAddress),

    /// No memory node with this id is part of the cluster.
    #[error("unknown memory node {0}")]
    UnknownNode(u16),

    /// The allocator on this memory node has no chunk left to grant.
    #[error("memory node {0} has no free chunks")]
    Exhausted(u16),
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by the public index API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Rejected configuration detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for index operations.
pub type TreeResult<T> = Result<T, TreeError>;
