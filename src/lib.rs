//! # DART - Disaggregated Adaptive Radix Tree
//!
//! An ordered key-value index whose pages live entirely in remote memory
//! nodes and are read and mutated by compute clients using only one-sided
//! remote primitives (read, write, masked CAS, FAA). Memory nodes run no
//! index logic: concurrency control, structural modification, allocation
//! policy and caching are all client-driven.
//!
//! ## Architecture
//!
//! - `addr`: 16+48-bit global addresses and their 6-byte packed form
//! - `key`: fixed-width byte keys, prefix arithmetic and conversions
//! - `node`: CAS-able entry/header words, page and leaf wire layouts
//! - `alloc`: client-local bump allocation over remotely granted chunks
//! - `lock_table`: read delegation, write combining, lock/CAS handover
//! - `cache`: radix-trie or flat client cache of internal pages
//! - `transport`: the one-sided verb contract plus a loopback emulation
//! - `dsm`: per-thread client handle over the transport
//! - `coro`: cooperative coroutine runtime driving one transport queue
//! - `tree`: the concurrent ART protocol itself
//! - `telemetry`: per-thread counters and latency histograms

#![warn(clippy::all)]

pub mod addr;
pub mod alloc;
pub mod cache;
pub mod config;
pub mod coro;
pub mod dsm;
pub mod error;
pub mod key;
pub mod lock_table;
pub mod node;
pub mod telemetry;
pub mod transport;
pub mod tree;

pub use addr::GlobalAddress;
pub use config::{CacheVariant, DsmConfig, TreeConfig};
pub use coro::CoroSink;
pub use dsm::Dsm;
pub use error::{TransportError, TreeError, TreeResult};
pub use key::{int_to_key, key_to_int, str_to_key, Key, Value};
pub use telemetry::TreeStats;
pub use transport::loopback::LoopbackTransport;
pub use transport::RemoteMemory;
pub use tree::{InsertOpts, Request, RequestGen, RequestOp, Tree};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
