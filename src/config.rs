//! Wire-format constants and runtime configuration.
//!
//! The constants here define the persisted remote layout (entry, header,
//! page and leaf encodings) and must match on every client of a cluster.
//! Everything tunable per deployment lives in [`DsmConfig`] / [`TreeConfig`].

use serde::{Deserialize, Serialize};

/// Fixed key width in bytes.
pub const KEY_LEN: usize = 8;
/// Fixed value width in bytes.
pub const VAL_LEN: usize = 8;

/// Cooperative workers multiplexed on one client thread.
pub const MAX_CORO_NUM: usize = 8;
/// Upper bound on registered client threads per process.
pub const MAX_APP_THREAD: usize = 65;

/// 100 ns latency buckets per (thread, coroutine).
pub const LATENCY_WINDOWS: usize = 100_000;

/// Every remote allocation is aligned to `1 << ALLOC_ALIGN_BIT` bytes;
/// packed addresses drop the low bits accordingly.
pub const ALLOC_ALIGN_BIT: u32 = 8;

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// Size of one chunk granted by the memory-node allocator RPC.
pub const CHUNK_SIZE: u64 = 16 * MB;

/// Offset of the root pointer slot for tree id 0 (memory node 0, main space).
pub const ROOT_PTR_OFFSET: u64 = CHUNK_SIZE / 2;

/// Path-compression bytes one header can carry.
pub const H_PARTIAL_LEN_MAX: usize = 6;

/// Cap on consecutive local lock handovers before a real remote unlock.
pub const MAX_HOCL_HANDOVER: u32 = 8;

/// Per-node doorbell batch caps used by range queries.
pub const READ_ORO_MAX: usize = 1024;
pub const WRITE_ORO_MAX: usize = 24;

/// Failed leaf-update CASes before the traversal restarts from the root.
pub const MAX_RETRY_BEFORE_RESTART: usize = 50;

pub(crate) const fn round_up(x: u64, bit: u32) -> u64 {
    (x + (1 << bit) - 1) & !((1u64 << bit) - 1)
}

pub(crate) const fn round_down(x: u64, bit: u32) -> u64 {
    x & !((1u64 << bit) - 1)
}

/// `rev_ptr | header | 256 entries`.
pub const PAGE_SIZE: usize = 8 + 8 + 256 * 8;
/// Page footprint after allocation alignment.
pub const ALLOC_ALIGN_PAGE_SIZE: usize = round_up(PAGE_SIZE as u64, ALLOC_ALIGN_BIT) as usize;

/// `rev_ptr | valid | checksum | key | value | lock`.
pub const LEAF_SIZE: usize = 8 + 1 + 8 + KEY_LEN + VAL_LEN + 1;
/// Leaf footprint after allocation alignment.
pub const ALLOC_ALIGN_LEAF_SIZE: usize = round_up(LEAF_SIZE as u64, ALLOC_ALIGN_BIT) as usize;

/// Which structure backs the client index cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheVariant {
    /// Concurrent radix trie keyed by byte prefixes.
    Radix,
    /// Flat byte-prefix hash map.
    Flat,
}

/// Cluster-level layout of the disaggregated memory pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsmConfig {
    /// Number of memory nodes in the pool.
    pub memory_nodes: u16,
    /// Main-space bytes registered per memory node.
    pub main_size: u64,
    /// On-chip (device) memory per node, in KiB; holds the leaf lock bits.
    pub on_chip_kb: u64,
    /// Allocator directories per memory node.
    pub directories: usize,
    /// Rank of this client within the compute cluster; rank 0 resets the
    /// root pointer slot at startup.
    pub client_node_id: u16,
}

impl Default for DsmConfig {
    fn default() -> Self {
        Self {
            memory_nodes: 2,
            main_size: GB,
            on_chip_kb: 128,
            directories: 1,
            client_node_id: 0,
        }
    }
}

impl DsmConfig {
    /// On-chip bytes per node.
    pub fn on_chip_size(&self) -> u64 {
        self.on_chip_kb * 1024
    }

    /// Leaf lock bits available per node (1-bit locks).
    pub fn on_chip_lock_num(&self) -> u64 {
        self.on_chip_size() * 8
    }
}

/// Per-tree behavior switches.
///
/// These gate control flow only; the on-wire layout is fixed by the
/// constants above and the `art` / `fine-grain-node` build features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Keep a client-side cache of internal pages.
    pub enable_cache: bool,
    pub cache_variant: CacheVariant,
    /// Cache memory budget in MiB.
    pub cache_size_mb: usize,
    /// Slots in the local lock table.
    pub local_lock_num: usize,
    /// Update leaves in place under a leaf lock instead of out of place.
    pub in_place_update: bool,
    /// Put the leaf lock bit inside the leaf rather than in on-chip memory.
    pub embedded_lock: bool,
    /// Collapse co-located reads of one key into a single remote read.
    pub read_delegation: bool,
    /// Combine co-located writes of one key into a single remote write.
    pub write_combining: bool,
    /// Hand remote locks / CAS results over between queued local clients.
    pub lock_handover: bool,
    /// Per-node writer-lock baseline (read-optimized write exclusion).
    pub rowex: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            cache_variant: CacheVariant::Radix,
            cache_size_mb: 64,
            local_lock_num: 1 << 18,
            in_place_update: false,
            embedded_lock: false,
            read_delegation: true,
            write_combining: true,
            lock_handover: false,
            rowex: false,
        }
    }
}
