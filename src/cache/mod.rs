//! Client-side cache of remote internal pages.
//!
//! Both variants share one contract: a lookup returns a snapshot of the
//! deepest cached page on the key's path plus the slot the snapshot came
//! from, so staleness discovered during traversal can be repaired by a
//! pointer-compare-and-null on that slot — only the first invalidation of
//! a given snapshot wins, racers skip. Replaced snapshots drain through an
//! epoch queue instead of being dropped inline, bounding how long a racing
//! reader can still hold one.

mod flat;
mod radix;

pub use flat::FlatCache;
pub use radix::RadixCache;

use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::RwLock;

use crate::addr::GlobalAddress;
use crate::config::{KEY_LEN, MAX_APP_THREAD, MAX_CORO_NUM};
use crate::key::{get_leftmost, get_rightmost, key_add, Key};
use crate::node::{InternalEntry, InternalPage};

/// Replaced snapshots older than this many deferred frees are dropped.
pub const SAFELY_FREE_EPOCH: usize = 2 * MAX_APP_THREAD * MAX_CORO_NUM;

/// Snapshot of one remote page: its depth past the compressed path, the
/// remote base of its entry array, and its live entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub depth: u8,
    pub addr: GlobalAddress,
    pub records: Vec<InternalEntry>,
}

impl CacheEntry {
    pub fn from_page(page: &InternalPage, entry_array_addr: GlobalAddress) -> Self {
        let cap = page.hdr.node_type().capacity();
        Self {
            depth: page.hdr.depth + page.hdr.partial_len,
            addr: entry_array_addr,
            records: page.records[..cap].to_vec(),
        }
    }

    /// Approximate footprint used for budget accounting.
    pub fn content_size(&self) -> usize {
        1 + 8 + 8 * self.records.len()
    }
}

/// One invalidatable slot holding an entry snapshot.
#[derive(Default)]
pub struct EntrySlot {
    inner: RwLock<Option<Arc<CacheEntry>>>,
}

impl EntrySlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(entry: Arc<CacheEntry>) -> Self {
        Self {
            inner: RwLock::new(Some(entry)),
        }
    }

    pub fn load(&self) -> Option<Arc<CacheEntry>> {
        self.inner.read().clone()
    }

    /// Pointer-compare-and-swap: succeeds only while the slot still holds
    /// exactly the snapshot the caller observed.
    pub fn replace_if(
        &self,
        expected: Option<&Arc<CacheEntry>>,
        new: Option<Arc<CacheEntry>>,
    ) -> bool {
        let mut guard = self.inner.write();
        let matches = match (&*guard, expected) {
            (Some(cur), Some(exp)) => Arc::ptr_eq(cur, exp),
            (None, None) => true,
            _ => false,
        };
        if matches {
            *guard = new;
        }
        matches
    }
}

/// A successful cache probe: the chosen child entry (`idx` within the
/// snapshot) plus the slot needed to invalidate the snapshot later.
#[derive(Clone)]
pub struct CacheHit {
    pub slot: Arc<EntrySlot>,
    pub entry: Arc<CacheEntry>,
    pub idx: usize,
}

impl CacheHit {
    /// Remote address of the entry this hit descends through.
    pub fn entry_ptr(&self) -> GlobalAddress {
        self.entry.addr.add(8 * self.idx as u64)
    }
}

/// A cache probe made on behalf of a range scan, annotated with the key
/// interval (`from ..= to`) the cached entry covers.
#[derive(Clone)]
pub struct RangeCacheHit {
    pub from: Key,
    pub to: Key,
    pub e_ptr: GlobalAddress,
    pub e: InternalEntry,
    pub depth: usize,
    pub hit: CacheHit,
}

/// Deferred-free queue; items pushed beyond the epoch bound are dropped.
pub(crate) struct EpochQueue<T> {
    queue: SegQueue<T>,
}

impl<T> EpochQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    pub fn defer(&self, item: T) {
        self.queue.push(item);
        while self.queue.len() > SAFELY_FREE_EPOCH {
            let _ = self.queue.pop();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The contract shared by both cache variants.
pub trait IndexCache: Send + Sync {
    /// Record a freshly read page under the key prefix that leads to it.
    fn add(&self, k: &Key, page: &InternalPage, entry_array_addr: GlobalAddress);

    /// Deepest cached entry on `k`'s path whose partial matches the next
    /// key byte.
    fn lookup(&self, k: &Key) -> Option<CacheHit>;

    /// Drop the snapshot a hit came from; only the first caller wins.
    fn invalidate(&self, hit: &CacheHit);

    /// Emit a report through `log`.
    fn log_statistics(&self);

    /// Probe every key in `[from, to)` and annotate hits with the key span
    /// each cached entry covers.
    fn lookup_range(&self, from: &Key, to: &Key, out: &mut Vec<RangeCacheHit>) {
        let mut k = *from;
        while k < *to {
            if let Some(hit) = self.lookup(&k) {
                let e = hit.entry.records[hit.idx];
                let depth = hit.entry.depth as usize;
                let (leftmost, rightmost) = if e.is_leaf() {
                    (k, k)
                } else {
                    (get_leftmost(&k, depth), get_rightmost(&k, depth))
                };
                out.push(RangeCacheHit {
                    from: leftmost,
                    to: rightmost,
                    e_ptr: hit.entry_ptr(),
                    e,
                    depth,
                    hit,
                });
            }
            k = key_add(&k, 1);
        }
    }
}

/// Key prefix a page is filed under: the consumed bytes plus the page's
/// own compressed path.
pub(crate) fn cache_prefix(k: &Key, page: &InternalPage) -> Vec<u8> {
    let depth = (page.hdr.depth as usize).saturating_sub(1);
    let mut bytes = k[..depth].to_vec();
    bytes.extend_from_slice(&page.hdr.partial[..page.hdr.partial_len as usize]);
    bytes
}

/// Probe prefix for a key: all bytes but the last.
pub(crate) fn probe_prefix(k: &Key) -> Vec<u8> {
    k[..KEY_LEN - 1].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::int_to_key;
    use crate::node::NodeType;

    fn entry(depth: u8) -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            depth,
            addr: GlobalAddress::new(0, 0x1000),
            records: vec![InternalEntry::NULL; 4],
        })
    }

    #[test]
    fn slot_invalidation_is_first_wins() {
        let e = entry(3);
        let slot = EntrySlot::with(e.clone());
        assert!(slot.replace_if(Some(&e), None));
        assert!(!slot.replace_if(Some(&e), None)); // second racer skips
        assert!(slot.load().is_none());
    }

    #[test]
    fn slot_replace_fails_on_foreign_snapshot() {
        let e1 = entry(3);
        let e2 = entry(3);
        let slot = EntrySlot::with(e1);
        assert!(!slot.replace_if(Some(&e2), None));
        assert!(slot.load().is_some());
    }

    #[test]
    fn epoch_queue_drains_past_bound() {
        let q = EpochQueue::new();
        for i in 0..SAFELY_FREE_EPOCH + 10 {
            q.defer(i);
        }
        assert_eq!(q.len(), SAFELY_FREE_EPOCH);
    }

    #[test]
    fn cache_prefix_appends_compressed_path() {
        let k = int_to_key(0x0102030405060708);
        let page = InternalPage::new(&k, 2, 3, NodeType::for_count(2), GlobalAddress::NULL);
        // consumed bytes k[..2] plus the two partial bytes at depths 3, 4
        assert_eq!(cache_prefix(&k, &page), vec![0x01, 0x02, 0x03, 0x04]);
    }
}
