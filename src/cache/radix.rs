//! Radix cache variant: a concurrent trie keyed by byte prefixes.
//!
//! Trie nodes carry a path-compressed header, split exactly the way the
//! remote tree splits its headers, and map the next byte to a snapshot
//! slot plus a child node. Budget accounting is per trie node through the
//! free-memory manager; when the eviction list drains while memory is
//! still exhausted the whole trie is rebuilt from an empty root.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::addr::GlobalAddress;
use crate::cache::{
    cache_prefix, probe_prefix, CacheEntry, CacheHit, EntrySlot, EpochQueue, IndexCache,
};
use crate::config::MB;
use crate::key::Key;
use crate::node::InternalPage;

#[derive(Debug, Default, PartialEq, Eq)]
struct CacheHeader {
    depth: usize,
    partial: Vec<u8>,
}

impl CacheHeader {
    fn new(byte_array: &[u8], depth: usize, partial_len: usize) -> Self {
        Self {
            depth,
            partial: byte_array[depth..depth + partial_len].to_vec(),
        }
    }

    /// Suffix header for the old node after a mismatch at `diff_idx`.
    fn split(old: &CacheHeader, diff_idx: usize) -> Self {
        Self {
            depth: old.depth + diff_idx + 1,
            partial: old.partial[diff_idx + 1..].to_vec(),
        }
    }

    fn content_size(&self) -> usize {
        1 + self.partial.len()
    }
}

struct CacheSlotPair {
    entry: Arc<EntrySlot>,
    next: RwLock<Option<Arc<CacheNode>>>,
}

impl CacheSlotPair {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            entry: Arc::new(EntrySlot::empty()),
            next: RwLock::new(None),
        })
    }

    fn new(entry: Option<Arc<CacheEntry>>, next: Option<Arc<CacheNode>>) -> Arc<Self> {
        let slot = match entry {
            Some(e) => EntrySlot::with(e),
            None => EntrySlot::empty(),
        };
        Arc::new(Self {
            entry: Arc::new(slot),
            next: RwLock::new(next),
        })
    }
}

struct CacheNode {
    header: RwLock<Arc<CacheHeader>>,
    records: DashMap<u8, Arc<CacheSlotPair>>,
}

impl CacheNode {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            header: RwLock::new(Arc::new(CacheHeader::default())),
            records: DashMap::new(),
        })
    }

    /// A path-compressed node holding `new_entry` under the last byte of
    /// `byte_array`; returns the slot for the eviction list.
    fn leaf_path(
        byte_array: &[u8],
        start: usize,
        new_entry: Arc<CacheEntry>,
    ) -> (Arc<Self>, Arc<EntrySlot>) {
        let node = Self {
            header: RwLock::new(Arc::new(CacheHeader::new(
                byte_array,
                start,
                byte_array.len() - start - 1,
            ))),
            records: DashMap::new(),
        };
        let pair = CacheSlotPair::new(Some(new_entry), None);
        let slot = pair.entry.clone();
        node.records.insert(byte_array[byte_array.len() - 1], pair);
        (Arc::new(node), slot)
    }

    fn content_size(&self) -> usize {
        self.header.read().content_size() + (1 + 8 + 8) * self.records.len()
    }
}

/// Tracks cache memory consumption to trigger eviction; node footprints
/// are upserted so re-accounting a grown node only charges the delta.
struct FreeMemManager {
    free_size: AtomicI64,
    node_sizes: DashMap<usize, usize>,
}

impl FreeMemManager {
    fn new(total: i64) -> Self {
        Self {
            free_size: AtomicI64::new(total),
            node_sizes: DashMap::new(),
        }
    }

    fn consume(&self, bytes: usize) {
        self.free_size.fetch_sub(bytes as i64, Ordering::Relaxed);
    }

    fn free_bytes(&self, bytes: usize) {
        self.free_size.fetch_add(bytes as i64, Ordering::Relaxed);
    }

    fn consume_by_node(&self, node: &Arc<CacheNode>) {
        let key = Arc::as_ptr(node) as usize;
        let new_size = node.content_size();
        let old_size = self.node_sizes.insert(key, new_size).unwrap_or(0);
        if new_size != old_size {
            self.free_size
                .fetch_add(old_size as i64 - new_size as i64, Ordering::Relaxed);
        }
    }

    fn remain(&self) -> i64 {
        self.free_size.load(Ordering::Relaxed)
    }

    fn reset(&self, total: i64) {
        self.free_size.store(total, Ordering::Relaxed);
        self.node_sizes.clear();
    }
}

struct SearchFrame {
    slot: Arc<EntrySlot>,
    entry: Option<Arc<CacheEntry>>,
    next_idx: usize,
}

pub struct RadixCache {
    cache_size_mb: usize,
    free: FreeMemManager,
    root: RwLock<Arc<CacheNode>>,
    /// Every node ever linked in, for statistics.
    node_queue: Mutex<Vec<Arc<CacheNode>>>,
    eviction_list: SegQueue<(Arc<EntrySlot>, Arc<CacheEntry>)>,
    entry_gc: EpochQueue<Arc<CacheEntry>>,
    hdr_gc: EpochQueue<Arc<CacheHeader>>,
}

impl RadixCache {
    pub fn new(cache_size_mb: usize) -> Self {
        let root = CacheNode::empty();
        Self {
            cache_size_mb,
            free: FreeMemManager::new((cache_size_mb as u64 * MB) as i64),
            root: RwLock::new(root.clone()),
            node_queue: Mutex::new(vec![root]),
            eviction_list: SegQueue::new(),
            entry_gc: EpochQueue::new(),
            hdr_gc: EpochQueue::new(),
        }
    }

    fn record_new_node(&self, node: &Arc<CacheNode>) {
        self.node_queue.lock().push(node.clone());
    }

    /// Build the replacement for `old_node` when its compressed path
    /// mismatches `byte_array` at `partial_1` vs `partial_2`. Returns the
    /// new node, a nested leaf-path node if one was needed, and the slot
    /// now holding `new_entry`.
    fn split_node(
        byte_array: &[u8],
        start: usize,
        partial_len: usize,
        partial_1: u8,
        old_node: Arc<CacheNode>,
        partial_2: u8,
        new_entry: Arc<CacheEntry>,
    ) -> (Arc<CacheNode>, Option<Arc<CacheNode>>, Arc<EntrySlot>) {
        let node = CacheNode {
            header: RwLock::new(Arc::new(CacheHeader::new(byte_array, start, partial_len))),
            records: DashMap::new(),
        };
        if partial_1 == partial_2 {
            // the new entry lands exactly on the split byte
            let pair = CacheSlotPair::new(Some(new_entry), Some(old_node));
            let slot = pair.entry.clone();
            node.records.insert(partial_1, pair);
            return (Arc::new(node), None, slot);
        }
        node.records
            .insert(partial_1, CacheSlotPair::new(None, Some(old_node)));
        if start + partial_len >= byte_array.len() - 1 {
            let pair = CacheSlotPair::new(Some(new_entry), None);
            let slot = pair.entry.clone();
            node.records.insert(partial_2, pair);
            (Arc::new(node), None, slot)
        } else {
            let (nested, slot) =
                CacheNode::leaf_path(byte_array, start + partial_len + 1, new_entry);
            node.records
                .insert(partial_2, CacheSlotPair::new(None, Some(nested.clone())));
            (Arc::new(node), Some(nested), slot)
        }
    }

    fn insert_entry(&self, byte_array: &[u8], new_entry: Arc<CacheEntry>) {
        let mut parent: Option<Arc<CacheNode>> = None;
        let mut node = self.root.read().clone();
        let mut idx = 0usize;

        'next: loop {
            // 1. walk the compressed path; a mismatch (or running out of
            // probe bytes) splits this trie node
            let hdr = node.header.read().clone();
            for i in 0..hdr.partial.len() {
                let cur_partial = byte_array[hdr.depth + i];
                if hdr.depth + i != byte_array.len() - 1 && cur_partial == hdr.partial[i] {
                    continue;
                }
                let Some(parent_node) = parent.as_ref() else {
                    return; // root header is empty; racer rebuilt beneath us
                };
                let partial_len = hdr.depth + i - idx;
                let (new_node, nested, slot) = Self::split_node(
                    byte_array,
                    idx,
                    partial_len,
                    hdr.partial[i],
                    node.clone(),
                    cur_partial,
                    new_entry.clone(),
                );
                let Some(pair) = parent_node
                    .records
                    .get(&byte_array[idx - 1])
                    .map(|r| r.value().clone())
                else {
                    return; // edge vanished under a rebuild
                };
                {
                    let mut link = pair.next.write();
                    match link.as_ref() {
                        Some(cur) if Arc::ptr_eq(cur, &node) => {
                            *link = Some(new_node.clone());
                        }
                        Some(other) => {
                            // a racer replaced the child first; retry into it
                            node = other.clone();
                            continue 'next;
                        }
                        None => {
                            // child was deleted; the new node takes its place
                            *link = Some(new_node.clone());
                        }
                    }
                }
                // shorten the displaced node's header to its suffix
                {
                    let mut old_hdr = node.header.write();
                    if Arc::ptr_eq(&*old_hdr, &hdr) {
                        let displaced = std::mem::replace(
                            &mut *old_hdr,
                            Arc::new(CacheHeader::split(&hdr, i)),
                        );
                        drop(old_hdr);
                        self.hdr_gc.defer(displaced);
                    }
                }
                self.free.consume_by_node(&new_node);
                if let Some(n) = &nested {
                    self.free.consume_by_node(n);
                    self.record_new_node(n);
                }
                self.free.consume_by_node(&node);
                self.free.consume(new_entry.content_size());
                self.record_new_node(&new_node);
                self.eviction_list.push((slot, new_entry));
                return;
            }
            idx = hdr.depth + hdr.partial.len();

            // 2. descend (or land) on the next byte
            let partial = byte_array[idx];
            let pair = node
                .records
                .entry(partial)
                .or_insert_with(CacheSlotPair::empty)
                .value()
                .clone();

            if idx == byte_array.len() - 1 {
                // last level: publish the snapshot in place
                let old = pair.entry.load();
                if pair.entry.replace_if(old.as_ref(), Some(new_entry.clone())) {
                    self.free.consume_by_node(&node);
                    self.free.consume(new_entry.content_size());
                    if let Some(old_entry) = old {
                        self.free.free_bytes(old_entry.content_size());
                        self.entry_gc.defer(old_entry);
                    }
                    self.eviction_list.push((pair.entry.clone(), new_entry));
                }
                return;
            }

            let existing = pair.next.read().clone();
            match existing {
                Some(next) => {
                    parent = Some(node);
                    node = next;
                    idx += 1;
                }
                None => {
                    let mut link = pair.next.write();
                    match link.as_ref() {
                        None => {
                            let (next_node, slot) =
                                CacheNode::leaf_path(byte_array, idx + 1, new_entry.clone());
                            *link = Some(next_node.clone());
                            drop(link);
                            self.record_new_node(&next_node);
                            self.free.consume_by_node(&node);
                            self.free.consume_by_node(&next_node);
                            self.free.consume(new_entry.content_size());
                            self.eviction_list.push((slot, new_entry));
                            return;
                        }
                        Some(next) => {
                            // lost the install race; descend into the winner
                            let next = next.clone();
                            drop(link);
                            parent = Some(node);
                            node = next;
                            idx += 1;
                        }
                    }
                }
            }
        }
    }

    fn search_stack(&self, byte_array: &[u8]) -> Vec<SearchFrame> {
        let mut node = self.root.read().clone();
        let mut ret = Vec::new();
        loop {
            let hdr = node.header.read().clone();
            for i in 0..hdr.partial.len() {
                if hdr.depth + i == byte_array.len() - 1
                    || byte_array[hdr.depth + i] != hdr.partial[i]
                {
                    return ret;
                }
            }
            let idx = hdr.depth + hdr.partial.len();
            if idx >= byte_array.len() {
                return ret;
            }
            let Some(pair) = node.records.get(&byte_array[idx]).map(|r| r.value().clone())
            else {
                return ret;
            };
            ret.push(SearchFrame {
                slot: pair.entry.clone(),
                entry: pair.entry.load(),
                next_idx: idx + 1,
            });
            let next = pair.next.read().clone();
            match next {
                Some(next) => node = next,
                None => return ret,
            }
        }
    }

    fn invalidate_slot(&self, slot: &Arc<EntrySlot>, entry: &Arc<CacheEntry>) {
        if slot.replace_if(Some(entry), None) {
            self.free.free_bytes(entry.content_size());
            self.entry_gc.defer(entry.clone());
        }
    }

    fn evict(&self) {
        loop {
            match self.eviction_list.pop() {
                Some((slot, entry)) => {
                    // second chance: only drop a snapshot still in place
                    let current = slot.load();
                    if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, &entry)) {
                        self.invalidate_slot(&slot, &entry);
                    }
                    if self.free.remain() >= 0 {
                        return;
                    }
                }
                None => {
                    if self.free.remain() < 0 {
                        self.rebuild();
                    }
                    return;
                }
            }
        }
    }

    /// Last resort: nothing left to evict but the budget is still blown.
    /// Racing readers keep their snapshots alive until they drop them.
    fn rebuild(&self) {
        debug!("index cache rebuilt under memory pressure");
        let fresh = CacheNode::empty();
        *self.root.write() = fresh.clone();
        self.free.reset((self.cache_size_mb as u64 * MB) as i64);
        let mut queue = self.node_queue.lock();
        queue.clear();
        queue.push(fresh);
    }
}

impl IndexCache for RadixCache {
    fn add(&self, k: &Key, page: &InternalPage, entry_array_addr: GlobalAddress) {
        if page.hdr.depth <= 1 && page.hdr.partial_len == 0 {
            return; // the root page itself is not worth a trie path
        }
        let byte_array = cache_prefix(k, page);
        if byte_array.is_empty() {
            return;
        }
        let entry = Arc::new(CacheEntry::from_page(page, entry_array_addr));
        self.insert_entry(&byte_array, entry);
        if self.free.remain() < 0 {
            self.evict();
        }
    }

    fn lookup(&self, k: &Key) -> Option<CacheHit> {
        let prefix = probe_prefix(k);
        let mut stack = self.search_stack(&prefix);
        while let Some(frame) = stack.pop() {
            if let Some(entry) = frame.entry {
                let next_partial = k[frame.next_idx];
                for (idx, e) in entry.records.iter().enumerate() {
                    if !e.is_null() && e.partial() == next_partial {
                        return Some(CacheHit {
                            slot: frame.slot,
                            entry: entry.clone(),
                            idx,
                        });
                    }
                }
            }
        }
        None
    }

    fn invalidate(&self, hit: &CacheHit) {
        self.invalidate_slot(&hit.slot, &hit.entry);
    }

    fn log_statistics(&self) {
        if !log::log_enabled!(log::Level::Info) {
            return;
        }
        let mut per_depth = std::collections::BTreeMap::new();
        let mut entries = 0u64;
        let nodes = self.node_queue.lock().clone();
        for node in &nodes {
            for item in node.records.iter() {
                if let Some(e) = item.value().entry.load() {
                    *per_depth.entry(e.depth).or_insert(0u64) += 1;
                    entries += e.records.len() as u64;
                }
            }
        }
        let consumed = self.cache_size_mb as f64 - self.free.remain() as f64 / MB as f64;
        info!(
            "[index cache/radix] size={} MB consumed={:.3} MB trie_nodes={} cached_entries={}",
            self.cache_size_mb,
            consumed,
            nodes.len(),
            entries
        );
        for (depth, cnt) in per_depth {
            info!("  depth={} pages={}", depth, cnt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{int_to_key, key_add};
    use crate::node::{InternalEntry, NodeType};

    fn page_with_children(k: &Key, partial_len: usize, depth: usize, partials: &[u8]) -> InternalPage {
        let mut page = InternalPage::new(
            k,
            partial_len,
            depth,
            NodeType::for_count(partials.len().max(2)),
            GlobalAddress::NULL,
        );
        for (i, &p) in partials.iter().enumerate() {
            page.records[i] =
                InternalEntry::new_leaf(p, 34, GlobalAddress::new(0, 0x1000 + 0x100 * i as u64));
        }
        page
    }

    #[test]
    fn insert_then_lookup_via_trie() {
        let cache = RadixCache::new(16);
        let k = int_to_key(0x0101010101010107);
        let page = page_with_children(&k, 0, 8, &[0x07, 0x08]);
        cache.add(&k, &page, GlobalAddress::new(1, 0x2000));

        let hit = cache.lookup(&k).expect("cached");
        assert_eq!(hit.idx, 0);
        assert_eq!(hit.entry.addr, GlobalAddress::new(1, 0x2000));

        let sibling = key_add(&k, 1);
        assert_eq!(cache.lookup(&sibling).expect("same page").idx, 1);
        assert!(cache.lookup(&int_to_key(0x0202020202020202)).is_none());
    }

    #[test]
    fn deeper_pages_shadow_shallower_ones() {
        let cache = RadixCache::new(16);
        let k = int_to_key(0x0101010101010107);
        // a page at depth 4 covering partial 0x01 on the path
        let shallow = page_with_children(&k, 0, 4, &[0x01]);
        cache.add(&k, &shallow, GlobalAddress::new(1, 0x1000));
        // and a deeper page resolving the final byte
        let deep = page_with_children(&k, 0, 8, &[0x07]);
        cache.add(&k, &deep, GlobalAddress::new(1, 0x2000));

        let hit = cache.lookup(&k).expect("cached");
        assert_eq!(hit.entry.addr, GlobalAddress::new(1, 0x2000));

        // invalidating the deep snapshot falls back to the shallow one
        cache.invalidate(&hit);
        let hit = cache.lookup(&k).expect("fallback");
        assert_eq!(hit.entry.addr, GlobalAddress::new(1, 0x1000));
    }

    #[test]
    fn diverging_prefixes_split_trie_headers() {
        let cache = RadixCache::new(16);
        let k1 = int_to_key(0x0101010101010107);
        let k2 = int_to_key(0x0101020201010107);
        cache.add(
            &k1,
            &page_with_children(&k1, 0, 8, &[0x07]),
            GlobalAddress::new(1, 0x2000),
        );
        cache.add(
            &k2,
            &page_with_children(&k2, 0, 8, &[0x07]),
            GlobalAddress::new(1, 0x3000),
        );

        assert_eq!(cache.lookup(&k1).expect("k1").entry.addr, GlobalAddress::new(1, 0x2000));
        assert_eq!(cache.lookup(&k2).expect("k2").entry.addr, GlobalAddress::new(1, 0x3000));
    }

    #[test]
    fn exhausted_budget_rebuilds_when_nothing_evictable() {
        let cache = RadixCache::new(0);
        let k = int_to_key(0x0101010101010107);
        cache.add(
            &k,
            &page_with_children(&k, 0, 8, &[0x07]),
            GlobalAddress::new(1, 0x2000),
        );
        // everything evictable was dropped (or the trie was rebuilt);
        // either way the budget recovered and lookups simply miss
        assert!(cache.free.remain() >= 0);
        assert!(cache.lookup(&k).is_none());
    }

    #[test]
    fn mid_path_page_is_found_from_its_prefix() {
        let cache = RadixCache::new(16);
        let k = int_to_key(0x0102030400000000);
        // page at depth 3 with compressed path byte 0x03, children on 0x04
        let page = page_with_children(&k, 1, 3, &[0x04]);
        cache.add(&k, &page, GlobalAddress::new(0, 0x5000));
        let hit = cache.lookup(&k).expect("prefix path");
        assert_eq!(hit.entry.records[hit.idx].partial(), 0x04);
        assert_eq!(hit.entry.depth as usize, 4);
    }
}
