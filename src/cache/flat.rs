//! Flat cache variant: byte prefix → entry snapshot in a concurrent hash
//! map, with the insertion queue doubling as a FIFO/second-chance
//! eviction list.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use log::info;

use crate::addr::GlobalAddress;
use crate::cache::{
    cache_prefix, probe_prefix, CacheEntry, CacheHit, EntrySlot, EpochQueue, IndexCache,
};
use crate::config::{KEY_LEN, MB};
use crate::key::Key;
use crate::node::InternalPage;

pub struct FlatCache {
    cache_size_mb: usize,
    free_size: AtomicI64,
    map: DashMap<Vec<u8>, Arc<EntrySlot>>,
    eviction_list: SegQueue<(Arc<EntrySlot>, Arc<CacheEntry>)>,
    entry_gc: EpochQueue<Arc<CacheEntry>>,
}

impl FlatCache {
    pub fn new(cache_size_mb: usize) -> Self {
        Self {
            cache_size_mb,
            free_size: AtomicI64::new((cache_size_mb as u64 * MB) as i64),
            map: DashMap::new(),
            eviction_list: SegQueue::new(),
            entry_gc: EpochQueue::new(),
        }
    }

    fn insert_entry(&self, prefix: Vec<u8>, new_entry: Arc<CacheEntry>) {
        let slot = self
            .map
            .entry(prefix)
            .or_insert_with(|| Arc::new(EntrySlot::empty()))
            .value()
            .clone();
        let old = slot.load();
        if !slot.replace_if(old.as_ref(), Some(new_entry.clone())) {
            return; // lost the publish race; the racer's snapshot stands
        }
        self.free_size
            .fetch_sub((8 + new_entry.content_size()) as i64, Ordering::Relaxed);
        match old {
            Some(old_entry) => {
                self.free_size
                    .fetch_add(old_entry.content_size() as i64, Ordering::Relaxed);
                self.entry_gc.defer(old_entry);
            }
            None => {
                self.free_size.fetch_sub(KEY_LEN as i64, Ordering::Relaxed);
            }
        }
        self.eviction_list.push((slot, new_entry));
    }

    fn invalidate_slot(&self, slot: &Arc<EntrySlot>, entry: &Arc<CacheEntry>) {
        if slot.replace_if(Some(entry), None) {
            self.free_size.fetch_add(
                (8 + entry.content_size() + KEY_LEN) as i64,
                Ordering::Relaxed,
            );
            self.entry_gc.defer(entry.clone());
        }
    }

    fn evict(&self) {
        while self.free_size.load(Ordering::Relaxed) < 0 {
            match self.eviction_list.pop() {
                Some((slot, entry)) => {
                    // second chance: only drop a snapshot still in place
                    let current = slot.load();
                    if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, &entry)) {
                        self.invalidate_slot(&slot, &entry);
                    }
                }
                None => break,
            }
        }
    }
}

impl IndexCache for FlatCache {
    fn add(&self, k: &Key, page: &InternalPage, entry_array_addr: GlobalAddress) {
        let prefix = cache_prefix(k, page);
        let entry = Arc::new(CacheEntry::from_page(page, entry_array_addr));
        self.insert_entry(prefix, entry);
        if self.free_size.load(Ordering::Relaxed) < 0 {
            self.evict();
        }
    }

    fn lookup(&self, k: &Key) -> Option<CacheHit> {
        let mut prefix = probe_prefix(k);
        let mut last_byte = k[KEY_LEN - 1];
        loop {
            let slot = self.map.get(&prefix).map(|s| s.value().clone());
            if let Some(slot) = slot {
                if let Some(entry) = slot.load() {
                    for (idx, e) in entry.records.iter().enumerate() {
                        if !e.is_null() && e.partial() == last_byte {
                            return Some(CacheHit { slot, entry: entry.clone(), idx });
                        }
                    }
                }
            }
            // no match at this depth: retry one prefix byte shorter
            match prefix.pop() {
                Some(b) => last_byte = b,
                None => return None,
            }
        }
    }

    fn invalidate(&self, hit: &CacheHit) {
        self.invalidate_slot(&hit.slot, &hit.entry);
    }

    fn log_statistics(&self) {
        if !log::log_enabled!(log::Level::Info) {
            return;
        }
        let free = self.free_size.load(Ordering::Relaxed);
        let consumed = self.cache_size_mb as f64 - free as f64 / MB as f64;
        let mut per_depth = std::collections::BTreeMap::new();
        let mut entries = 0u64;
        for item in self.map.iter() {
            if let Some(e) = item.value().load() {
                *per_depth.entry(e.depth).or_insert(0u64) += 1;
                entries += e.records.len() as u64;
            }
        }
        info!(
            "[index cache/flat] size={} MB consumed={:.3} MB cached_entries={}",
            self.cache_size_mb, consumed, entries
        );
        for (depth, cnt) in per_depth {
            info!("  depth={} pages={}", depth, cnt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RangeCacheHit;
    use crate::key::{int_to_key, key_add};
    use crate::node::{InternalEntry, NodeType};

    fn page_with_children(k: &Key, depth: usize, partials: &[u8]) -> InternalPage {
        let mut page = InternalPage::new(
            k,
            0,
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
    fn lookup_finds_deepest_then_falls_back() {
        let cache = FlatCache::new(16);
        let k = int_to_key(0x0101010101010107);
        // page at depth 8 knows partial 0x07
        let page = page_with_children(&k, 8, &[0x07, 0x08]);
        cache.add(&k, &page, GlobalAddress::new(1, 0x2000));

        let hit = cache.lookup(&k).expect("cached path");
        assert_eq!(hit.idx, 0);
        assert_eq!(hit.entry.addr, GlobalAddress::new(1, 0x2000));
        assert_eq!(hit.entry_ptr(), GlobalAddress::new(1, 0x2000));

        // sibling resolved through the same page
        let sibling = key_add(&k, 1);
        let hit = cache.lookup(&sibling).expect("same page");
        assert_eq!(hit.idx, 1);

        // unrelated keys miss
        assert!(cache.lookup(&int_to_key(0x0202020202020202)).is_none());
    }

    #[test]
    fn invalidation_is_first_wins_and_lookup_stops_hitting() {
        let cache = FlatCache::new(16);
        let k = int_to_key(0x0101010101010107);
        let page = page_with_children(&k, 8, &[0x07]);
        cache.add(&k, &page, GlobalAddress::new(1, 0x2000));

        let hit = cache.lookup(&k).unwrap();
        cache.invalidate(&hit);
        assert!(cache.lookup(&k).is_none());
        // the racer observing the same snapshot skips
        assert!(!hit.slot.replace_if(Some(&hit.entry), None));
    }

    #[test]
    fn replacement_defers_the_old_snapshot() {
        let cache = FlatCache::new(16);
        let k = int_to_key(0x0101010101010107);
        cache.add(
            &k,
            &page_with_children(&k, 8, &[0x07]),
            GlobalAddress::new(1, 0x2000),
        );
        cache.add(
            &k,
            &page_with_children(&k, 8, &[0x07, 0x08]),
            GlobalAddress::new(1, 0x3000),
        );
        let hit = cache.lookup(&k).unwrap();
        assert_eq!(hit.entry.addr, GlobalAddress::new(1, 0x3000));
        assert_eq!(cache.entry_gc.len(), 1);
    }

    #[test]
    fn tiny_budget_forces_eviction_until_nonnegative() {
        let cache = FlatCache::new(0); // zero budget: every add must evict
        for i in 0..64u64 {
            let k = int_to_key(0x0100000000000000 + i * 0x100);
            let page = page_with_children(&k, 8, &[(i & 0xff) as u8]);
            cache.add(&k, &page, GlobalAddress::new(0, 0x1000 + i * 0x100));
        }
        assert!(cache.free_size.load(Ordering::Relaxed) >= 0);
    }

    #[test]
    fn range_probe_reports_span_per_hit() {
        let cache = FlatCache::new(16);
        let k = int_to_key(0x0101010101010101);
        let page = page_with_children(&k, 8, &[0x01, 0x02, 0x03]);
        cache.add(&k, &page, GlobalAddress::new(1, 0x2000));

        let mut out: Vec<RangeCacheHit> = Vec::new();
        cache.lookup_range(&k, &int_to_key(0x0101010101010104), &mut out);
        assert_eq!(out.len(), 3);
        for hit in &out {
            assert_eq!(hit.from, hit.to); // leaf entries cover one key
        }
    }
}
