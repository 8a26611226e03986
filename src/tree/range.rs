//! Range queries: level-by-level batched reads over the key interval.
//!
//! The scan seeds itself from the cache (or from `search_entries` walking
//! down to the interval's common-prefix depth), then repeatedly
//! batch-reads every surviving entry — deduplicated by address and
//! grouped per destination node — classifying each page's borders as
//! inside/border/outside and narrowing `[from, to)` with substituted
//! header bytes for children that stay in range. Coroutines are not used;
//! the calling thread polls each batch synchronously.

use std::collections::{BTreeMap, HashSet};

use futures::executor::block_on;

use crate::addr::GlobalAddress;
use crate::cache::CacheHit;
use crate::config::LEAF_SIZE;
use crate::coro::CoroSink;
use crate::error::TreeResult;
use crate::key::{
    get_partial, key_sub, longest_common_prefix, remake_prefix, Key, Value,
};
use crate::node::{InternalEntry, InternalPage, Leaf, ENTRY_ARRAY_OFFSET};
use crate::tree::Tree;

/// Where a scan boundary sits relative to a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bound {
    Inside,
    Border,
    Outside,
}

/// One surviving entry of the current scan level. `from`/`to` are the
/// inclusive key interval still relevant beneath it.
#[derive(Clone)]
pub(crate) struct ScanContext {
    pub e: InternalEntry,
    pub e_ptr: GlobalAddress,
    pub depth: usize,
    pub from_cache: bool,
    pub hit: Option<CacheHit>,
    pub from: Key,
    pub to: Key,
    pub l_state: Bound,
    pub r_state: Bound,
}

impl Tree {
    /// All key-value pairs in `[from, to)`, ordered.
    pub fn range_query(&self, from: &Key, to: &Key) -> TreeResult<BTreeMap<Key, Value>> {
        block_on(self.range_query_inner(from, to))
    }

    pub(crate) async fn range_query_inner(
        &self,
        from: &Key,
        to: &Key,
    ) -> TreeResult<BTreeMap<Key, Value>> {
        let mut ret = BTreeMap::new();
        if to <= from {
            return Ok(ret);
        }
        let to_incl = key_sub(to, 1);

        let mut survivors: Vec<ScanContext> = Vec::new();
        if let Some(cache) = &self.cache {
            let mut range_hits = Vec::new();
            cache.lookup_range(from, to, &mut range_hits);
            for rc in range_hits {
                survivors.push(ScanContext {
                    e: rc.e,
                    e_ptr: rc.e_ptr,
                    depth: rc.depth,
                    from_cache: true,
                    l_state: if rc.from <= *from { Bound::Border } else { Bound::Inside },
                    r_state: if rc.to >= to_incl { Bound::Border } else { Bound::Inside },
                    from: rc.from.max(*from),
                    to: rc.to.min(to_incl),
                    hit: Some(rc.hit),
                });
            }
        }
        if survivors.is_empty() {
            let target_depth = longest_common_prefix(from, &to_incl, 0);
            self.search_entries(from, &to_incl, target_depth, &mut survivors)
                .await?;
        }

        let mut tokens: HashSet<u64> = HashSet::new();
        loop {
            if survivors.is_empty() {
                return Ok(ret);
            }

            // 1. deduplicate this level by target address, then batch-read
            let mut level: Vec<ScanContext> = Vec::new();
            let mut reqs: Vec<(GlobalAddress, usize)> = Vec::new();
            for s in survivors.drain(..) {
                if !tokens.insert(s.e.addr().to_raw()) {
                    continue;
                }
                let size = if s.e.is_leaf() {
                    s.e.kv_len().max(LEAF_SIZE)
                } else if s.from_cache {
                    // a cached class claim may be stale: read the full page
                    ENTRY_ARRAY_OFFSET as usize + 256 * 8
                } else {
                    ENTRY_ARRAY_OFFSET as usize + s.e.node_type().capacity() * 8
                };
                reqs.push((s.e.addr(), size));
                level.push(s);
            }
            let bufs = self.dsm.read_batches_sync(&reqs)?;

            // 2. leaves are recorded, nodes spawn the next level
            for (i, s) in level.into_iter().enumerate() {
                if s.e.is_leaf() {
                    let leaf = Leaf::from_bytes(&bufs[i]);
                    if !leaf.is_valid(s.e_ptr, s.from_cache) {
                        self.requeue_via_entry(s, &mut tokens, &mut survivors).await?;
                        continue;
                    }
                    if !leaf.is_consistent() {
                        // torn read: retry this leaf next level
                        tokens.remove(&s.e.addr().to_raw());
                        survivors.push(s.clone());
                    }
                    if &leaf.key >= from && &leaf.key < to {
                        ret.insert(leaf.key, leaf.value);
                    }
                } else {
                    let page = InternalPage::from_bytes(&bufs[i]);
                    if !page.is_valid(s.e_ptr, s.depth + 1, s.from_cache) {
                        self.requeue_via_entry(s, &mut tokens, &mut survivors).await?;
                        continue;
                    }
                    self.range_query_on_page(&page, &s, &mut survivors);
                }
            }
        }
    }

    /// A survivor turned out stale: invalidate its cache hit, re-read the
    /// entry it came from and push the refreshed context.
    async fn requeue_via_entry(
        &self,
        s: ScanContext,
        tokens: &mut HashSet<u64>,
        survivors: &mut Vec<ScanContext>,
    ) -> TreeResult<()> {
        self.invalidate_scan_hit(&s);
        let e = self.read_entry(s.e_ptr, None).await?;
        tokens.remove(&s.e.addr().to_raw());
        survivors.push(ScanContext {
            e,
            from_cache: false,
            hit: None,
            ..s
        });
        Ok(())
    }

    fn invalidate_scan_hit(&self, s: &ScanContext) {
        self.invalidate_hit(s.from_cache, &s.hit);
    }

    /// Classify a page against the scan interval and emit its in-range
    /// children with narrowed intervals.
    pub(crate) fn range_query_on_page(
        &self,
        page: &InternalPage,
        s: &ScanContext,
        out: &mut Vec<ScanContext>,
    ) {
        let hdr = page.hdr;
        if let Some(cache) = &self.cache {
            if s.depth == (hdr.depth as usize).saturating_sub(1) {
                cache.add(&s.from, page, s.e.addr().add(ENTRY_ARRAY_OFFSET));
            }
        }

        // compressed path first: a border boundary either keeps tracking
        // the path, or resolves to fully inside / fully outside
        let mut l_state = s.l_state;
        let mut r_state = s.r_state;
        if l_state == Bound::Border {
            let j = (0..hdr.partial_len as usize)
                .find(|&j| hdr.partial[j] != get_partial(&s.from, hdr.depth as usize + j));
            l_state = match j {
                None => Bound::Border,
                Some(j) if hdr.partial[j] > get_partial(&s.from, hdr.depth as usize + j) => {
                    Bound::Inside
                }
                Some(_) => Bound::Outside,
            };
        }
        if r_state == Bound::Border {
            let j = (0..hdr.partial_len as usize)
                .find(|&j| hdr.partial[j] != get_partial(&s.to, hdr.depth as usize + j));
            r_state = match j {
                None => Bound::Border,
                Some(j) if hdr.partial[j] < get_partial(&s.to, hdr.depth as usize + j) => {
                    Bound::Inside
                }
                Some(_) => Bound::Outside,
            };
        }
        if l_state == Bound::Outside || r_state == Bound::Outside {
            return;
        }

        let entry_depth = hdr.depth as usize + hdr.partial_len as usize;
        let from_partial = get_partial(&s.from, entry_depth);
        let to_partial = get_partial(&s.to, entry_depth);
        let max_num = hdr.node_type().capacity();

        for (j, e) in page.records[..max_num].iter().enumerate() {
            if e.is_null() {
                continue;
            }
            let mut e_l = l_state;
            let mut e_r = r_state;
            if e_l == Bound::Border {
                e_l = match e.partial().cmp(&from_partial) {
                    std::cmp::Ordering::Equal => Bound::Border,
                    std::cmp::Ordering::Greater => Bound::Inside,
                    std::cmp::Ordering::Less => Bound::Outside,
                };
            }
            if e_r == Bound::Border {
                e_r = match e.partial().cmp(&to_partial) {
                    std::cmp::Ordering::Equal => Bound::Border,
                    std::cmp::Ordering::Less => Bound::Inside,
                    std::cmp::Ordering::Greater => Bound::Outside,
                };
            }
            if e_l == Bound::Outside || e_r == Bound::Outside {
                continue;
            }

            // a child fully inside inherits the widest interval its path
            // allows: substitute the header bytes and its own partial
            let mut next_from = s.from;
            let mut next_to = s.to;
            if e_l == Bound::Inside {
                for i in 0..hdr.partial_len as usize {
                    next_from = remake_prefix(&next_from, hdr.depth as usize + i, hdr.partial[i]);
                }
                next_from = remake_prefix(&next_from, entry_depth, e.partial());
            }
            if e_r == Bound::Inside {
                for i in 0..hdr.partial_len as usize {
                    next_to = remake_prefix(&next_to, hdr.depth as usize + i, hdr.partial[i]);
                }
                next_to = remake_prefix(&next_to, entry_depth, e.partial());
            }
            out.push(ScanContext {
                e: *e,
                e_ptr: s.e.addr().add(ENTRY_ARRAY_OFFSET + 8 * j as u64),
                depth: entry_depth,
                from_cache: false,
                hit: None,
                from: next_from,
                to: next_to,
                l_state: e_l,
                r_state: e_r,
            });
        }
    }

    /// Seed a scan: walk from the cache hit (or root) towards
    /// `target_depth`, collecting the entry (or page) found there.
    pub(crate) async fn search_entries(
        &self,
        from: &Key,
        to: &Key,
        target_depth: usize,
        out: &mut Vec<ScanContext>,
    ) -> TreeResult<()> {
        let tid = self.dsm.my_thread_id();
        let stats = self.telemetry.thread(tid);
        let sink: Option<&CoroSink> = None;

        let mut from_cache = false;
        let mut cache_hit: Option<CacheHit> = None;
        let mut p_ptr = self.root_ptr_ptr();
        let mut p = InternalEntry::NULL;
        let mut depth = 0usize;
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(from) {
                from_cache = true;
                p_ptr = hit.entry_ptr();
                p = hit.entry.records[hit.idx];
                depth = hit.entry.depth as usize;
                cache_hit = Some(hit);
            }
        }
        if !from_cache {
            p = self.get_root_ptr(sink).await?;
        }
        depth += 1;
        let cache_depth = depth;

        loop {
            // 1. nothing on this path
            if p.is_null() {
                break;
            }

            // 2. reached the fan-out depth: scan from this entry
            if depth == target_depth {
                out.push(ScanContext {
                    e: p,
                    e_ptr: p_ptr,
                    depth: depth - 1,
                    from_cache,
                    hit: cache_hit.clone(),
                    from: *from,
                    to: *to,
                    l_state: Bound::Border,
                    r_state: Bound::Border,
                });
                break;
            }
            if p.is_leaf() {
                break;
            }

            // 3. descend one node
            let (page, type_correct, valid) = self
                .read_node(&mut p, p_ptr, depth, from_cache, sink, tid)
                .await?;
            if !valid {
                self.invalidate_hit(from_cache, &cache_hit);
                p = self.read_entry(p_ptr, sink).await?;
                from_cache = false;
                continue;
            }

            let hdr = page.hdr;
            if from_cache && !type_correct {
                self.invalidate_hit(from_cache, &cache_hit);
            }

            let mut diverged = false;
            for i in 0..hdr.partial_len as usize {
                if get_partial(from, hdr.depth as usize + i) != hdr.partial[i] {
                    diverged = true;
                    break;
                }
                if hdr.depth as usize + i + 1 == target_depth {
                    // the target depth lands inside this compressed path
                    let ctx = ScanContext {
                        e: p,
                        e_ptr: p_ptr,
                        depth: depth - 1,
                        from_cache,
                        hit: cache_hit.clone(),
                        from: *from,
                        to: *to,
                        l_state: Bound::Border,
                        r_state: Bound::Border,
                    };
                    self.range_query_on_page(&page, &ctx, out);
                    diverged = true;
                    break;
                }
            }
            if diverged {
                break;
            }
            depth = hdr.depth as usize + hdr.partial_len as usize;

            let next_partial = get_partial(from, depth);
            let max_num = p.node_type().capacity();
            let matched = page.records[..max_num]
                .iter()
                .enumerate()
                .find(|(_, e)| !e.is_null() && e.partial() == next_partial);
            match matched {
                Some((i, e)) => {
                    p_ptr = p.addr().add(ENTRY_ARRAY_OFFSET + 8 * i as u64);
                    p = *e;
                    from_cache = false;
                    depth += 1;
                }
                None => break,
            }
        }

        if self.cache.is_some() {
            let hit = if cache_depth == 1 {
                0.0
            } else {
                cache_depth as f64 / depth.max(1) as f64
            };
            stats.cache_access(hit);
        }
        Ok(())
    }

}
