//! The concurrent adaptive radix tree over disaggregated memory.
//!
//! All index logic runs on the client: traversal walks remote pages with
//! one-sided reads, every structural change is published with a single
//! 64-bit CAS, and every staleness signal (reverse-pointer mismatch,
//! invalid leaf, tombstoned node, undersized node-type claim) is recovered
//! by invalidating the cache hit that led there and re-reading the parent
//! entry. Contended spots retry locally from the observed value; the
//! out-of-place leaf-update path additionally restarts from the root after
//! [`MAX_RETRY_BEFORE_RESTART`] failed CASes.

mod range;
mod split;
mod update;

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::executor::{block_on, LocalPool};
use futures::task::LocalSpawnExt;
use log::warn;

use crate::addr::GlobalAddress;
use crate::cache::{CacheHit, FlatCache, IndexCache, RadixCache};
use crate::config::{
    CacheVariant, TreeConfig, LEAF_SIZE, MAX_CORO_NUM, MAX_RETRY_BEFORE_RESTART, ROOT_PTR_OFFSET,
};
use crate::coro::{self, CoroRuntime, CoroSink};
use crate::dsm::Dsm;
use crate::error::{TreeError, TreeResult};
use crate::key::{get_partial, longest_common_prefix, Key, Value};
use crate::lock_table::LocalLockTable;
use crate::node::{InternalEntry, InternalPage, ENTRY_ARRAY_OFFSET, NODE_TYPE_MASK};
use crate::telemetry::{RetryReason, Telemetry, TreeStats};

/// Insert behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOpts {
    /// The key is expected to exist; rewrite a differing value.
    pub update: bool,
    /// Bulk-load mode: never rewrite an existing key.
    pub load: bool,
}

/// One client request, as produced by a [`RequestGen`].
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub op: RequestOp,
    pub k: Key,
    pub v: Value,
    pub range_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOp {
    Search,
    Insert,
    Update,
    Scan,
}

/// Produces the request stream of one coroutine; `None` ends the stream.
pub trait RequestGen {
    fn next(&mut self) -> Option<Request>;
}

/// Tree handle; share it across threads behind an `Arc`.
pub struct Tree {
    pub(crate) dsm: Arc<Dsm>,
    pub(crate) config: TreeConfig,
    pub(crate) cache: Option<Arc<dyn IndexCache>>,
    pub(crate) lock_table: LocalLockTable,
    pub(crate) telemetry: Arc<Telemetry>,
    root_ptr_ptr: GlobalAddress,
    need_stop: AtomicBool,
}

impl Tree {
    /// Open (and, on client node 0, reset) the tree stored under
    /// `tree_id` in the pool behind `dsm`.
    pub fn new(dsm: Arc<Dsm>, tree_id: u16, config: TreeConfig) -> TreeResult<Arc<Self>> {
        let needs_on_chip =
            (config.in_place_update && !config.embedded_lock) || config.rowex;
        if needs_on_chip && dsm.config().on_chip_lock_num() == 0 {
            return Err(TreeError::Config(
                "on-chip leaf locks require a non-zero on_chip_kb".into(),
            ));
        }
        let cache: Option<Arc<dyn IndexCache>> = if config.enable_cache {
            Some(match config.cache_variant {
                CacheVariant::Radix => Arc::new(RadixCache::new(config.cache_size_mb)),
                CacheVariant::Flat => Arc::new(FlatCache::new(config.cache_size_mb)),
            })
        } else {
            None
        };
        let tree = Arc::new(Self {
            lock_table: LocalLockTable::new(config.local_lock_num),
            cache,
            telemetry: Arc::new(Telemetry::new()),
            root_ptr_ptr: GlobalAddress::new(0, ROOT_PTR_OFFSET + 8 * tree_id as u64),
            need_stop: AtomicBool::new(false),
            dsm,
            config,
        });
        block_on(tree.init_root())?;
        Ok(tree)
    }

    /// Reset a leftover root entry so a fresh tree starts empty; only the
    /// first client node does this, racing CASes chase the observed value.
    async fn init_root(&self) -> TreeResult<()> {
        let mut root = self.read_entry(self.root_ptr_ptr, None).await?;
        if self.dsm.client_node_id() == 0 {
            while !root.is_null() {
                let (swapped, observed) = self
                    .dsm
                    .cas_sync(
                        self.root_ptr_ptr,
                        root.to_raw(),
                        InternalEntry::NULL.to_raw(),
                        None,
                    )
                    .await?;
                if swapped {
                    break;
                }
                root = InternalEntry::from_raw(observed);
            }
        }
        Ok(())
    }

    pub(crate) fn root_ptr_ptr(&self) -> GlobalAddress {
        self.root_ptr_ptr
    }

    pub(crate) async fn read_entry(
        &self,
        ptr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<InternalEntry> {
        let mut buf = [0u8; 8];
        self.dsm.read_sync(&mut buf, ptr, sink).await?;
        Ok(InternalEntry::from_raw(u64::from_le_bytes(buf)))
    }

    pub(crate) async fn get_root_ptr(&self, sink: Option<&CoroSink>) -> TreeResult<InternalEntry> {
        self.read_entry(self.root_ptr_ptr, sink).await
    }

    fn invalidate_hit(&self, from_cache: bool, hit: &Option<CacheHit>) {
        if !from_cache {
            return;
        }
        if let (Some(cache), Some(hit)) = (&self.cache, hit) {
            cache.invalidate(hit);
        }
    }

    // ---- public API ----

    pub fn insert(&self, k: &Key, v: Value, opts: &InsertOpts) -> TreeResult<()> {
        block_on(self.insert_with(k, v, opts, None))
    }

    pub fn search(&self, k: &Key) -> TreeResult<Option<Value>> {
        block_on(self.search_with(k, None))
    }

    /// Ask running coroutine workers to stop at their next request boundary.
    pub fn stop(&self) {
        self.need_stop.store(true, Ordering::Release);
    }

    pub fn statistics(&self) -> TreeStats {
        if let Some(cache) = &self.cache {
            cache.log_statistics();
        }
        self.telemetry.log_report();
        self.telemetry.summary()
    }

    pub fn clear_statistics(&self) {
        self.telemetry.reset();
    }

    // ---- insert ----

    pub async fn insert_with(
        &self,
        k: &Key,
        v: Value,
        opts: &InsertOpts,
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        let tid = self.dsm.my_thread_id();
        let stats = self.telemetry.thread(tid);

        let mut lock_res = (false, false);
        let mut write_handover = false;
        if self.config.write_combining {
            lock_res = self
                .lock_table
                .acquire_local_write_lock(k, v, sink)
                .await;
            write_handover = lock_res.0 && !lock_res.1;
        }
        stats.try_write_op.fetch_add(1, Ordering::Relaxed);

        let result = if write_handover {
            stats.write_handover_num.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.insert_traverse(k, v, opts, sink, tid).await
        };

        if self.config.write_combining {
            self.lock_table.release_local_write_lock(k, lock_res);
        }
        result
    }

    async fn insert_traverse(
        &self,
        k: &Key,
        v: Value,
        opts: &InsertOpts,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<()> {
        let stats = self.telemetry.thread(tid);
        let mut v = v;

        // cache probe; a hit resumes the traversal mid-tree
        let mut from_cache = false;
        let mut cache_hit: Option<CacheHit> = None;
        let mut p_ptr = self.root_ptr_ptr;
        let mut p = InternalEntry::NULL;
        let mut node_ptr = self.root_ptr_ptr;
        let mut depth = 0usize;
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(k) {
                from_cache = true;
                p_ptr = hit.entry_ptr();
                p = hit.entry.records[hit.idx];
                node_ptr = hit.entry.addr;
                depth = hit.entry.depth as usize;
                cache_hit = Some(hit);
            }
        }
        if !from_cache {
            p = self.get_root_ptr(sink).await?;
        }
        depth += 1; // the partial byte in the entry is already matched
        let mut cache_depth = depth;

        if self.config.rowex && !opts.update {
            self.lock_node(node_ptr, sink).await?;
        }

        let mut leaf_addr = GlobalAddress::NULL;
        let mut retry_flag = RetryReason::FirstTry;
        let mut cas_leaf_retries = 0usize;

        'next: loop {
            stats.retry(retry_flag);

            // 1. empty slot: publish a fresh leaf
            if p.is_null() {
                let (swapped, observed) = self
                    .out_of_place_write_leaf(
                        k,
                        &mut v,
                        depth,
                        &mut leaf_addr,
                        get_partial(k, depth - 1),
                        p_ptr,
                        p,
                        sink,
                    )
                    .await?;
                if !swapped {
                    p = observed;
                    retry_flag = RetryReason::CasNull;
                    continue 'next;
                }
                break 'next;
            }

            // 2. leaf: update it or split it
            if p.is_leaf() {
                let leaf_len = p.kv_len().max(LEAF_SIZE);
                let (mut leaf, valid) = self
                    .read_leaf(p.addr(), leaf_len, p_ptr, from_cache, sink, tid)
                    .await?;
                if !valid {
                    self.invalidate_hit(from_cache, &cache_hit);
                    p = self.read_entry(p_ptr, sink).await?;
                    from_cache = false;
                    retry_flag = RetryReason::InvalidLeaf;
                    continue 'next;
                }

                if &leaf.key == k {
                    // 2.2 existing key
                    if opts.load {
                        break 'next;
                    }
                    if self.config.write_combining {
                        self.lock_table.get_combining_value(k, &mut v);
                    }
                    if leaf.value == v {
                        break 'next;
                    }
                    if self.config.in_place_update {
                        self.in_place_update_leaf(k, v, p.addr(), &mut leaf, sink, tid)
                            .await?;
                        break 'next;
                    }
                    let (swapped, observed) = self
                        .out_of_place_update_leaf(
                            k,
                            &mut v,
                            depth,
                            &mut leaf_addr,
                            p_ptr,
                            p,
                            sink,
                            !opts.update,
                        )
                        .await?;
                    self.invalidate_hit(from_cache, &cache_hit);
                    if !swapped {
                        stats.lock_fail.fetch_add(1, Ordering::Relaxed);
                        cas_leaf_retries += 1;
                        if cas_leaf_retries > MAX_RETRY_BEFORE_RESTART {
                            warn!("insert of {:?} restarting from root", k);
                            p_ptr = self.root_ptr_ptr;
                            p = self.get_root_ptr(sink).await?;
                            node_ptr = self.root_ptr_ptr;
                            depth = 1;
                            cache_depth = 1;
                        } else {
                            p = observed;
                        }
                        from_cache = false;
                        retry_flag = RetryReason::CasLeaf;
                        continue 'next;
                    }
                    break 'next;
                }

                // 2.3 new key under an existing leaf: merge into a node
                let partial_len = longest_common_prefix(&leaf.key, k, depth);
                let diff_partial = get_partial(&leaf.key, depth + partial_len);
                let (swapped, observed) = self
                    .out_of_place_write_node(
                        k,
                        &mut v,
                        depth,
                        &mut leaf_addr,
                        partial_len,
                        diff_partial,
                        p_ptr,
                        p,
                        sink,
                    )
                    .await?;
                if !swapped {
                    p = observed;
                    retry_flag = RetryReason::CasLeaf;
                    continue 'next;
                }
                break 'next;
            }

            // 3. internal node
            let (page, type_correct, valid) = self
                .read_node(&mut p, p_ptr, depth, from_cache, sink, tid)
                .await?;
            if !valid {
                self.invalidate_hit(from_cache, &cache_hit);
                p = self.read_entry(p_ptr, sink).await?;
                from_cache = false;
                retry_flag = RetryReason::InvalidNode;
                continue 'next;
            }

            let hdr = page.hdr;
            if let Some(cache) = &self.cache {
                if from_cache && !type_correct {
                    self.invalidate_hit(from_cache, &cache_hit);
                }
                if depth == hdr.depth as usize {
                    cache.add(k, &page, p.addr().add(ENTRY_ARRAY_OFFSET));
                }
            }

            // 3.2 compressed path; a mismatch splits above this node
            let mismatch = (0..hdr.partial_len as usize)
                .find(|&i| get_partial(k, hdr.depth as usize + i) != hdr.partial[i]);
            if let Some(i) = mismatch {
                // hdr.depth may lag behind a racing split; measure from our depth
                let partial_len = (hdr.depth as usize + i).saturating_sub(depth);
                let (swapped, observed) = self
                    .out_of_place_write_node(
                        k,
                        &mut v,
                        depth,
                        &mut leaf_addr,
                        partial_len,
                        hdr.partial[i],
                        p_ptr,
                        p,
                        sink,
                    )
                    .await?;
                if !swapped {
                    p = observed;
                    retry_flag = RetryReason::SplitHeader;
                    continue 'next;
                }
                self.invalidate_hit(from_cache, &cache_hit);
                // repair the displaced node's header; masked so a racing
                // type switch survives, and no completion is awaited
                let new_hdr = hdr.split(i);
                self.dsm.cas_mask(
                    p.addr().add(8),
                    hdr.to_bits(),
                    new_hdr.to_bits(),
                    !NODE_TYPE_MASK,
                )?;
                break 'next;
            }
            depth = hdr.depth as usize + hdr.partial_len as usize;

            if self.config.rowex && !opts.update {
                self.unlock_node(node_ptr, sink).await?;
            }
            node_ptr = p.addr().add(ENTRY_ARRAY_OFFSET);
            if self.config.rowex && !opts.update {
                self.lock_node(node_ptr, sink).await?;
            }

            // 3.3 matching slot first
            let max_num = p.node_type().capacity();
            let matched = page.records[..max_num]
                .iter()
                .enumerate()
                .find(|(_, e)| !e.is_null() && e.partial() == get_partial(k, depth));
            if let Some((i, e)) = matched {
                p_ptr = p.addr().add(ENTRY_ARRAY_OFFSET + 8 * i as u64);
                p = *e;
                from_cache = false;
                depth += 1;
                retry_flag = RetryReason::FindNext;
                continue 'next;
            }

            // then any empty slot
            for i in 0..max_num {
                if !page.records[i].is_null() {
                    continue;
                }
                let e_ptr = p.addr().add(ENTRY_ARRAY_OFFSET + 8 * i as u64);
                let (swapped, observed) = self
                    .out_of_place_write_leaf(
                        k,
                        &mut v,
                        depth + 1,
                        &mut leaf_addr,
                        get_partial(k, depth),
                        e_ptr,
                        InternalEntry::NULL,
                        sink,
                    )
                    .await?;
                if swapped {
                    break 'next;
                }
                if observed.partial() == get_partial(k, depth) {
                    // a racer claimed the slot for our partial: descend into it
                    p_ptr = e_ptr;
                    p = observed;
                    from_cache = false;
                    depth += 1;
                    retry_flag = RetryReason::CasEmpty;
                    continue 'next;
                }
            }

            // 3.4 full node: claim a slot beyond the declared class, then
            // switch the class to cover it
            if !cfg!(feature = "art") {
                // a 256-way node always has a matching or an empty slot
                unreachable!("full traversal of a 256-slot node");
            }
            let (grown, slot_id, observed) = self
                .insert_behind(
                    k,
                    &mut v,
                    depth + 1,
                    &mut leaf_addr,
                    get_partial(k, depth),
                    p.node_type(),
                    node_ptr,
                    sink,
                    tid,
                )
                .await?;
            if grown {
                let next_type = crate::node::NodeType::for_count(slot_id);
                self.cas_node_type(next_type, p_ptr, p, hdr, sink, tid).await?;
                self.invalidate_hit(from_cache, &cache_hit);
                break 'next;
            }
            p_ptr = node_ptr.add(8 * slot_id as u64);
            p = observed;
            from_cache = false;
            depth += 1;
            retry_flag = RetryReason::InsertBehindEmpty;
        }

        if self.config.rowex && !opts.update {
            self.unlock_node(node_ptr, sink).await?;
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

    // ---- search ----

    pub async fn search_with(
        &self,
        k: &Key,
        sink: Option<&CoroSink>,
    ) -> TreeResult<Option<Value>> {
        let tid = self.dsm.my_thread_id();
        let stats = self.telemetry.thread(tid);

        let mut lock_res = (false, false);
        let mut read_handover = false;
        if self.config.read_delegation {
            lock_res = self.lock_table.acquire_local_read_lock(k, sink).await;
            read_handover = lock_res.0 && !lock_res.1;
        }
        stats.try_read_op.fetch_add(1, Ordering::Relaxed);

        let mut found = false;
        let mut value = 0u64;
        let result = if read_handover {
            stats.read_handover_num.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            match self.search_traverse(k, sink, tid).await {
                Ok(Some(v)) => {
                    found = true;
                    value = v;
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };

        if self.config.read_delegation {
            // publish (winner) or adopt (loser) the outcome
            self.lock_table
                .release_local_read_lock(k, lock_res, &mut found, &mut value);
        }
        result.map(|()| found.then_some(value))
    }

    async fn search_traverse(
        &self,
        k: &Key,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<Option<Value>> {
        let stats = self.telemetry.thread(tid);

        let mut from_cache = false;
        let mut cache_hit: Option<CacheHit> = None;
        let mut p_ptr = self.root_ptr_ptr;
        let mut p = InternalEntry::NULL;
        let mut depth = 0usize;
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(k) {
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

        let mut retry_flag = RetryReason::FirstTry;
        let result = 'next: loop {
            stats.retry(retry_flag);

            // 1. nothing on this path
            if p.is_null() {
                break 'next None;
            }

            // 2. leaf: the answer if the key matches
            if p.is_leaf() {
                let leaf_len = p.kv_len().max(LEAF_SIZE);
                let (leaf, valid) = self
                    .read_leaf(p.addr(), leaf_len, p_ptr, from_cache, sink, tid)
                    .await?;
                if !valid {
                    self.invalidate_hit(from_cache, &cache_hit);
                    p = self.read_entry(p_ptr, sink).await?;
                    from_cache = false;
                    retry_flag = RetryReason::InvalidLeaf;
                    continue 'next;
                }
                break 'next (&leaf.key == k).then_some(leaf.value);
            }

            // 3. internal node
            let (page, type_correct, valid) = self
                .read_node(&mut p, p_ptr, depth, from_cache, sink, tid)
                .await?;
            if !valid {
                self.invalidate_hit(from_cache, &cache_hit);
                p = self.read_entry(p_ptr, sink).await?;
                from_cache = false;
                retry_flag = RetryReason::InvalidNode;
                continue 'next;
            }

            let hdr = page.hdr;
            if let Some(cache) = &self.cache {
                if from_cache && !type_correct {
                    self.invalidate_hit(from_cache, &cache_hit);
                }
                if depth == hdr.depth as usize {
                    cache.add(k, &page, p.addr().add(ENTRY_ARRAY_OFFSET));
                }
            }

            if !hdr.is_match(k) {
                break 'next None;
            }
            depth = hdr.depth as usize + hdr.partial_len as usize;

            let max_num = p.node_type().capacity();
            let next_partial = get_partial(k, depth);
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
                    retry_flag = RetryReason::FindNext;
                }
                None => break 'next None,
            }
        };

        if self.cache.is_some() {
            let hit = if cache_depth == 1 {
                0.0
            } else {
                cache_depth as f64 / depth.max(1) as f64
            };
            stats.cache_access(hit);
        }
        Ok(result)
    }

    // ---- shared page/leaf reads ----

    /// Read a leaf, repairing its reverse pointer opportunistically and
    /// re-reading until the checksum settles. Returns `(leaf, reachable)`.
    pub(crate) async fn read_leaf(
        &self,
        leaf_addr: GlobalAddress,
        leaf_len: usize,
        p_ptr: GlobalAddress,
        from_cache: bool,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<(crate::node::Leaf, bool)> {
        let stats = self.telemetry.thread(tid);
        stats.try_read_leaf.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; leaf_len];
        loop {
            self.dsm.read_sync(&mut buf, leaf_addr, sink).await?;
            let leaf = crate::node::Leaf::from_bytes(&buf);
            if !from_cache && leaf.rev_ptr != p_ptr {
                // fire-and-forget repair; a lost race is re-validated by
                // whoever reads the stale pointer next
                self.dsm.cas(leaf_addr, leaf.rev_ptr.to_raw(), p_ptr.to_raw())?;
            }
            if !leaf.is_valid(p_ptr, from_cache) {
                stats.leaf_cache_invalid.fetch_add(1, Ordering::Relaxed);
                return Ok((leaf, false));
            }
            if leaf.is_consistent() {
                return Ok((leaf, true));
            }
            stats.read_leaf_retry.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Read a node for the capacity its entry claims, extending the read
    /// when the header reveals a larger class. Updates `p`'s type bits in
    /// place; returns `(page, type_was_correct, traversable)`.
    pub(crate) async fn read_node(
        &self,
        p: &mut InternalEntry,
        p_ptr: GlobalAddress,
        depth: usize,
        from_cache: bool,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<(InternalPage, bool, bool)> {
        let stats = self.telemetry.thread(tid);
        let claimed = ENTRY_ARRAY_OFFSET as usize + p.node_type().capacity() * 8;
        let mut buf = vec![0u8; crate::config::PAGE_SIZE];
        self.dsm.read_sync(&mut buf[..claimed], p.addr(), sink).await?;
        let mut page = InternalPage::from_bytes(&buf[..claimed]);

        let hdr_type = page.hdr.node_type();
        stats.read_node_type[hdr_type.bits() as usize].fetch_add(1, Ordering::Relaxed);
        stats.try_read_node.fetch_add(1, Ordering::Relaxed);

        let mut type_correct = true;
        if hdr_type != p.node_type() {
            if hdr_type.capacity() > p.node_type().capacity() {
                stats.read_node_repair.fetch_add(1, Ordering::Relaxed);
                let full = ENTRY_ARRAY_OFFSET as usize + hdr_type.capacity() * 8;
                self.dsm
                    .read_sync(&mut buf[claimed..full], p.addr().add(claimed as u64), sink)
                    .await?;
                page = InternalPage::from_bytes(&buf[..full]);
            }
            p.set_node_type(hdr_type);
            type_correct = false;
        }

        if !from_cache && page.rev_ptr != p_ptr {
            self.dsm.cas(p.addr(), page.rev_ptr.to_raw(), p_ptr.to_raw())?;
        }
        let traversable = page.is_valid(p_ptr, depth, from_cache);
        Ok((page, type_correct, traversable))
    }

    // ---- coroutine driver ----

    /// Run `coro_cnt` cooperative workers on the calling thread, each
    /// consuming its own generator until the stream ends or [`Tree::stop`]
    /// is observed at a request boundary.
    pub fn run_coroutine<G, F>(self: Arc<Self>, gen_factory: F, coro_cnt: usize)
    where
        G: RequestGen + 'static,
        F: Fn(usize, usize) -> G,
    {
        assert!(coro_cnt <= MAX_CORO_NUM);
        let rt = CoroRuntime::new();
        let prev = coro::set_current(Some(rt.clone()));
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let finished = Rc::new(Cell::new(0usize));

        for coro_id in 0..coro_cnt {
            let mut gen = gen_factory(coro_id, coro_cnt);
            let sink = CoroSink::new(coro_id as u16, rt.clone());
            let tree = self.clone();
            let finished = finished.clone();
            spawner
                .spawn_local(async move {
                    let tid = tree.dsm.my_thread_id();
                    while !tree.need_stop.load(Ordering::Acquire) {
                        let Some(req) = gen.next() else { break };
                        let begin = Instant::now();
                        if let Err(e) = tree.execute(&req, Some(&sink)).await {
                            log::error!("coroutine {} request failed: {e}", sink.coro_id());
                            break;
                        }
                        tree.telemetry
                            .record_latency(tid, sink.coro_id(), begin.elapsed());
                    }
                    finished.set(finished.get() + 1);
                })
                .expect("spawn worker on local pool");
        }

        while finished.get() < coro_cnt {
            pool.run_until_stalled();
            rt.tick(&self.dsm);
        }
        coro::set_current(prev);
    }

    async fn execute(&self, req: &Request, sink: Option<&CoroSink>) -> TreeResult<()> {
        match req.op {
            RequestOp::Search => {
                self.search_with(&req.k, sink).await?;
            }
            RequestOp::Insert => {
                self.insert_with(&req.k, req.v, &InsertOpts::default(), sink)
                    .await?;
            }
            RequestOp::Update => {
                self.insert_with(
                    &req.k,
                    req.v,
                    &InsertOpts {
                        update: true,
                        load: false,
                    },
                    sink,
                )
                .await?;
            }
            RequestOp::Scan => {
                let to = crate::key::key_add(&req.k, req.range_size.min(255) as u8);
                self.range_query_inner(&req.k, &to).await?;
            }
        }
        Ok(())
    }
}
