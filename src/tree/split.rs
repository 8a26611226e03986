//! Structural writes: publishing leaves, splitting into chained
//! path-compressed nodes, insert-behind and node-class switching.

use crate::addr::GlobalAddress;
use crate::config::{ALLOC_ALIGN_PAGE_SIZE, H_PARTIAL_LEN_MAX, LEAF_SIZE};
use crate::coro::CoroSink;
use crate::error::TreeResult;
use crate::key::{get_partial, Key, Value};
use crate::node::{
    Header, InternalEntry, InternalPage, Leaf, NodeType, ENTRY_ARRAY_OFFSET, NODE_TYPE_MASK,
};
use crate::telemetry::RetryReason;
use crate::tree::Tree;

/// Leaf length advertised in entries; 0 would mean "too long to inline".
const LEAF_KV_LEN: u8 = if LEAF_SIZE < 128 { LEAF_SIZE as u8 } else { 0 };

impl Tree {
    /// Allocate + write a leaf (first attempt only), then publish it with
    /// a CAS on the parent entry. Returns `(swapped, observed_entry)`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn out_of_place_write_leaf(
        &self,
        k: &Key,
        v: &mut Value,
        _depth: usize,
        leaf_addr: &mut GlobalAddress,
        partial_key: u8,
        e_ptr: GlobalAddress,
        old_e: InternalEntry,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, InternalEntry)> {
        let mut unwritten = leaf_addr.is_null();
        if self.config.write_combining && self.lock_table.get_combining_value(k, v) {
            // a fresher combined value arrived: rewrite the leaf image
            unwritten = true;
        }
        if unwritten {
            if leaf_addr.is_null() {
                *leaf_addr = self.dsm.alloc(LEAF_SIZE)?;
            }
            let leaf = Leaf::new(*k, *v, e_ptr);
            self.dsm.write_sync(&leaf.to_bytes(), *leaf_addr, sink).await?;
        } else {
            // the leaf bytes are already remote; only its reverse pointer
            // moved with this retry
            self.dsm
                .write(&e_ptr.to_raw().to_le_bytes(), *leaf_addr)?;
        }

        let new_e = InternalEntry::new_leaf(partial_key, LEAF_KV_LEN, *leaf_addr);
        let (swapped, observed) = self
            .dsm
            .cas_sync(e_ptr, old_e.to_raw(), new_e.to_raw(), sink)
            .await?;
        Ok((swapped, InternalEntry::from_raw(observed)))
    }

    /// Merge a displaced child and a new leaf under freshly allocated
    /// node(s): a run of `partial_len` shared bytes becomes a chain of
    /// path-compressed pages, written in one doorbell batch and published
    /// with a single parent CAS. On failure the pages return to the local
    /// free list; on success the displaced child's reverse pointer is
    /// repaired to its new slot.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn out_of_place_write_node(
        &self,
        k: &Key,
        v: &mut Value,
        depth: usize,
        leaf_addr: &mut GlobalAddress,
        partial_len: usize,
        diff_partial: u8,
        e_ptr: GlobalAddress,
        old_e: InternalEntry,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, InternalEntry)> {
        let new_node_num = partial_len / (H_PARTIAL_LEN_MAX + 1) + 1;
        let node_addrs = self.dsm.alloc_pages(new_node_num)?;

        // the new leaf hangs off slot 1 of the deepest new node
        let leaf_e_ptr = node_addrs[new_node_num - 1].add(ENTRY_ARRAY_OFFSET + 8);
        let mut leaf_unwritten = leaf_addr.is_null();
        if self.config.write_combining && self.lock_table.get_combining_value(k, v) {
            leaf_unwritten = true;
        }
        let mut leaf_image = None;
        if leaf_unwritten {
            if leaf_addr.is_null() {
                *leaf_addr = self.dsm.alloc(LEAF_SIZE)?;
            }
            leaf_image = Some(Leaf::new(*k, *v, leaf_e_ptr));
        } else {
            self.dsm
                .write(&leaf_e_ptr.to_raw().to_le_bytes(), *leaf_addr)?;
        }

        let nodes_type = NodeType::for_count(2);
        let mut pages = Vec::with_capacity(new_node_num);
        let mut rev_ptr = e_ptr;
        let mut depth = depth;
        let mut partial_len = partial_len;
        for i in 0..new_node_num - 1 {
            let mut page = InternalPage::new(k, H_PARTIAL_LEN_MAX, depth, nodes_type, rev_ptr);
            page.records[0] = InternalEntry::new_node(
                get_partial(k, depth + H_PARTIAL_LEN_MAX),
                nodes_type,
                node_addrs[i + 1],
            );
            pages.push(page);
            rev_ptr = node_addrs[i].add(ENTRY_ARRAY_OFFSET);
            partial_len -= H_PARTIAL_LEN_MAX + 1;
            depth += H_PARTIAL_LEN_MAX + 1;
        }

        // deepest node holds the displaced child and the new leaf
        let mut last = InternalPage::new(k, partial_len, depth, nodes_type, rev_ptr);
        last.records[0] = InternalEntry::with_partial(diff_partial, old_e);
        last.records[1] =
            InternalEntry::new_leaf(get_partial(k, depth + partial_len), LEAF_KV_LEN, *leaf_addr);
        pages.push(last);

        let new_e = InternalEntry::new_node(old_e.partial(), nodes_type, node_addrs[0]);

        let cap = nodes_type.capacity();
        let mut writes: Vec<(Vec<u8>, GlobalAddress)> = pages
            .iter()
            .zip(&node_addrs)
            .map(|(page, addr)| (page.to_bytes(cap), *addr))
            .collect();
        if let Some(leaf) = &leaf_image {
            writes.push((leaf.to_bytes().to_vec(), *leaf_addr));
        }
        self.dsm.write_batches_sync(&writes, sink).await?;

        let (swapped, observed) = self
            .dsm
            .cas_sync(e_ptr, old_e.to_raw(), new_e.to_raw(), sink)
            .await?;
        if !swapped {
            for addr in &node_addrs {
                self.dsm.free(*addr, ALLOC_ALIGN_PAGE_SIZE);
            }
            return Ok((false, InternalEntry::from_raw(observed)));
        }

        // repoint the displaced child at its new slot; fire-and-forget
        self.dsm.cas(
            old_e.addr(),
            e_ptr.to_raw(),
            node_addrs[new_node_num - 1].add(ENTRY_ARRAY_OFFSET).to_raw(),
        )?;

        if let Some(cache) = &self.cache {
            for (page, addr) in pages.iter().zip(&node_addrs) {
                cache.add(k, page, addr.add(ENTRY_ARRAY_OFFSET));
            }
        }
        Ok((true, new_e))
    }

    /// The node is full for its declared class: claim the first free slot
    /// beyond it. Success reports the claimed index (which dictates the
    /// next class); a racer publishing our partial there first reports
    /// the slot to descend into.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn insert_behind(
        &self,
        k: &Key,
        v: &mut Value,
        depth: usize,
        leaf_addr: &mut GlobalAddress,
        partial_key: u8,
        node_type: NodeType,
        node_addr: GlobalAddress,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<(bool, usize, InternalEntry)> {
        debug_assert!(node_type.capacity() < 256);
        let stats = self.telemetry.thread(tid);
        let max_num = node_type.capacity();
        for slot_id in max_num..256 {
            let e_ptr = node_addr.add(8 * slot_id as u64);
            let (swapped, observed) = self
                .out_of_place_write_leaf(
                    k,
                    v,
                    depth,
                    leaf_addr,
                    partial_key,
                    e_ptr,
                    InternalEntry::NULL,
                    sink,
                )
                .await?;
            if swapped {
                return Ok((true, slot_id, InternalEntry::NULL));
            }
            if observed.partial() == partial_key {
                // a racer claimed this slot for the same partial
                return Ok((false, slot_id, observed));
            }
            stats.retry(RetryReason::InsertBehindTryNext);
        }
        unreachable!("a 256-slot page cannot be fully claimed by insert-behind")
    }

    /// Switch a node's class in both places that advertise it: the parent
    /// entry (plain CAS) and the header (masked CAS over the type bits),
    /// paired in one verb. Conflicts are chased: a replaced parent entry
    /// is followed down to the slot that still names this node, and any
    /// already-wider claim counts as done.
    pub(crate) async fn cas_node_type(
        &self,
        next_type: NodeType,
        p_ptr: GlobalAddress,
        p: InternalEntry,
        hdr: Header,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<()> {
        let stats = self.telemetry.thread(tid);
        let node_addr = p.addr();
        let header_addr = node_addr.add(8);

        let mut p_ptr = p_ptr;
        let mut p = p;
        let mut hdr = hdr;
        let mut entry_done = false;
        let mut header_done = false;

        loop {
            let mut entry_observed = 0u64;
            let mut header_observed = 0u64;
            if !entry_done && !header_done {
                let new_e = InternalEntry::with_node_type(next_type, p);
                let ((e_ok, e_old), (h_ok, h_old)) = self
                    .dsm
                    .two_cas_mask_sync(
                        p_ptr,
                        p.to_raw(),
                        new_e.to_raw(),
                        !0u64,
                        header_addr,
                        hdr.to_bits(),
                        Header::with_type(next_type).to_bits(),
                        NODE_TYPE_MASK,
                        sink,
                    )
                    .await?;
                entry_done = e_ok;
                header_done = h_ok;
                entry_observed = e_old;
                header_observed = h_old;
            } else {
                if !entry_done {
                    let new_e = InternalEntry::with_node_type(next_type, p);
                    let (e_ok, e_old) = self
                        .dsm
                        .cas_sync(p_ptr, p.to_raw(), new_e.to_raw(), sink)
                        .await?;
                    entry_done = e_ok;
                    entry_observed = e_old;
                }
                if !header_done {
                    let (h_ok, h_old) = self
                        .dsm
                        .cas_mask_sync(
                            header_addr,
                            hdr.to_bits(),
                            Header::with_type(next_type).to_bits(),
                            NODE_TYPE_MASK,
                            sink,
                        )
                        .await?;
                    header_done = h_ok;
                    header_observed = h_old;
                }
            }

            if !entry_done {
                p = InternalEntry::from_raw(entry_observed);
                // a concurrent split moved the node down; follow slot 0 of
                // each interposed page until we find the entry naming it
                while !p.is_null() && !p.is_leaf() && p.addr() != node_addr {
                    p_ptr = p.addr().add(ENTRY_ARRAY_OFFSET);
                    p = self.read_entry(p_ptr, sink).await?;
                    stats.retry(RetryReason::SwitchFindTarget);
                }
                if p.addr() != node_addr || p.node_type() >= next_type {
                    entry_done = true;
                }
            }
            if !header_done {
                hdr = Header::from_bits(header_observed);
                if hdr.node_type() >= next_type {
                    header_done = true;
                }
            }
            if entry_done && header_done {
                return Ok(());
            }
            stats.retry(RetryReason::SwitchRetry);
        }
    }
}
