//! Leaf updates: in place under a leaf-granularity lock, or out of place
//! through a parent-entry CAS.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;

use crate::addr::GlobalAddress;
use crate::coro::CoroSink;
use crate::error::TreeResult;
use crate::key::{Key, Value};
use crate::node::{
    InternalEntry, Leaf, LEAF_LOCK_CAS_OFFSET, LEAF_LOCK_MASK, LEAF_VALID_OFFSET,
};
use crate::transport::Space;
use crate::tree::Tree;

impl Tree {
    /// On-chip word and bit guarding the leaf at `leaf_addr`.
    pub(crate) fn on_chip_lock_addr(&self, leaf_addr: GlobalAddress) -> (GlobalAddress, u64) {
        let mut h = DefaultHasher::new();
        leaf_addr.offset.hash(&mut h);
        let lock_index = h.finish() % self.dsm.on_chip_lock_num();
        (
            GlobalAddress::new(leaf_addr.node, lock_index / 64 * 8),
            1u64 << (lock_index % 64),
        )
    }

    async fn try_lock_leaf(
        &self,
        leaf_addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<bool> {
        if self.config.embedded_lock {
            let (locked, _) = self
                .dsm
                .cas_mask_sync(
                    leaf_addr.add(LEAF_LOCK_CAS_OFFSET),
                    0,
                    !0u64,
                    LEAF_LOCK_MASK,
                    sink,
                )
                .await?;
            Ok(locked)
        } else {
            let (lock_addr, mask) = self.on_chip_lock_addr(leaf_addr);
            let (locked, _) = self
                .dsm
                .cas_dm_mask_sync(lock_addr, 0, !0u64, mask, sink)
                .await?;
            Ok(locked)
        }
    }

    pub(crate) async fn unlock_leaf(
        &self,
        leaf_addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        if self.config.embedded_lock {
            self.dsm
                .cas_mask_sync(
                    leaf_addr.add(LEAF_LOCK_CAS_OFFSET),
                    !0u64,
                    0,
                    LEAF_LOCK_MASK,
                    sink,
                )
                .await?;
        } else {
            let (lock_addr, mask) = self.on_chip_lock_addr(leaf_addr);
            self.dsm
                .cas_dm_mask_sync(lock_addr, !0u64, 0, mask, sink)
                .await?;
        }
        Ok(())
    }

    async fn acquire_leaf_lock(
        &self,
        leaf_addr: GlobalAddress,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<()> {
        let stats = self.telemetry.thread(tid);
        while !self.try_lock_leaf(leaf_addr, sink).await? {
            if let Some(s) = sink {
                s.yield_once().await;
            }
            stats.lock_fail.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Rewrite `leaf` in place under its lock. With lock handover enabled
    /// the remote unlock is elided for a queued successor on the same
    /// leaf; otherwise the write and the unlock share one doorbell pair.
    pub(crate) async fn in_place_update_leaf(
        &self,
        k: &Key,
        v: Value,
        leaf_addr: GlobalAddress,
        leaf: &mut Leaf,
        sink: Option<&CoroSink>,
        tid: u16,
    ) -> TreeResult<()> {
        debug_assert_eq!(&leaf.key, k);

        if self.config.lock_handover {
            let inherited = self.lock_table.acquire_lock_by_addr(leaf_addr, sink).await;
            if !inherited {
                self.acquire_leaf_lock(leaf_addr, sink, tid).await?;
            }

            leaf.value = v;
            leaf.set_consistent();

            let plan = self.lock_table.prepare_release_by_addr(leaf_addr);
            if self.config.embedded_lock {
                // the lock bit travels inside the leaf bytes
                if plan.handover && plan.unique_addr == leaf_addr {
                    leaf.lock();
                    self.dsm.write_sync(&leaf.to_bytes(), leaf_addr, sink).await?;
                } else {
                    if !plan.handover && plan.unique_addr != leaf_addr {
                        self.unlock_leaf(plan.unique_addr, sink).await?;
                    }
                    leaf.unlock();
                    self.dsm.write_sync(&leaf.to_bytes(), leaf_addr, sink).await?;
                }
            } else {
                self.dsm.write_sync(&leaf.to_bytes(), leaf_addr, sink).await?;
                if plan.unique_addr != leaf_addr {
                    self.unlock_leaf(leaf_addr, sink).await?;
                }
                if !plan.handover {
                    self.unlock_leaf(plan.unique_addr, sink).await?;
                }
            }
            self.lock_table.finish_release_by_addr(leaf_addr);
            return Ok(());
        }

        self.acquire_leaf_lock(leaf_addr, sink, tid).await?;

        let mut v = v;
        if self.config.write_combining {
            self.lock_table.get_combining_value(k, &mut v);
        }
        leaf.value = v;
        leaf.set_consistent();

        if self.config.embedded_lock {
            // the written image carries the cleared lock bit
            leaf.unlock();
            self.dsm.write_sync(&leaf.to_bytes(), leaf_addr, sink).await?;
        } else {
            // one verb: write the leaf, then clear the on-chip bit
            let (lock_addr, mask) = self.on_chip_lock_addr(leaf_addr);
            self.dsm
                .write_cas_mask_sync(
                    &leaf.to_bytes(),
                    leaf_addr,
                    Space::OnChip,
                    lock_addr,
                    !0u64,
                    0,
                    mask,
                    sink,
                )
                .await?;
        }
        Ok(())
    }

    /// Replace a leaf by publishing a fresh copy and invalidating the old
    /// one asynchronously. Identical CASes from co-located clients
    /// collapse through CAS handover unless `disable_handover`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn out_of_place_update_leaf(
        &self,
        k: &Key,
        v: &mut Value,
        depth: usize,
        leaf_addr: &mut GlobalAddress,
        e_ptr: GlobalAddress,
        old_e: InternalEntry,
        sink: Option<&CoroSink>,
        disable_handover: bool,
    ) -> TreeResult<(bool, InternalEntry)> {
        let use_handover = self.config.lock_handover && !disable_handover;
        let mut inherited = false;
        if use_handover {
            inherited = self.lock_table.acquire_cas_lock(k, sink).await;
        }

        let mut swapped = false;
        let mut observed = old_e;
        if !inherited {
            let (res, obs) = self
                .out_of_place_write_leaf(k, v, depth, leaf_addr, old_e.partial(), e_ptr, old_e, sink)
                .await?;
            swapped = res;
            if swapped {
                // unreachable now; posted invalidation, nobody waits on it
                self.dsm
                    .write(&[0u8], old_e.addr().add(LEAF_VALID_OFFSET))?;
            } else {
                observed = obs;
            }
        }

        if use_handover {
            self.lock_table.release_cas_lock(k, &mut swapped, &mut observed);
        }
        Ok((swapped, observed))
    }

    // ---- ROWEX baseline: per-node writer locks ----

    pub(crate) async fn lock_node(
        &self,
        node_addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        if !self.config.rowex {
            return Ok(());
        }
        let tid = self.dsm.my_thread_id();
        if self.config.lock_handover
            && self.lock_table.acquire_lock_by_addr(node_addr, sink).await
        {
            return Ok(());
        }
        let stats = self.telemetry.thread(tid);
        loop {
            let (lock_addr, mask) = self.on_chip_lock_addr(node_addr);
            let (locked, _) = self
                .dsm
                .cas_dm_mask_sync(lock_addr, 0, !0u64, mask, sink)
                .await?;
            if locked {
                return Ok(());
            }
            if let Some(s) = sink {
                s.yield_once().await;
            }
            stats.lock_fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) async fn unlock_node(
        &self,
        node_addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        if !self.config.rowex {
            return Ok(());
        }
        let unlock = |addr: GlobalAddress| {
            let (lock_addr, mask) = self.on_chip_lock_addr(addr);
            (lock_addr, mask)
        };
        if self.config.lock_handover {
            let plan = self.lock_table.prepare_release_by_addr(node_addr);
            if plan.unique_addr != node_addr {
                let (lock_addr, mask) = unlock(node_addr);
                self.dsm
                    .cas_dm_mask_sync(lock_addr, !0u64, 0, mask, sink)
                    .await?;
            }
            if !plan.handover {
                let (lock_addr, mask) = unlock(plan.unique_addr);
                self.dsm
                    .cas_dm_mask_sync(lock_addr, !0u64, 0, mask, sink)
                    .await?;
            }
            self.lock_table.finish_release_by_addr(node_addr);
        } else {
            let (lock_addr, mask) = unlock(node_addr);
            self.dsm
                .cas_dm_mask_sync(lock_addr, !0u64, 0, mask, sink)
                .await?;
        }
        Ok(())
    }
}
