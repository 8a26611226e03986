//! Local lock table: collapsing redundant remote operations across
//! co-located clients.
//!
//! A flat array of ticket-queue slots, indexed by hashing the key (or the
//! remote address) of an operation. Requests on the same slot serialize
//! through 8-bit ticket/current pairs; within an epoch window opened by a
//! queue's winner, followers share the winner's result instead of going
//! remote. Four protocols ride on the same slot state: read delegation,
//! write combining, lock handover and CAS handover.
//!
//! Slot mutexes guard only short counter and buffer updates and are never
//! held across a coroutine yield.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::GlobalAddress;
use crate::config::MAX_HOCL_HANDOVER;
use crate::coro::CoroSink;
use crate::key::{key_to_int, Key, Value};
use crate::node::InternalEntry;

/// Result a queue winner publishes for its epoch's followers.
#[derive(Default)]
struct Published {
    res: bool,
    ret_value: Value,
    ret_entry: InternalEntry,
}

#[derive(Default)]
struct LocalLockNode {
    // read waiting queue
    read_current: AtomicU8,
    read_ticket: AtomicU8,
    read_handover: AtomicBool,

    // write waiting queue
    write_current: AtomicU8,
    write_ticket: AtomicU8,
    write_handover: AtomicBool,

    // epoch window over both queues
    window_start: AtomicBool,
    read_window: AtomicU8,
    write_window: AtomicU8,
    r_lock: Mutex<()>,
    w_lock: Mutex<()>,

    // owner of the current epoch; 0 = vacant. Distinct keys hashing to the
    // same slot bypass the fast path instead of queuing behind it.
    unique_read_key: AtomicU64,
    unique_write_key: AtomicU64,
    unique_addr: AtomicU64,

    published: Mutex<Published>,

    // write combining: last local writer wins
    wc_buffer: Mutex<Value>,

    // cap on consecutive handovers to avoid starving remote release
    handover_cnt: AtomicU32,
}

/// Whether the queue position (`handover`) and hash fate (`conflict`) of an
/// acquisition allow it to skip the remote operation.
pub type AcquireResult = (bool, bool);

/// What a lock-handover release must still do remotely.
#[derive(Debug, Clone, Copy)]
pub struct AddrReleasePlan {
    /// The next queued client inherits the remote lock.
    pub handover: bool,
    /// Address the current epoch actually holds the remote lock on.
    pub unique_addr: GlobalAddress,
}

/// The table proper. Slots are shared (`Arc`) so ticket-wait predicates can
/// outlive the borrow that created them.
pub struct LocalLockTable {
    slots: Arc<[LocalLockNode]>,
}

fn hashed_index(x: u64, modulus: usize) -> usize {
    let mut h = DefaultHasher::new();
    x.hash(&mut h);
    (h.finish() % modulus as u64) as usize
}

impl LocalLockTable {
    pub fn new(slot_count: usize) -> Self {
        let slots: Vec<LocalLockNode> =
            (0..slot_count.max(1)).map(|_| LocalLockNode::default()).collect();
        Self { slots: slots.into() }
    }

    fn key_index(&self, k: &Key) -> usize {
        hashed_index(key_to_int(k), self.slots.len())
    }

    fn addr_index(&self, a: GlobalAddress) -> usize {
        hashed_index(a.to_raw(), self.slots.len())
    }

    /// Spin (or cooperatively yield) until `ticket` is served on the given
    /// queue of slot `idx`.
    async fn wait_serve(&self, idx: usize, ticket: u8, write_queue: bool, sink: Option<&CoroSink>) {
        loop {
            let cur = if write_queue {
                self.slots[idx].write_current.load(Ordering::Relaxed)
            } else {
                self.slots[idx].read_current.load(Ordering::Relaxed)
            };
            if cur == ticket {
                return;
            }
            match sink {
                Some(s) => {
                    let slots = self.slots.clone();
                    s.wait_until(move || {
                        let cur = if write_queue {
                            slots[idx].write_current.load(Ordering::Relaxed)
                        } else {
                            slots[idx].read_current.load(Ordering::Relaxed)
                        };
                        cur == ticket
                    })
                    .await;
                }
                None => std::hint::spin_loop(),
            }
        }
    }

    fn shrink_window(node: &LocalLockNode, read_side: bool) {
        let window = if read_side { &node.read_window } else { &node.write_window };
        if window.load(Ordering::Relaxed) != 0 {
            let left = window.fetch_sub(1, Ordering::AcqRel) - 1;
            let other = if read_side {
                node.write_window.load(Ordering::Relaxed)
            } else {
                node.read_window.load(Ordering::Relaxed)
            };
            if left == 0 && other == 0 {
                node.window_start.store(false, Ordering::Release);
            }
        }
    }

    // ---- read delegation ----

    /// Returns `(handover, conflict)`: a handover loser shares the epoch
    /// winner's result; a conflict caller goes remote independently.
    pub async fn acquire_local_read_lock(
        &self,
        k: &Key,
        sink: Option<&CoroSink>,
    ) -> AcquireResult {
        let idx = self.key_index(k);
        let node = &self.slots[idx];
        let key_image = key_to_int(k);

        if let Err(owner) =
            node.unique_read_key
                .compare_exchange(0, key_image, Ordering::AcqRel, Ordering::Acquire)
        {
            if owner != key_image {
                return (false, true);
            }
        }

        let ticket = node.read_ticket.fetch_add(1, Ordering::AcqRel);
        self.wait_serve(idx, ticket, false, sink).await;

        let owner = node.unique_read_key.load(Ordering::Acquire);
        if owner == 0 || owner != key_image {
            // the epoch turned over to a conflicting key while we queued
            Self::shrink_window(node, true);
            node.read_current.fetch_add(1, Ordering::AcqRel);
            return (false, true);
        }
        if node.read_window.load(Ordering::Relaxed) == 0 {
            node.read_handover.store(false, Ordering::Relaxed);
        }
        (node.read_handover.load(Ordering::Relaxed), false)
    }

    /// Publish (winner) or adopt (loser) the search result, then pass the
    /// queue head on and maybe open a sharing window.
    pub fn release_local_read_lock(
        &self,
        k: &Key,
        acquired: AcquireResult,
        res: &mut bool,
        ret_value: &mut Value,
    ) {
        if acquired.1 {
            return;
        }
        let node = &self.slots[self.key_index(k)];

        if !node.read_handover.load(Ordering::Relaxed) {
            let mut p = node.published.lock();
            p.res = *res;
            p.ret_value = *ret_value;
        } else {
            let p = node.published.lock();
            *res = p.res;
            *ret_value = p.ret_value;
        }

        let ticket = node.read_ticket.load(Ordering::Relaxed);
        let current = node.read_current.load(Ordering::Relaxed);

        if !node.read_handover.load(Ordering::Relaxed)
            && node
                .window_start
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // capture both queue spans as the sharing window
            node.read_window
                .store(ticket.wrapping_sub(current), Ordering::Release);
            let _g = node.w_lock.lock();
            let w_current = node.write_current.load(Ordering::Relaxed);
            node.write_window.store(
                node.write_ticket.load(Ordering::Relaxed).wrapping_sub(w_current),
                Ordering::Release,
            );
        }

        node.read_handover
            .store(ticket != current.wrapping_add(1), Ordering::Relaxed);

        if !node.read_handover.load(Ordering::Relaxed) {
            node.unique_read_key.store(0, Ordering::Release);
        }

        let _g = node.r_lock.lock();
        Self::shrink_window(node, true);
        node.read_current.fetch_add(1, Ordering::AcqRel);
    }

    // ---- write combining ----

    /// Enqueue a write of `v`; later co-located writers overwrite the
    /// combining buffer, so the queue winner sends the freshest value.
    pub async fn acquire_local_write_lock(
        &self,
        k: &Key,
        v: Value,
        sink: Option<&CoroSink>,
    ) -> AcquireResult {
        let idx = self.key_index(k);
        let node = &self.slots[idx];
        let key_image = key_to_int(k);

        if let Err(owner) =
            node.unique_write_key
                .compare_exchange(0, key_image, Ordering::AcqRel, Ordering::Acquire)
        {
            if owner != key_image {
                return (false, true);
            }
        }

        *node.wc_buffer.lock() = v; // local overwrite (combining)

        let ticket = node.write_ticket.fetch_add(1, Ordering::AcqRel);
        self.wait_serve(idx, ticket, true, sink).await;

        let owner = node.unique_write_key.load(Ordering::Acquire);
        if owner == 0 || owner != key_image {
            Self::shrink_window(node, false);
            node.write_current.fetch_add(1, Ordering::AcqRel);
            return (false, true);
        }
        if node.write_window.load(Ordering::Relaxed) == 0 {
            node.write_handover.store(false, Ordering::Relaxed);
        }
        (node.write_handover.load(Ordering::Relaxed), false)
    }

    /// Refresh `v` from the combining buffer right before the remote write.
    /// Returns whether the buffered value differed.
    pub fn get_combining_value(&self, k: &Key, v: &mut Value) -> bool {
        let node = &self.slots[self.key_index(k)];
        let owner = node.unique_write_key.load(Ordering::Acquire);
        if owner != 0 && owner == key_to_int(k) {
            let buf = node.wc_buffer.lock();
            let changed = *buf != *v;
            *v = *buf;
            return changed;
        }
        false
    }

    pub fn release_local_write_lock(&self, k: &Key, acquired: AcquireResult) {
        if acquired.1 {
            return;
        }
        let node = &self.slots[self.key_index(k)];

        let ticket = node.write_ticket.load(Ordering::Relaxed);
        let current = node.write_current.load(Ordering::Relaxed);

        if !node.write_handover.load(Ordering::Relaxed)
            && node
                .window_start
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            {
                let _g = node.r_lock.lock();
                let r_current = node.read_current.load(Ordering::Relaxed);
                node.read_window.store(
                    node.read_ticket.load(Ordering::Relaxed).wrapping_sub(r_current),
                    Ordering::Release,
                );
            }
            node.write_window
                .store(ticket.wrapping_sub(current), Ordering::Release);
        }

        node.write_handover
            .store(ticket != current.wrapping_add(1), Ordering::Relaxed);

        if !node.write_handover.load(Ordering::Relaxed) {
            node.unique_write_key.store(0, Ordering::Release);
        }

        let _g = node.w_lock.lock();
        Self::shrink_window(node, false);
        node.write_current.fetch_add(1, Ordering::AcqRel);
    }

    // ---- lock handover (by remote address) ----

    /// Returns whether the remote lock at `addr` is inherited from the
    /// previous queue head instead of being acquired remotely.
    pub async fn acquire_lock_by_addr(
        &self,
        addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> bool {
        let idx = self.addr_index(addr);
        let node = &self.slots[idx];

        let ticket = node.write_ticket.fetch_add(1, Ordering::AcqRel);
        self.wait_serve(idx, ticket, true, sink).await;

        if !node.write_handover.load(Ordering::Relaxed) {
            node.unique_addr.store(addr.to_raw(), Ordering::Release);
        }
        node.write_handover.load(Ordering::Relaxed)
            && node.unique_addr.load(Ordering::Acquire) == addr.to_raw()
    }

    /// Decide who unlocks what; the caller performs the remote operations
    /// the plan demands and then calls [`Self::finish_release_by_addr`].
    pub fn prepare_release_by_addr(&self, addr: GlobalAddress) -> AddrReleasePlan {
        let node = &self.slots[self.addr_index(addr)];

        let ticket = node.write_ticket.load(Ordering::Relaxed);
        let current = node.write_current.load(Ordering::Relaxed);

        let mut handover = ticket != current.wrapping_add(1);
        if node.handover_cnt.fetch_add(1, Ordering::AcqRel) > MAX_HOCL_HANDOVER {
            handover = false;
        }
        if !handover {
            node.handover_cnt.store(0, Ordering::Release);
        }
        node.write_handover.store(handover, Ordering::Relaxed);

        AddrReleasePlan {
            handover,
            unique_addr: GlobalAddress::from_raw(node.unique_addr.load(Ordering::Acquire)),
        }
    }

    /// Advance the queue after the plan's remote operations completed.
    pub fn finish_release_by_addr(&self, addr: GlobalAddress) {
        let node = &self.slots[self.addr_index(addr)];
        node.write_current.fetch_add(1, Ordering::AcqRel);
    }

    // ---- CAS handover (by key) ----

    /// Returns whether this CAS can adopt the epoch winner's outcome.
    pub async fn acquire_cas_lock(&self, k: &Key, sink: Option<&CoroSink>) -> bool {
        let idx = self.key_index(k);
        let node = &self.slots[idx];
        let key_image = key_to_int(k);

        let ticket = node.write_ticket.fetch_add(1, Ordering::AcqRel);
        self.wait_serve(idx, ticket, true, sink).await;

        if !node.write_handover.load(Ordering::Relaxed) {
            node.unique_write_key.store(key_image, Ordering::Release);
        }
        let owner = node.unique_write_key.load(Ordering::Acquire);
        node.write_handover.load(Ordering::Relaxed) && owner != 0 && owner == key_image
    }

    /// Publish (winner) or adopt (loser) the CAS outcome, then advance.
    pub fn release_cas_lock(&self, k: &Key, res: &mut bool, ret_entry: &mut InternalEntry) {
        let node = &self.slots[self.key_index(k)];
        let key_image = key_to_int(k);

        let owner = node.unique_write_key.load(Ordering::Acquire);
        if owner != 0 && owner == key_image {
            if !node.write_handover.load(Ordering::Relaxed) {
                let mut p = node.published.lock();
                p.res = *res;
                p.ret_entry = *ret_entry;
            } else {
                let p = node.published.lock();
                *res = p.res;
                *ret_entry = p.ret_entry;
            }
        }

        let ticket = node.write_ticket.load(Ordering::Relaxed);
        let current = node.write_current.load(Ordering::Relaxed);

        let mut handover = ticket != current.wrapping_add(1);
        if node.handover_cnt.fetch_add(1, Ordering::AcqRel) > MAX_HOCL_HANDOVER {
            handover = false;
        }
        if !handover {
            node.handover_cnt.store(0, Ordering::Release);
        }
        node.write_handover.store(handover, Ordering::Relaxed);

        node.write_current.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::int_to_key;
    use futures::executor::block_on;

    fn table() -> LocalLockTable {
        LocalLockTable::new(1024)
    }

    #[test]
    fn uncontended_read_is_winner_and_publishes() {
        let t = table();
        let k = int_to_key(10);
        let acq = block_on(t.acquire_local_read_lock(&k, None));
        assert_eq!(acq, (false, false)); // winner, no conflict

        let mut res = true;
        let mut val = 42u64;
        t.release_local_read_lock(&k, acq, &mut res, &mut val);
        assert!(res);
        assert_eq!(val, 42);

        // the epoch closed; the next acquirer is a fresh winner
        let acq = block_on(t.acquire_local_read_lock(&k, None));
        assert_eq!(acq, (false, false));
        let mut res = false;
        let mut val = 0u64;
        t.release_local_read_lock(&k, acq, &mut res, &mut val);
    }

    #[test]
    fn conflicting_keys_bypass_the_fast_path() {
        let t = LocalLockTable::new(1); // force every key onto one slot
        let k1 = int_to_key(1);
        let k2 = int_to_key(2);
        let acq1 = block_on(t.acquire_local_read_lock(&k1, None));
        assert_eq!(acq1, (false, false));
        let acq2 = block_on(t.acquire_local_read_lock(&k2, None));
        assert_eq!(acq2, (false, true)); // different key, same slot
        let mut res = true;
        let mut val = 1u64;
        t.release_local_read_lock(&k1, acq1, &mut res, &mut val);
        t.release_local_read_lock(&k2, acq2, &mut res, &mut val); // no-op
    }

    #[test]
    fn write_combining_keeps_the_last_value() {
        let t = table();
        let k = int_to_key(7);
        let acq = block_on(t.acquire_local_write_lock(&k, 1, None));
        assert_eq!(acq, (false, false));

        // a later co-located writer overwrites the buffer before the
        // winner goes remote
        *t.slots[t.key_index(&k)].wc_buffer.lock() = 2;

        let mut v = 1u64;
        assert!(t.get_combining_value(&k, &mut v));
        assert_eq!(v, 2);
        t.release_local_write_lock(&k, acq);
    }

    #[test]
    fn combining_value_ignores_foreign_keys() {
        let t = table();
        let k = int_to_key(3);
        let other = int_to_key(4);
        let acq = block_on(t.acquire_local_write_lock(&k, 9, None));
        let mut v = 5u64;
        assert!(!t.get_combining_value(&other, &mut v));
        assert_eq!(v, 5);
        t.release_local_write_lock(&k, acq);
    }

    #[test]
    fn addr_lock_single_holder_must_unlock_remotely() {
        let t = table();
        let addr = GlobalAddress::new(0, 0x4200);
        let inherited = block_on(t.acquire_lock_by_addr(addr, None));
        assert!(!inherited);
        let plan = t.prepare_release_by_addr(addr);
        assert!(!plan.handover); // nobody queued behind us
        assert_eq!(plan.unique_addr, addr);
        t.finish_release_by_addr(addr);
    }

    #[test]
    fn handover_chain_is_capped() {
        let t = table();
        let addr = GlobalAddress::new(0, 0x100);
        for round in 0..(MAX_HOCL_HANDOVER + 2) {
            let _ = block_on(t.acquire_lock_by_addr(addr, None));
            // enqueue a waiter behind us so a handover is possible
            let node = &t.slots[t.addr_index(addr)];
            node.write_ticket.fetch_add(1, Ordering::AcqRel);
            let plan = t.prepare_release_by_addr(addr);
            if round < MAX_HOCL_HANDOVER {
                assert!(plan.handover, "round {round} should hand over");
            }
            t.finish_release_by_addr(addr);
            // drain the fake waiter
            node.write_current.fetch_add(1, Ordering::AcqRel);
        }
        // the cap forces a real unlock eventually
        let node = &t.slots[t.addr_index(addr)];
        assert_eq!(node.handover_cnt.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cas_handover_publishes_entry() {
        let t = table();
        let k = int_to_key(99);
        let inherited = block_on(t.acquire_cas_lock(&k, None));
        assert!(!inherited); // winner
        let mut res = true;
        let mut entry = InternalEntry::from_raw(0xdead);
        t.release_cas_lock(&k, &mut res, &mut entry);
        let p = t.slots[t.key_index(&k)].published.lock();
        assert!(p.res);
        assert_eq!(p.ret_entry, InternalEntry::from_raw(0xdead));
    }
}
