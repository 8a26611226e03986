//! Client handle over the disaggregated memory pool.
//!
//! Wraps the transport with per-thread registration, chunk-backed remote
//! allocation, and the verb combinations the tree issues. Synchronous
//! variants either hand their completion to the calling coroutine's sink
//! or poll it inline when no sink is given; completions drained for other
//! coroutines of the same thread are forwarded to the active runtime.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::addr::GlobalAddress;
use crate::alloc::LocalAllocator;
use crate::config::{DsmConfig, PAGE_SIZE, READ_ORO_MAX, WRITE_ORO_MAX};
use crate::coro::{self, CoroSink};
use crate::error::TreeResult;
use crate::transport::{RemoteMemory, Space, WrId};

struct AllocState {
    /// One bump allocator per (memory node, directory).
    allocators: Vec<Vec<LocalAllocator>>,
    cur_node: usize,
    cur_dir: usize,
}

struct ThreadState {
    tid: u16,
    alloc: Mutex<AllocState>,
}

/// Process-wide handle; clone the `Arc` freely across threads.
pub struct Dsm {
    transport: Arc<dyn RemoteMemory>,
    config: DsmConfig,
    next_tid: AtomicU16,
    threads: DashMap<thread::ThreadId, ThreadState>,
}

impl Dsm {
    pub fn new(transport: Arc<dyn RemoteMemory>, config: DsmConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            next_tid: AtomicU16::new(0),
            threads: DashMap::new(),
        })
    }

    pub fn config(&self) -> &DsmConfig {
        &self.config
    }

    pub fn memory_nodes(&self) -> u16 {
        self.transport.node_count()
    }

    pub fn client_node_id(&self) -> u16 {
        self.config.client_node_id
    }

    pub fn on_chip_lock_num(&self) -> u64 {
        self.config.on_chip_lock_num()
    }

    fn new_thread_state(&self) -> ThreadState {
        let tid = self.next_tid.fetch_add(1, Ordering::AcqRel);
        self.transport.register_thread(tid);
        let nodes = self.memory_nodes() as usize;
        let dirs = self.config.directories;
        let allocators = (0..nodes)
            .map(|_| (0..dirs).map(|_| LocalAllocator::new()).collect())
            .collect();
        ThreadState {
            tid,
            alloc: Mutex::new(AllocState {
                allocators,
                cur_node: (tid as usize + self.config.client_node_id as usize) % nodes,
                cur_dir: (tid as usize + self.config.client_node_id as usize) % dirs,
            }),
        }
    }

    fn with_thread<R>(&self, f: impl FnOnce(&ThreadState) -> R) -> R {
        let id = thread::current().id();
        if let Some(st) = self.threads.get(&id) {
            return f(st.value());
        }
        let st = self
            .threads
            .entry(id)
            .or_insert_with(|| self.new_thread_state());
        f(st.value())
    }

    /// Register the calling thread (idempotent) and return its id.
    pub fn register_thread(&self) -> u16 {
        self.with_thread(|st| st.tid)
    }

    pub fn my_thread_id(&self) -> u16 {
        self.register_thread()
    }

    // ---- remote allocation ----

    /// Allocate `size` bytes in some memory node, granting a fresh chunk
    /// over the allocator RPC when the current one is exhausted.
    pub fn alloc(&self, size: usize) -> TreeResult<GlobalAddress> {
        self.with_thread(|st| {
            let mut state = st.alloc.lock();
            let nodes = self.memory_nodes() as usize;
            let dirs = self.config.directories;
            // spread allocations round-robin over (node, directory)
            state.cur_dir += 1;
            if state.cur_dir >= dirs {
                state.cur_dir = 0;
                state.cur_node = (state.cur_node + 1) % nodes;
            }
            let (node, dir) = (state.cur_node, state.cur_dir);
            let allocator = &mut state.allocators[node][dir];
            let (addr, need_chunk) = allocator.malloc(size, true);
            if !need_chunk {
                return Ok(addr);
            }
            let chunk = self.transport.grant_chunk(node as u16, dir)?;
            allocator.set_chunk(chunk);
            let (addr, need_chunk) = allocator.malloc(size, true);
            debug_assert!(!need_chunk);
            Ok(addr)
        })
    }

    /// Allocate page-sized regions for a chained node write.
    pub fn alloc_pages(&self, count: usize) -> TreeResult<Vec<GlobalAddress>> {
        (0..count).map(|_| self.alloc(PAGE_SIZE)).collect()
    }

    /// Return a region to this thread's local free list.
    pub fn free(&self, addr: GlobalAddress, size: usize) {
        self.with_thread(|st| {
            st.alloc.lock().allocators[addr.node as usize][0].free(addr, size);
        });
    }

    // ---- completion plumbing ----

    pub fn poll_once(&self) -> Option<WrId> {
        let tid = self.my_thread_id();
        self.transport.poll_once(tid)
    }

    /// Work id of verbs posted without a coroutine sink; never collides
    /// with a coroutine id.
    const SYNC_WR: WrId = WrId::MAX;

    fn wr_for(sink: Option<&CoroSink>) -> WrId {
        sink.map(|s| s.wr_id()).unwrap_or(Self::SYNC_WR)
    }

    async fn wait_completion(&self, tid: u16, wr: WrId, sink: Option<&CoroSink>) {
        match sink {
            Some(s) => s.wait_wr(wr).await,
            None => loop {
                match self.transport.poll_once(tid) {
                    Some(id) if id == wr => break,
                    Some(id) => coro::deliver_foreign(id),
                    None => std::hint::spin_loop(),
                }
            },
        }
    }

    // ---- one-sided verbs ----

    pub async fn read_sync(
        &self,
        buf: &mut [u8],
        addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        self.transport.read(tid, Space::Main, buf, addr, Some(wr))?;
        self.wait_completion(tid, wr, sink).await;
        Ok(())
    }

    pub async fn write_sync(
        &self,
        buf: &[u8],
        addr: GlobalAddress,
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        self.transport.write(tid, Space::Main, buf, addr, Some(wr))?;
        self.wait_completion(tid, wr, sink).await;
        Ok(())
    }

    /// Posted, unsignaled write; used for fire-and-forget repairs.
    pub fn write(&self, buf: &[u8], addr: GlobalAddress) -> TreeResult<()> {
        let tid = self.my_thread_id();
        self.transport.write(tid, Space::Main, buf, addr, None)?;
        Ok(())
    }

    /// Posted, unsignaled CAS; lost races are benign by construction.
    pub fn cas(&self, addr: GlobalAddress, expected: u64, new: u64) -> TreeResult<()> {
        let tid = self.my_thread_id();
        let mut old = 0u64;
        self.transport
            .cas(tid, Space::Main, addr, expected, new, &mut old, None)?;
        Ok(())
    }

    /// Posted, unsignaled masked CAS.
    pub fn cas_mask(
        &self,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
    ) -> TreeResult<()> {
        let tid = self.my_thread_id();
        let mut old = 0u64;
        self.transport
            .cas_mask(tid, Space::Main, addr, expected, new, mask, &mut old, None)?;
        Ok(())
    }

    /// Returns `(swapped, old_value)`.
    pub async fn cas_sync(
        &self,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, u64)> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        let mut old = 0u64;
        self.transport
            .cas(tid, Space::Main, addr, expected, new, &mut old, Some(wr))?;
        self.wait_completion(tid, wr, sink).await;
        Ok((old == expected, old))
    }

    pub async fn cas_mask_sync(
        &self,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, u64)> {
        self.cas_mask_sync_in(Space::Main, addr, expected, new, mask, sink).await
    }

    /// Masked CAS against on-chip device memory.
    pub async fn cas_dm_mask_sync(
        &self,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, u64)> {
        self.cas_mask_sync_in(Space::OnChip, addr, expected, new, mask, sink).await
    }

    async fn cas_mask_sync_in(
        &self,
        space: Space,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, u64)> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        let mut old = 0u64;
        self.transport
            .cas_mask(tid, space, addr, expected, new, mask, &mut old, Some(wr))?;
        self.wait_completion(tid, wr, sink).await;
        Ok((old & mask == expected & mask, old))
    }

    /// Write a buffer and release a (possibly on-chip) lock word in one
    /// doorbell-batched verb pair.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_cas_mask_sync(
        &self,
        write_buf: &[u8],
        write_addr: GlobalAddress,
        cas_space: Space,
        cas_addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
        sink: Option<&CoroSink>,
    ) -> TreeResult<(bool, u64)> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        let mut old = 0u64;
        self.transport.write_cas_mask(
            tid, write_buf, write_addr, cas_space, cas_addr, expected, new, mask, &mut old,
            Some(wr),
        )?;
        self.wait_completion(tid, wr, sink).await;
        Ok((old & mask == expected & mask, old))
    }

    /// Paired masked CASes (entry word + header word) with one completion.
    #[allow(clippy::too_many_arguments)]
    pub async fn two_cas_mask_sync(
        &self,
        addr_1: GlobalAddress,
        expected_1: u64,
        new_1: u64,
        mask_1: u64,
        addr_2: GlobalAddress,
        expected_2: u64,
        new_2: u64,
        mask_2: u64,
        sink: Option<&CoroSink>,
    ) -> TreeResult<((bool, u64), (bool, u64))> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        let mut old_1 = 0u64;
        let mut old_2 = 0u64;
        self.transport.two_cas_mask(
            tid, addr_1, expected_1, new_1, mask_1, &mut old_1, addr_2, expected_2, new_2,
            mask_2, &mut old_2, Some(wr),
        )?;
        self.wait_completion(tid, wr, sink).await;
        Ok((
            (old_1 & mask_1 == expected_1 & mask_1, old_1),
            (old_2 & mask_2 == expected_2 & mask_2, old_2),
        ))
    }

    /// Doorbell-batched writes, split per destination node and capped per
    /// batch so a burst cannot exceed the transport's queue depth.
    pub async fn write_batches_sync(
        &self,
        ops: &[(Vec<u8>, GlobalAddress)],
        sink: Option<&CoroSink>,
    ) -> TreeResult<()> {
        let tid = self.my_thread_id();
        let wr = Self::wr_for(sink);
        let mut by_node: Vec<Vec<usize>> = vec![Vec::new(); self.memory_nodes() as usize];
        for (i, (_, addr)) in ops.iter().enumerate() {
            by_node[addr.node as usize].push(i);
        }
        for group in by_node {
            for chunk in group.chunks(WRITE_ORO_MAX) {
                for (pos, &i) in chunk.iter().enumerate() {
                    let signal = if pos + 1 == chunk.len() { Some(wr) } else { None };
                    let (buf, addr) = &ops[i];
                    self.transport.write(tid, Space::Main, buf, *addr, signal)?;
                }
                self.wait_completion(tid, wr, sink).await;
            }
        }
        Ok(())
    }

    /// Doorbell-batched reads for range queries; no coroutine is involved,
    /// polling is synchronous per batch. Results line up with `reqs`.
    pub fn read_batches_sync(
        &self,
        reqs: &[(GlobalAddress, usize)],
    ) -> TreeResult<Vec<Vec<u8>>> {
        let tid = self.my_thread_id();
        let mut out: Vec<Vec<u8>> = reqs.iter().map(|&(_, size)| vec![0u8; size]).collect();
        let mut by_node: Vec<Vec<usize>> = vec![Vec::new(); self.memory_nodes() as usize];
        for (i, (addr, _)) in reqs.iter().enumerate() {
            by_node[addr.node as usize].push(i);
        }
        for group in by_node {
            for chunk in group.chunks(READ_ORO_MAX) {
                for (pos, &i) in chunk.iter().enumerate() {
                    let signal = if pos + 1 == chunk.len() {
                        Some(Self::SYNC_WR)
                    } else {
                        None
                    };
                    let addr = reqs[i].0;
                    self.transport
                        .read(tid, Space::Main, &mut out[i], addr, signal)?;
                }
                // completions of co-located coroutines may sit in front of
                // ours; forward them instead of swallowing them
                loop {
                    match self.transport.poll_once(tid) {
                        Some(Self::SYNC_WR) => break,
                        Some(id) => coro::deliver_foreign(id),
                        None => std::hint::spin_loop(),
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ALLOC_ALIGN_LEAF_SIZE, CHUNK_SIZE, LEAF_SIZE};
    use crate::transport::loopback::LoopbackTransport;
    use futures::executor::block_on;

    fn dsm() -> Arc<Dsm> {
        let config = DsmConfig::default();
        let transport = Arc::new(LoopbackTransport::new(&config));
        Dsm::new(transport, config)
    }

    #[test]
    fn thread_registration_is_idempotent() {
        let dsm = dsm();
        let a = dsm.register_thread();
        let b = dsm.register_thread();
        assert_eq!(a, b);
    }

    #[test]
    fn alloc_spreads_and_stays_chunk_aligned() {
        let dsm = dsm();
        let a = dsm.alloc(LEAF_SIZE).unwrap();
        let b = dsm.alloc(LEAF_SIZE).unwrap();
        assert!(a.offset >= CHUNK_SIZE);
        assert!(b.offset >= CHUNK_SIZE);
        assert_eq!(a.offset % ALLOC_ALIGN_LEAF_SIZE as u64, 0);
        assert_ne!(a.node, b.node); // round-robin across memory nodes
    }

    #[test]
    fn free_feeds_the_local_list_without_remote_traffic() {
        let dsm = dsm();
        let a = dsm.alloc(256).unwrap();
        dsm.free(a, 256);
        assert!(dsm.alloc(256).is_ok());
    }

    #[test]
    fn verbs_round_trip_through_completion() {
        let dsm = dsm();
        let addr = dsm.alloc(64).unwrap();
        block_on(async {
            dsm.write_sync(&[0xabu8; 16], addr, None).await.unwrap();
            let mut buf = [0u8; 16];
            dsm.read_sync(&mut buf, addr, None).await.unwrap();
            assert_eq!(buf, [0xabu8; 16]);

            let word = addr.add(16);
            let (ok, old) = dsm.cas_sync(word, 0, 77, None).await.unwrap();
            assert!(ok);
            assert_eq!(old, 0);
            let (ok, old) = dsm.cas_sync(word, 0, 88, None).await.unwrap();
            assert!(!ok);
            assert_eq!(old, 77);
        });
    }

    #[test]
    fn batched_reads_match_single_reads() {
        let dsm = dsm();
        let a = dsm.alloc(32).unwrap();
        let b = dsm.alloc(32).unwrap();
        block_on(async {
            dsm.write_sync(&[1u8; 32], a, None).await.unwrap();
            dsm.write_sync(&[2u8; 32], b, None).await.unwrap();
        });
        let out = dsm.read_batches_sync(&[(a, 32), (b, 32)]).unwrap();
        assert_eq!(out[0], vec![1u8; 32]);
        assert_eq!(out[1], vec![2u8; 32]);
    }
}
