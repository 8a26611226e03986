//! Process-local emulation of a memory pool.
//!
//! Each memory node is backed by word-atomic main and on-chip arrays;
//! verbs execute inline and their completions queue per client thread.
//! Byte-granular reads and writes move data word by word, so a read racing
//! a write can observe a torn image across words — the same hazard a NIC
//! presents, and exactly what the leaf checksum re-read path tolerates.
//! Used by tests and single-process bootstrap; a cluster deployment plugs
//! a real transport into [`RemoteMemory`] instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::addr::GlobalAddress;
use crate::config::{DsmConfig, CHUNK_SIZE};
use crate::error::{TransportError, TransportResult};
use crate::transport::{RemoteMemory, Space, WrId};

fn make_words(bytes: u64) -> Box<[AtomicU64]> {
    (0..bytes / 8).map(|_| AtomicU64::new(0)).collect()
}

struct MemoryNode {
    /// Main space, materialized chunk by chunk on first touch so a large
    /// registered region costs only what is actually granted.
    main_chunks: Vec<OnceLock<Box<[AtomicU64]>>>,
    on_chip: Box<[AtomicU64]>,
    /// Chunk grant cursor; chunk 0 is reserved for the root pointer store.
    next_chunk: AtomicU64,
}

impl MemoryNode {
    fn chunk_words(&self, chunk: usize) -> &[AtomicU64] {
        self.main_chunks[chunk].get_or_init(|| make_words(CHUNK_SIZE))
    }
}

/// An in-process [`RemoteMemory`] implementation.
pub struct LoopbackTransport {
    nodes: Vec<MemoryNode>,
    main_size: u64,
    cqs: DashMap<u16, Mutex<VecDeque<WrId>>>,
}

impl LoopbackTransport {
    pub fn new(config: &DsmConfig) -> Self {
        let chunk_cnt = (config.main_size / CHUNK_SIZE) as usize;
        let nodes = (0..config.memory_nodes)
            .map(|_| MemoryNode {
                main_chunks: (0..chunk_cnt).map(|_| OnceLock::new()).collect(),
                on_chip: make_words(config.on_chip_size()),
                next_chunk: AtomicU64::new(CHUNK_SIZE),
            })
            .collect();
        Self {
            nodes,
            main_size: config.main_size,
            cqs: DashMap::new(),
        }
    }

    /// Words backing `[addr, addr + len)` plus the in-region word offset.
    /// Verbs never span chunks: remote allocations bump inside one chunk.
    fn words(
        &self,
        space: Space,
        addr: GlobalAddress,
        len: u64,
    ) -> TransportResult<(&[AtomicU64], u64)> {
        let node = self
            .nodes
            .get(addr.node as usize)
            .ok_or(TransportError::UnknownNode(addr.node))?;
        match space {
            Space::Main => {
                if addr.offset + len > self.main_size {
                    return Err(TransportError::OutOfRange(addr));
                }
                let chunk = (addr.offset / CHUNK_SIZE) as usize;
                let within = addr.offset % CHUNK_SIZE;
                if within + len > CHUNK_SIZE {
                    return Err(TransportError::OutOfRange(addr));
                }
                Ok((node.chunk_words(chunk), within))
            }
            Space::OnChip => {
                if addr.offset + len > node.on_chip.len() as u64 * 8 {
                    return Err(TransportError::OutOfRange(addr));
                }
                Ok((&node.on_chip[..], addr.offset))
            }
        }
    }

    fn word_at(&self, space: Space, addr: GlobalAddress) -> TransportResult<&AtomicU64> {
        if addr.offset % 8 != 0 {
            return Err(TransportError::Unaligned(addr));
        }
        let (words, within) = self.words(space, addr, 8)?;
        Ok(&words[(within / 8) as usize])
    }

    fn complete(&self, tid: u16, signal: Option<WrId>) {
        if let Some(id) = signal {
            if let Some(cq) = self.cqs.get(&tid) {
                cq.lock().push_back(id);
            }
        }
    }
}

fn copy_out(words: &[AtomicU64], mut offset: u64, buf: &mut [u8]) {
    let mut i = 0usize;
    while i < buf.len() {
        let w = words[(offset / 8) as usize].load(Ordering::Acquire);
        let bytes = w.to_le_bytes();
        let start = (offset % 8) as usize;
        let n = (8 - start).min(buf.len() - i);
        buf[i..i + n].copy_from_slice(&bytes[start..start + n]);
        i += n;
        offset += n as u64;
    }
}

fn copy_in(words: &[AtomicU64], mut offset: u64, buf: &[u8]) {
    let mut i = 0usize;
    while i < buf.len() {
        let slot = &words[(offset / 8) as usize];
        let start = (offset % 8) as usize;
        let n = (8 - start).min(buf.len() - i);
        if n == 8 {
            slot.store(
                u64::from_le_bytes(buf[i..i + 8].try_into().unwrap()),
                Ordering::Release,
            );
        } else {
            // partial word: patch only the covered bytes
            let mut cur = slot.load(Ordering::Acquire);
            loop {
                let mut bytes = cur.to_le_bytes();
                bytes[start..start + n].copy_from_slice(&buf[i..i + n]);
                match slot.compare_exchange(
                    cur,
                    u64::from_le_bytes(bytes),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => cur = observed,
                }
            }
        }
        i += n;
        offset += n as u64;
    }
}

impl RemoteMemory for LoopbackTransport {
    fn register_thread(&self, tid: u16) {
        self.cqs.entry(tid).or_insert_with(|| Mutex::new(VecDeque::new()));
    }

    fn read(
        &self,
        tid: u16,
        space: Space,
        buf: &mut [u8],
        addr: GlobalAddress,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        let (words, within) = self.words(space, addr, buf.len() as u64)?;
        copy_out(words, within, buf);
        self.complete(tid, signal);
        Ok(())
    }

    fn write(
        &self,
        tid: u16,
        space: Space,
        buf: &[u8],
        addr: GlobalAddress,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        let (words, within) = self.words(space, addr, buf.len() as u64)?;
        copy_in(words, within, buf);
        self.complete(tid, signal);
        Ok(())
    }

    fn cas_mask(
        &self,
        tid: u16,
        space: Space,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        let word = self.word_at(space, addr)?;
        let mut cur = word.load(Ordering::Acquire);
        *old = loop {
            if cur & mask != expected & mask {
                break cur;
            }
            let swapped = (cur & !mask) | (new & mask);
            match word.compare_exchange(cur, swapped, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => break prev,
                Err(observed) => cur = observed,
            }
        };
        self.complete(tid, signal);
        Ok(())
    }

    fn faa_boundary(
        &self,
        tid: u16,
        space: Space,
        addr: GlobalAddress,
        delta: u64,
        mask: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        let word = self.word_at(space, addr)?;
        let mut cur = word.load(Ordering::Acquire);
        *old = loop {
            let added = (cur & mask).wrapping_add(delta) & mask;
            let new = (cur & !mask) | added;
            match word.compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(prev) => break prev,
                Err(observed) => cur = observed,
            }
        };
        self.complete(tid, signal);
        Ok(())
    }

    fn poll(&self, tid: u16, count: usize) {
        let mut seen = 0;
        while seen < count {
            if self.poll_once(tid).is_some() {
                seen += 1;
            } else {
                std::hint::spin_loop();
            }
        }
    }

    fn poll_once(&self, tid: u16) -> Option<WrId> {
        self.cqs.get(&tid).and_then(|cq| cq.lock().pop_front())
    }

    fn poll_batch(&self, tid: u16, out: &mut [WrId]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.poll_once(tid) {
                Some(id) => {
                    out[n] = id;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn grant_chunk(&self, node: u16, _dir: usize) -> TransportResult<GlobalAddress> {
        let n = self
            .nodes
            .get(node as usize)
            .ok_or(TransportError::UnknownNode(node))?;
        let base = n.next_chunk.fetch_add(CHUNK_SIZE, Ordering::AcqRel);
        if base + CHUNK_SIZE > self.main_size {
            return Err(TransportError::Exhausted(node));
        }
        Ok(GlobalAddress::new(node, base))
    }

    fn node_count(&self) -> u16 {
        self.nodes.len() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> LoopbackTransport {
        let t = LoopbackTransport::new(&DsmConfig {
            memory_nodes: 2,
            ..Default::default()
        });
        t.register_thread(0);
        t
    }

    #[test]
    fn write_read_round_trip_unaligned() {
        let t = transport();
        let addr = GlobalAddress::new(1, 0x103);
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        t.write(0, Space::Main, &data, addr, None).unwrap();
        let mut back = [0u8; 11];
        t.read(0, Space::Main, &mut back, addr, None).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn cas_succeeds_once() {
        let t = transport();
        let addr = GlobalAddress::new(0, 0x200);
        let mut old = 0;
        t.cas(0, Space::Main, addr, 0, 7, &mut old, None).unwrap();
        assert_eq!(old, 0);
        t.cas(0, Space::Main, addr, 0, 9, &mut old, None).unwrap();
        assert_eq!(old, 7); // lost the race with the first CAS
    }

    #[test]
    fn masked_cas_touches_only_masked_bits() {
        let t = transport();
        let addr = GlobalAddress::new(0, 0x208);
        t.write(0, Space::Main, &0xaabb_ccdd_0000_0000u64.to_le_bytes(), addr, None)
            .unwrap();
        let mut old = 0;
        let mask = 0xff;
        t.cas_mask(0, Space::Main, addr, 0, 0x42, mask, &mut old, None)
            .unwrap();
        assert_eq!(old & mask, 0);
        let mut back = [0u8; 8];
        t.read(0, Space::Main, &mut back, addr, None).unwrap();
        assert_eq!(u64::from_le_bytes(back), 0xaabb_ccdd_0000_0042);
    }

    #[test]
    fn unaligned_atomics_are_rejected() {
        let t = transport();
        let mut old = 0;
        let err = t
            .cas(0, Space::Main, GlobalAddress::new(0, 0x201), 0, 1, &mut old, None)
            .unwrap_err();
        assert_eq!(err, TransportError::Unaligned(GlobalAddress::new(0, 0x201)));
    }

    #[test]
    fn on_chip_space_is_disjoint() {
        let t = transport();
        let addr = GlobalAddress::new(0, 0x40);
        let mut old = 0;
        t.cas_mask(0, Space::OnChip, addr, 0, !0u64, 1 << 5, &mut old, None)
            .unwrap();
        let mut main = [0u8; 8];
        t.read(0, Space::Main, &mut main, addr, None).unwrap();
        assert_eq!(u64::from_le_bytes(main), 0);
        let mut chip = [0u8; 8];
        t.read(0, Space::OnChip, &mut chip, addr, None).unwrap();
        assert_eq!(u64::from_le_bytes(chip), 1 << 5);
    }

    #[test]
    fn completions_arrive_in_post_order() {
        let t = transport();
        let addr = GlobalAddress::new(0, 0x300);
        t.write(0, Space::Main, &[1], addr, Some(3)).unwrap();
        t.write(0, Space::Main, &[2], addr, None).unwrap();
        t.write(0, Space::Main, &[3], addr, Some(5)).unwrap();
        assert_eq!(t.poll_once(0), Some(3));
        assert_eq!(t.poll_once(0), Some(5));
        assert_eq!(t.poll_once(0), None);
    }

    #[test]
    fn chunk_grants_bump_until_exhaustion() {
        let cfg = DsmConfig {
            memory_nodes: 1,
            main_size: 3 * CHUNK_SIZE,
            ..Default::default()
        };
        let t = LoopbackTransport::new(&cfg);
        assert_eq!(t.grant_chunk(0, 0).unwrap().offset, CHUNK_SIZE);
        assert_eq!(t.grant_chunk(0, 0).unwrap().offset, 2 * CHUNK_SIZE);
        assert!(matches!(
            t.grant_chunk(0, 0),
            Err(TransportError::Exhausted(0))
        ));
    }

    #[test]
    fn batched_reads_signal_once() {
        let t = transport();
        let a = GlobalAddress::new(0, 0x400);
        let b = GlobalAddress::new(0, 0x500);
        t.write(0, Space::Main, &[7u8; 8], a, None).unwrap();
        t.write(0, Space::Main, &[9u8; 8], b, None).unwrap();
        let mut b1 = [0u8; 8];
        let mut b2 = [0u8; 8];
        {
            let mut ops = [(&mut b1[..], a), (&mut b2[..], b)];
            t.read_batch(0, Space::Main, &mut ops, Some(1)).unwrap();
        }
        assert_eq!(b1, [7u8; 8]);
        assert_eq!(b2, [9u8; 8]);
        assert_eq!(t.poll_once(0), Some(1));
        assert_eq!(t.poll_once(0), None);
    }
}
