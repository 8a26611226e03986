//! One-sided remote memory verbs consumed by the index core.
//!
//! The index never runs logic on a memory node: everything it does is a
//! read, write, (masked) compare-and-swap or fetch-and-add against one of
//! two flat address spaces per node, plus one RPC that grants allocation
//! chunks. Verbs are posted per registered client thread; a signaled verb
//! carries a work id that its completion hands back through the polling
//! surface. Completion data (read buffers, CAS old values) is valid once
//! the verb's completion has been polled.

pub mod loopback;

use crate::addr::GlobalAddress;
use crate::error::TransportResult;

/// Which remote address space a verb targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Bulk memory holding pages and leaves.
    Main,
    /// Small word-addressable device memory holding the leaf lock bits.
    OnChip,
}

/// Work id carried by a signaled verb.
pub type WrId = u64;

/// The one-sided verb surface of a memory pool.
pub trait RemoteMemory: Send + Sync {
    /// Register a client thread; `tid` keys its completion queue.
    fn register_thread(&self, tid: u16);

    fn read(
        &self,
        tid: u16,
        space: Space,
        buf: &mut [u8],
        addr: GlobalAddress,
        signal: Option<WrId>,
    ) -> TransportResult<()>;

    fn write(
        &self,
        tid: u16,
        space: Space,
        buf: &[u8],
        addr: GlobalAddress,
        signal: Option<WrId>,
    ) -> TransportResult<()>;

    /// Masked compare-and-swap of one aligned 64-bit word: the compare and
    /// the swap both apply only under `mask`. The pre-image lands in `old`.
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
    ) -> TransportResult<()>;

    /// Fetch-and-add confined to the field selected by `mask`; carries do
    /// not propagate past the mask boundary.
    fn faa_boundary(
        &self,
        tid: u16,
        space: Space,
        addr: GlobalAddress,
        delta: u64,
        mask: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()>;

    /// Block until `count` completions of this thread have been consumed.
    fn poll(&self, tid: u16, count: usize);

    /// Consume one completion if present.
    fn poll_once(&self, tid: u16) -> Option<WrId>;

    /// Consume up to `out.len()` completions; returns how many.
    fn poll_batch(&self, tid: u16, out: &mut [WrId]) -> usize;

    /// Allocator RPC: a fresh chunk in `node`'s main space.
    fn grant_chunk(&self, node: u16, dir: usize) -> TransportResult<GlobalAddress>;

    fn node_count(&self) -> u16;

    // ---- provided combinations (doorbell batches and paired verbs) ----

    fn cas(
        &self,
        tid: u16,
        space: Space,
        addr: GlobalAddress,
        expected: u64,
        new: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.cas_mask(tid, space, addr, expected, new, !0u64, old, signal)
    }

    /// Post every read, signaling only the last one.
    fn read_batch(
        &self,
        tid: u16,
        space: Space,
        ops: &mut [(&mut [u8], GlobalAddress)],
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        let n = ops.len();
        for (i, (buf, addr)) in ops.iter_mut().enumerate() {
            let s = if i + 1 == n { signal } else { None };
            self.read(tid, space, buf, *addr, s)?;
        }
        Ok(())
    }

    /// Post every write, signaling only the last one.
    fn write_batch(
        &self,
        tid: u16,
        space: Space,
        ops: &[(&[u8], GlobalAddress)],
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        let n = ops.len();
        for (i, (buf, addr)) in ops.iter().enumerate() {
            let s = if i + 1 == n { signal } else { None };
            self.write(tid, space, buf, *addr, s)?;
        }
        Ok(())
    }

    /// Write then masked-CAS, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn write_cas_mask(
        &self,
        tid: u16,
        write_buf: &[u8],
        write_addr: GlobalAddress,
        cas_space: Space,
        cas_addr: GlobalAddress,
        expected: u64,
        new: u64,
        mask: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.write(tid, Space::Main, write_buf, write_addr, None)?;
        self.cas_mask(tid, cas_space, cas_addr, expected, new, mask, old, signal)
    }

    /// Write then CAS, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn write_cas(
        &self,
        tid: u16,
        write_buf: &[u8],
        write_addr: GlobalAddress,
        cas_addr: GlobalAddress,
        expected: u64,
        new: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.write(tid, Space::Main, write_buf, write_addr, None)?;
        self.cas_mask(tid, Space::Main, cas_addr, expected, new, !0u64, old, signal)
    }

    /// Write then fetch-and-add, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn write_faa(
        &self,
        tid: u16,
        write_buf: &[u8],
        write_addr: GlobalAddress,
        faa_addr: GlobalAddress,
        delta: u64,
        mask: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.write(tid, Space::Main, write_buf, write_addr, None)?;
        self.faa_boundary(tid, Space::Main, faa_addr, delta, mask, old, signal)
    }

    /// CAS then read, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn cas_read(
        &self,
        tid: u16,
        cas_addr: GlobalAddress,
        expected: u64,
        new: u64,
        old: &mut u64,
        read_buf: &mut [u8],
        read_addr: GlobalAddress,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.cas_mask(tid, Space::Main, cas_addr, expected, new, !0u64, old, None)?;
        self.read(tid, Space::Main, read_buf, read_addr, signal)
    }

    /// Read then CAS, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn read_cas(
        &self,
        tid: u16,
        read_buf: &mut [u8],
        read_addr: GlobalAddress,
        cas_addr: GlobalAddress,
        expected: u64,
        new: u64,
        old: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.read(tid, Space::Main, read_buf, read_addr, None)?;
        self.cas_mask(tid, Space::Main, cas_addr, expected, new, !0u64, old, signal)
    }

    /// CAS then write, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn cas_write(
        &self,
        tid: u16,
        cas_addr: GlobalAddress,
        expected: u64,
        new: u64,
        old: &mut u64,
        write_buf: &[u8],
        write_addr: GlobalAddress,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.cas_mask(tid, Space::Main, cas_addr, expected, new, !0u64, old, None)?;
        self.write(tid, Space::Main, write_buf, write_addr, signal)
    }

    /// Two masked CASes back to back, one completion for the pair.
    #[allow(clippy::too_many_arguments)]
    fn two_cas_mask(
        &self,
        tid: u16,
        addr_1: GlobalAddress,
        expected_1: u64,
        new_1: u64,
        mask_1: u64,
        old_1: &mut u64,
        addr_2: GlobalAddress,
        expected_2: u64,
        new_2: u64,
        mask_2: u64,
        old_2: &mut u64,
        signal: Option<WrId>,
    ) -> TransportResult<()> {
        self.cas_mask(tid, Space::Main, addr_1, expected_1, new_1, mask_1, old_1, None)?;
        self.cas_mask(tid, Space::Main, addr_2, expected_2, new_2, mask_2, old_2, signal)
    }
}
