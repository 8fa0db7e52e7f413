//! Fixed-block buffer pool backing all two-sided RDMA traffic.
//!
//! The pool is one contiguous page-aligned region carved into `2^(pool_bits
//! - block_bits)` equal blocks, so a single memory-region registration
//! covers every block a connection can post. Allocation hands out an
//! [`OwnedBlock`] that exclusively owns its slab and re-links it onto the
//! free list when dropped, from any thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::region::SharedRegion;

/// Length prefix of the on-wire message frame, in bytes.
const LENGTH_PREFIX_BYTES: usize = 4;

struct PoolInner {
    region: SharedRegion,
    block_size: usize,
    block_count: usize,
    free: Mutex<Vec<u32>>,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Builds a pool of `2^pool_bits` bytes split into `2^block_bits`-byte
    /// blocks. Panics when the parameters cannot form at least one block
    /// large enough to hold a message frame.
    pub fn new(pool_bits: u32, block_bits: u32) -> Self {
        assert!(pool_bits >= block_bits, "pool must hold at least one block");
        assert!(
            (1_usize << block_bits) > LENGTH_PREFIX_BYTES,
            "blocks must be larger than the length prefix"
        );
        let block_size = 1_usize << block_bits;
        let block_count = 1_usize << (pool_bits - block_bits);
        let region = SharedRegion::new(block_size * block_count);
        let free = (0..block_count as u32).rev().collect();
        Self {
            inner: Arc::new(PoolInner {
                region,
                block_size,
                block_count,
                free: Mutex::new(free),
            }),
        }
    }

    /// Takes one block off the free list, or `None` when the pool is empty.
    pub fn allocate(&self) -> Option<OwnedBlock> {
        let index = self.inner.free.lock().pop()?;
        Some(OwnedBlock {
            pool: Arc::clone(&self.inner),
            index,
        })
    }

    /// Base address of the backing region, for memory registration.
    pub fn region_addr(&self) -> usize {
        self.inner.region.as_ptr() as usize
    }

    /// Total size of the backing region in bytes.
    pub fn region_len(&self) -> usize {
        self.inner.region.len()
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn block_count(&self) -> usize {
        self.inner.block_count
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// Exclusive handle to one pool block. Movable, not clonable; dropping it
/// returns the slab to the pool.
pub struct OwnedBlock {
    pool: Arc<PoolInner>,
    index: u32,
}

// SAFETY: each block index is handed out at most once, so the owner has
// exclusive access to its slab of the shared region.
unsafe impl Send for OwnedBlock {}

impl OwnedBlock {
    /// Address of the block inside the registered region.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.pool.region.as_ptr() as u64 + (self.index as u64) * self.pool.block_size as u64
    }

    /// Capacity of the block in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.pool.block_size
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the slab is exclusively owned (see struct invariant) and
        // lives as long as the pool, which we keep alive through `pool`.
        unsafe { std::slice::from_raw_parts_mut(self.addr() as *mut u8, self.pool.block_size) }
    }

    /// Structured view of the block: length prefix plus payload.
    pub fn message_view(&mut self) -> MessageView<'_> {
        MessageView {
            bytes: self.as_mut_slice(),
        }
    }
}

impl Drop for OwnedBlock {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.index);
    }
}

/// View of a block as a length-prefixed message frame: a 4-byte
/// little-endian payload length followed by the payload bytes.
pub struct MessageView<'a> {
    bytes: &'a mut [u8],
}

impl MessageView<'_> {
    pub const LENGTH_PREFIX_BYTES: usize = LENGTH_PREFIX_BYTES;

    /// Payload length recorded in the prefix.
    pub fn payload_len(&self) -> usize {
        u32::from_le_bytes(self.bytes[..4].try_into().expect("prefix length")) as usize
    }

    /// Records `len` in the prefix. Panics when `len` exceeds the capacity.
    pub fn set_payload_len(&mut self, len: usize) {
        assert!(len <= self.max_payload(), "payload exceeds block capacity");
        self.bytes[..4].copy_from_slice(&(len as u32).to_le_bytes());
    }

    /// Total frame length on the wire: prefix plus payload.
    pub fn frame_len(&self) -> usize {
        Self::LENGTH_PREFIX_BYTES + self.payload_len()
    }

    /// Largest payload this block can carry.
    pub fn max_payload(&self) -> usize {
        self.bytes.len() - Self::LENGTH_PREFIX_BYTES
    }

    /// Payload bytes, bounded by the recorded length.
    pub fn payload(&self) -> &[u8] {
        let len = self.payload_len().min(self.max_payload());
        &self.bytes[Self::LENGTH_PREFIX_BYTES..Self::LENGTH_PREFIX_BYTES + len]
    }

    /// Address of the first payload byte, for scatter-gather entries that
    /// bypass the prefix.
    pub fn payload_addr(&self) -> u64 {
        self.bytes.as_ptr() as u64 + Self::LENGTH_PREFIX_BYTES as u64
    }

    /// Copies `data` into the payload and records its length.
    pub fn write_payload(&mut self, data: &[u8]) {
        self.set_payload_len(data.len());
        self.bytes[Self::LENGTH_PREFIX_BYTES..Self::LENGTH_PREFIX_BYTES + data.len()]
            .copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;

    #[test]
    fn allocates_every_block_then_runs_dry() {
        let pool = BufferPool::new(16, 12);
        assert_eq!(pool.block_count(), 16);

        let mut held = Vec::new();
        while let Some(block) = pool.allocate() {
            held.push(block);
        }
        assert_eq!(held.len(), 16);
        assert_eq!(pool.free_blocks(), 0);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn dropped_blocks_return_to_the_free_list() {
        let pool = BufferPool::new(14, 12);
        let before = pool.free_blocks();
        {
            let _a = pool.allocate().expect("block");
            let _b = pool.allocate().expect("block");
            assert_eq!(pool.free_blocks(), before - 2);
        }
        assert_eq!(pool.free_blocks(), before);
    }

    #[test]
    fn blocks_are_disjoint_and_inside_the_region() {
        let pool = BufferPool::new(15, 12);
        let blocks: Vec<_> = (0..pool.block_count())
            .map(|_| pool.allocate().expect("block"))
            .collect();

        let base = pool.region_addr() as u64;
        let end = base + pool.region_len() as u64;
        let mut addrs: Vec<u64> = blocks.iter().map(|b| b.addr()).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), blocks.len());
        for addr in addrs {
            assert!(addr >= base && addr + pool.block_size() as u64 <= end);
        }
    }

    #[test]
    fn message_view_roundtrips_payload() {
        let pool = BufferPool::new(13, 12);
        let mut block = pool.allocate().expect("block");
        let block_addr = block.addr();
        let mut view = block.message_view();

        let payload: Vec<u8> = (0..64_u8).collect();
        view.write_payload(&payload);
        assert_eq!(view.payload_len(), 64);
        assert_eq!(view.frame_len(), 68);
        assert_eq!(view.payload(), payload.as_slice());
        assert_eq!(view.payload_addr(), block_addr + 4);
    }

    #[test]
    fn allocation_is_thread_safe() {
        let pool = BufferPool::new(16, 10);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let block = pool.allocate();
                        drop(block);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(pool.free_blocks(), pool.block_count());
    }
}
