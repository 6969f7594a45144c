//! # Record Pool
//!
//! Chunked allocator for fixed-size record slots. Records must keep a
//! stable address from insertion until deletion, because every index and
//! the signal list refer to records by pointer. The pool therefore hands
//! out slots from heap chunks that are never moved or shrunk: growing the
//! chunk list relocates the `Box` handles, not the chunk bytes.
//!
//! ## Slot Layout
//!
//! Slots are padded to an 8-byte stride so that the signal index can read
//! the aligned machine word containing any field without touching a
//! neighboring slot. Freed slots go to a free list and are reused before
//! a chunk grows.
//!
//! Chunks target 16 KiB, matching the page granularity the rest of the
//! engine family uses, with at least one slot per chunk for oversized
//! records.

use hashbrown::HashSet;

const CHUNK_TARGET_BYTES: usize = 16 * 1024;

pub(crate) struct RecordPool {
    slot_size: usize,
    slots_per_chunk: usize,
    chunks: Vec<Box<[u8]>>,
    free: Vec<*mut u8>,
    live: HashSet<*mut u8>,
    next_in_chunk: usize,
}

impl RecordPool {
    pub fn new(record_size: usize) -> Self {
        assert!(record_size > 0, "record size must be non-zero");
        let slot_size = record_size.div_ceil(8) * 8;
        let slots_per_chunk = (CHUNK_TARGET_BYTES / slot_size).max(1);

        RecordPool {
            slot_size,
            slots_per_chunk,
            chunks: Vec::new(),
            free: Vec::new(),
            live: HashSet::new(),
            next_in_chunk: 0,
        }
    }

    /// Padded slot stride, a multiple of 8 covering the record size.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Acquires a zeroed slot with a stable address.
    pub fn acquire(&mut self) -> *mut u8 {
        let slot = if let Some(slot) = self.free.pop() {
            // Reused slots carry stale bytes from their previous record.
            unsafe { std::ptr::write_bytes(slot, 0, self.slot_size) };
            slot
        } else {
            if self.chunks.is_empty() || self.next_in_chunk >= self.slots_per_chunk {
                self.chunks
                    .push(vec![0u8; self.slot_size * self.slots_per_chunk].into_boxed_slice());
                self.next_in_chunk = 0;
            }

            let chunk = self.chunks.last_mut().expect("chunk just ensured");
            let offset = self.next_in_chunk * self.slot_size;
            self.next_in_chunk += 1;
            unsafe { chunk.as_mut_ptr().add(offset) }
        };

        self.live.insert(slot);
        slot
    }

    /// Returns a slot to the free list.
    ///
    /// The caller guarantees `slot` came from `acquire` and is not
    /// referenced by any index afterwards.
    pub fn release(&mut self, slot: *mut u8) {
        let was_live = self.live.remove(&slot);
        assert!(was_live, "released a pointer the pool does not own");
        self.free.push(slot);
    }

    /// Iterates live slots in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = *mut u8> + '_ {
        self.live.iter().copied()
    }
}
