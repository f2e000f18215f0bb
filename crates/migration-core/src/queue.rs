//! `PendingQueue` / `PendingRead` — completed chunks awaiting transmission
//! (spec.md §3, §4.6).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::traits::BlockDevice;

/// A completed (or about-to-be-submitted) chunk read.
///
/// Per spec.md §9, a `PendingRead` is always fully initialized before an
/// async read is submitted — there is no partially-initialized state a
/// later error path could observe.
pub struct PendingRead {
    /// Owning device, kept as a cheap `Arc` clone rather than a raw
    /// back-reference (spec.md §9's "Cyclic pointers" note models this as a
    /// non-owning handle; an `Arc` clone is the safe Rust equivalent since
    /// the device outlives its pending reads during normal operation).
    pub device: Arc<dyn BlockDevice>,

    /// Index into the engine's device cursor list. Used to look up the
    /// owning cursor's flags (sparse/bulk state) without a back-pointer.
    pub device_index: usize,

    /// Starting sector of this chunk.
    pub sector: u64,

    /// Sector count actually valid in `buffer` (may be less than a full
    /// chunk for the final, short tail — spec.md §3 PendingRead).
    pub sector_count: u64,

    /// `CHUNK_BYTES`-sized buffer. Bytes beyond `sector_count` sectors are
    /// undefined and must not be relied upon by the receiver.
    pub buffer: Vec<u8>,

    /// Result of the read. `Ok(())` until the async read completes.
    pub result: anyhow::Result<()>,
}

impl PendingRead {
    /// Allocate a new, fully-initialized pending read ready for submission.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        device_index: usize,
        sector: u64,
        sector_count: u64,
        chunk_bytes: u64,
    ) -> Self {
        Self {
            device,
            device_index,
            sector,
            sector_count,
            buffer: vec![0u8; chunk_bytes as usize],
            result: Ok(()),
        }
    }
}

/// FIFO of completed reads awaiting transmission. Protects the ordering
/// guarantee of spec.md §5: "PendingReads are transmitted in
/// read-completion order."
#[derive(Default)]
pub struct PendingQueue {
    items: VecDeque<PendingRead>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, read: PendingRead) {
        self.items.push_back(read);
    }

    pub fn pop_front(&mut self) -> Option<PendingRead> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&PendingRead> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
