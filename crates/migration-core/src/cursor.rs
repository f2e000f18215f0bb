//! `DeviceCursor` — per-device migration state (spec.md §3, §4.2).

use std::sync::Arc;

use crate::bitmap::ChunkBitmap;
use crate::traits::BlockDevice;

/// Per-device state tracked by the engine for the lifetime of a migration
/// session.
///
/// Invariants (spec.md §3): `bulk_cursor <= total_sectors`; once
/// `bulk_completed`, `bulk_cursor == total_sectors`; `completed_sectors` is
/// non-decreasing; the in-flight bit for a chunk is set exactly between
/// submission and completion of its async read.
pub struct DeviceCursor {
    /// Underlying block device handle. Non-owning in the sense that the
    /// engine does not assume exclusive ownership, but it does hold the
    /// block-layer reference for the life of the migration (spec.md §4.2).
    pub device: Arc<dyn BlockDevice>,

    /// Total sector count, immutable after registration.
    pub total_sectors: u64,

    /// Next sector to bulk-copy; chunk-aligned after the first advance.
    pub bulk_cursor: u64,

    /// Next sector to scan for a dirty bit.
    pub dirty_cursor: u64,

    /// Monotonic count of sectors whose current content has been sent.
    pub completed_sectors: u64,

    /// Set once the bulk phase has covered the whole device.
    pub bulk_completed: bool,

    /// Shared-base mode: unallocated runs are skipped during bulk.
    pub shared_base: bool,

    /// Sparse mode: all-zero chunks are elided during bulk.
    pub sparse_enable: bool,

    /// Chunks with a read currently in flight.
    pub in_flight: ChunkBitmap,
}

impl DeviceCursor {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        total_sectors: u64,
        sectors_per_chunk: u64,
        shared_base: bool,
        sparse_enable: bool,
    ) -> Self {
        Self {
            device,
            total_sectors,
            bulk_cursor: 0,
            dirty_cursor: 0,
            completed_sectors: 0,
            bulk_completed: total_sectors == 0,
            shared_base,
            sparse_enable,
            in_flight: ChunkBitmap::new(total_sectors, sectors_per_chunk),
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Bytes already sent for this device, for progress accounting.
    pub fn completed_bytes(&self, sector_bits: u32) -> u64 {
        self.completed_sectors << sector_bits
    }
}
