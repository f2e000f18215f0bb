//! Collaborator interfaces required from the block driver, the transport,
//! and the clock (spec.md §6.1). These are out of scope for this crate's
//! implementation — only the interfaces the core consumes are defined here.

use async_trait::async_trait;

/// Result of probing whether a run of sectors is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationProbe {
    pub allocated: bool,
    pub run_sectors: u64,
}

/// A writable block device handle, as exposed by the block driver
/// abstraction (spec.md §6.1). Implementations are expected to be cheaply
/// cloneable handles (an `Arc`-backed resource), since `DeviceCursor` and
/// `PendingRead` both hold a reference to one.
#[async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Stable name used on the wire (spec.md §4.7, §4.10).
    fn name(&self) -> &str;

    /// Total device length in sectors.
    fn length_sectors(&self, sector_bits: u32) -> u64;

    /// Whether the device is read-only (read-only devices are skipped
    /// during enumeration, spec.md §4.2).
    fn read_only(&self) -> bool;

    /// Probe whether `sector` is allocated, and how long the matching run
    /// (allocated or not, whichever `sector` starts) extends, capped at
    /// `max_search` sectors.
    async fn is_allocated(&self, sector: u64, max_search: u64) -> AllocationProbe;

    /// Synchronous read of `n` sectors starting at `sector` into `buf`.
    /// Used by the receiver (to write, via [`BlockDevice::write`]) and by
    /// the synchronous dirty-drain in `complete` (spec.md §4.9).
    async fn read(&self, sector: u64, buf: &mut [u8], n: u64) -> anyhow::Result<()>;

    /// Write `n` sectors starting at `sector` from `buf` (receiver side).
    async fn write(&self, sector: u64, buf: &[u8], n: u64) -> anyhow::Result<()>;

    /// Enable or disable dirty-bit tracking for this device.
    async fn set_dirty_tracking(&self, enable: bool);

    /// Whether the chunk containing `sector` is marked dirty.
    async fn get_dirty(&self, sector: u64) -> bool;

    /// Clear the dirty bit for chunks touched by `[sector, sector + n)`.
    /// Must be atomic with respect to concurrent dirty-bit setting by guest
    /// writes (spec.md §5, "shared-resource policy").
    async fn reset_dirty(&self, sector: u64, n: u64);

    /// Count of chunks currently marked dirty.
    async fn dirty_count(&self) -> u64;

    /// Mark the device "in use" (or not) to the block layer.
    fn set_in_use(&self, in_use: bool);
}

/// A rate-limited byte-stream sink/source (spec.md §6.1).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn put_u64_be(&mut self, word: u64) -> anyhow::Result<()>;
    async fn put_u8(&mut self, byte: u8) -> anyhow::Result<()>;
    async fn put_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
    async fn flush(&mut self) -> anyhow::Result<()>;

    async fn get_u64_be(&mut self) -> anyhow::Result<u64>;
    async fn get_u8(&mut self) -> anyhow::Result<u8>;
    async fn get_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Whether the transport is currently over its rate-limit window.
    fn rate_limited(&self) -> bool;

    /// Bytes allowed per rate-limit window.
    fn rate_limit_window_bytes(&self) -> u64;

    /// Any error observed by the transport since the last check.
    fn error(&self) -> Option<anyhow::Error>;
}

/// Monotonic clock (spec.md §6.1). Kept as a trait (rather than calling
/// `std::time::Instant::now()` directly) so tests can control elapsed time
/// deterministically.
pub trait Clock: Send + Sync {
    fn monotonic_nanos(&self) -> u64;
}

/// The real wall-clock `Clock` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic_nanos(&self) -> u64 {
        use std::time::Instant;
        // There is no fixed epoch for `Instant`; callers only ever take
        // differences between two readings, so an arbitrary process-local
        // origin is fine.
        static ORIGIN: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let origin = *ORIGIN.get_or_init(Instant::now);
        Instant::now().duration_since(origin).as_nanos() as u64
    }
}
