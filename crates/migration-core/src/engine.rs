//! `MigrationEngine` — orchestrates the sender-side lifecycle hooks
//! (spec.md §4.3-§4.9).

use std::cmp::min;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::cursor::DeviceCursor;
use crate::error::{MigrationError, Result};
use crate::queue::{PendingQueue, PendingRead};
use crate::traits::{BlockDevice, Clock, SystemClock, Transport};
use crate::wire::WireCodec;

/// A completed async read, tagged with which device cursor it belongs to.
struct ReadCompletion {
    device_index: usize,
    read: PendingRead,
}

/// Sender-side migration engine. Owns the device cursor list, the pending
/// send queue, and the throughput/counter bookkeeping of spec.md §3
/// (EngineState).
pub struct MigrationEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    codec: WireCodec,

    cursors: Vec<DeviceCursor>,
    pending: PendingQueue,

    /// Reads issued but not yet completed.
    submitted: u64,
    /// Completed reads not yet sent (must equal `pending.len()`).
    read_done: u64,
    /// Reads sent to the transport.
    transferred: u64,

    cumulative_read_nanos: u64,
    reads_completed: u64,
    last_timestamp_nanos: u64,

    bulk_completed: bool,
    last_progress_percent: u32,

    /// Set once `setup` has run to completion; cleared by `cancel`.
    /// `iterate`/`complete` reject calls made outside this window
    /// (spec.md §4.9, §7 `NotActive`).
    session_open: bool,

    completion_tx: mpsc::UnboundedSender<ReadCompletion>,
    completion_rx: mpsc::UnboundedReceiver<ReadCompletion>,
}

impl MigrationEngine {
    /// Construct an inert engine (no devices registered yet — call
    /// [`MigrationEngine::setup`] before `iterate`/`complete`).
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let codec = WireCodec::new(config.sector_bits);
        Self {
            config,
            clock,
            codec,
            cursors: Vec::new(),
            pending: PendingQueue::new(),
            submitted: 0,
            read_done: 0,
            transferred: 0,
            cumulative_read_nanos: 0,
            reads_completed: 0,
            last_timestamp_nanos: 0,
            bulk_completed: false,
            last_progress_percent: 0,
            session_open: false,
            completion_tx,
            completion_rx,
        }
    }

    // ---- Parameter surface (spec.md §6.3) ----------------------------

    /// Update the three migration-driver parameter booleans (spec.md
    /// §6.3's `set_params` hook). `shared`/`sparse` each imply `blk`, per
    /// [`EngineConfig::is_active`]. Cursors already registered by a prior
    /// `setup` keep the `shared_base`/`sparse_enable` flags they were
    /// constructed with; this only affects devices registered by the next
    /// `setup` call, matching the reference's global-flag semantics.
    pub fn set_params(&mut self, blk: bool, shared: bool, sparse: bool) {
        self.config.blk = blk;
        self.config.shared = shared;
        self.config.sparse = sparse;
    }

    // ---- Query functions (spec.md §6.2) -----------------------------

    /// True iff the device list is non-empty and any parameter bit is set
    /// (spec.md §9: "any nonzero" rather than strict equality).
    pub fn active(&self) -> bool {
        !self.cursors.is_empty() && self.config.is_active()
    }

    /// Alias for [`MigrationEngine::active`], named to match spec.md §6.2's
    /// `is_active` hook.
    pub fn is_active(&self) -> bool {
        self.active()
    }

    pub fn bytes_total(&self) -> u64 {
        self.cursors
            .iter()
            .map(|c| c.total_sectors << self.config.sector_bits)
            .sum()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.cursors
            .iter()
            .map(|c| c.completed_bytes(self.config.sector_bits))
            .sum()
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_total().saturating_sub(self.bytes_transferred())
    }

    // ---- Lifecycle hooks (spec.md §4.9) ------------------------------

    /// Register devices (spec.md §4.2), reset counters, enable dirty
    /// tracking, and emit the setup-phase `EOS` marker.
    pub async fn setup(
        &mut self,
        devices: Vec<Arc<dyn BlockDevice>>,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        info!("migration setup: {} candidate devices", devices.len());

        self.submitted = 0;
        self.read_done = 0;
        self.transferred = 0;
        self.cumulative_read_nanos = 0;
        self.reads_completed = 0;
        self.bulk_completed = false;
        self.last_progress_percent = 0;
        self.cursors.clear();
        self.pending = PendingQueue::new();

        // The reference calls flush_pending in setup before anything has
        // been read; harmless, retained for wire compatibility (spec.md §9).
        self.flush_pending(transport).await?;

        for device in devices {
            if device.read_only() {
                debug!(device = device.name(), "skipping read-only device");
                continue;
            }
            let total_sectors = device.length_sectors(self.config.sector_bits);
            if total_sectors == 0 {
                debug!(device = device.name(), "skipping non-positive length device");
                continue;
            }

            device.set_in_use(true);
            device.set_dirty_tracking(true).await;

            let cursor = DeviceCursor::new(
                device,
                total_sectors,
                self.config.sectors_per_chunk,
                self.config.shared,
                self.config.sparse,
            );
            info!(device = cursor.name(), total_sectors, "registered device for migration");
            self.cursors.push(cursor);
        }

        self.reset_dirty_cursors();
        self.codec.encode_eos(transport).await?;
        self.session_open = true;
        Ok(())
    }

    /// One iteration of the driver loop: drain sends subject to the rate
    /// limit, reset dirty cursors, then perform bulk or dirty steps until
    /// the rate-limit window is filled or there is no more dirty work,
    /// drain again, emit `EOS`, and report convergence.
    pub async fn iterate(
        &mut self,
        transport: &mut dyn Transport,
        max_downtime_seconds: f64,
    ) -> Result<bool> {
        if !self.session_open {
            return Err(MigrationError::NotActive);
        }

        self.drain_completions();
        self.flush_pending(transport).await?;
        self.reset_dirty_cursors();

        let chunk_bytes = self.config.chunk_bytes();
        let window = transport.rate_limit_window_bytes();

        loop {
            self.drain_completions();
            if (self.submitted + self.read_done).saturating_mul(chunk_bytes) >= window {
                break;
            }
            if !self.bulk_completed {
                let advanced = self.bulk_step().await?;
                if !advanced {
                    self.bulk_completed = true;
                    info!("bulk phase complete for all devices");
                }
            } else {
                let mut found_dirty = false;
                for idx in 0..self.cursors.len() {
                    if !self.dirty_step(idx, true, transport).await? {
                        found_dirty = true;
                        break;
                    }
                }
                if !found_dirty {
                    debug!("no dirty chunk found anywhere this pass");
                    break;
                }
            }
        }

        self.drain_completions();
        self.flush_pending(transport).await?;

        self.report_progress(transport).await?;
        self.codec.encode_eos(transport).await?;

        Ok(self.stage2_done(max_downtime_seconds).await)
    }

    /// Final, synchronous drain of remaining dirty chunks. The caller
    /// (migration driver) has paused the guest and awaited in-flight reads
    /// before calling this.
    pub async fn complete(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if !self.session_open {
            return Err(MigrationError::NotActive);
        }

        self.drain_completions();
        self.flush_pending(transport).await?;

        if self.submitted != 0 {
            return Err(MigrationError::InvariantViolation(format!(
                "complete() called with {} reads still in flight",
                self.submitted
            )));
        }

        self.reset_dirty_cursors();

        for idx in 0..self.cursors.len() {
            loop {
                let exhausted = self.dirty_step(idx, false, transport).await?;
                if exhausted {
                    break;
                }
            }
        }

        self.codec.encode_progress(transport, 100).await?;
        self.last_progress_percent = 100;
        self.codec.encode_eos(transport).await?;
        self.session_open = false;
        info!("migration complete");
        Ok(())
    }

    /// Cancel the migration session at any point and release all
    /// resources (spec.md §4.9, §5 "Cancellation").
    pub async fn cancel(&mut self) {
        warn!("migration cancelled, running cleanup");
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        // Drain in-flight reads before dropping cursors: completion
        // handlers reference the cursor by index, so cursors must outlive
        // every outstanding read (spec.md §5 "Cancellation").
        while self.submitted > 0 {
            match self.completion_rx.recv().await {
                Some(completion) => self.apply_completion(completion),
                None => break,
            }
        }
        for cursor in &self.cursors {
            cursor.device.set_dirty_tracking(false).await;
            cursor.device.set_in_use(false);
        }
        self.cursors.clear();
        self.pending = PendingQueue::new();
        self.read_done = 0;
        self.transferred = 0;
        self.session_open = false;
    }

    // ---- Internal phases (spec.md §4.3-§4.8) -------------------------

    fn reset_dirty_cursors(&mut self) {
        for cursor in &mut self.cursors {
            cursor.dirty_cursor = 0;
        }
    }

    /// Advance at most one chunk for the first device whose bulk phase is
    /// not yet complete. Returns `false` if every device has already
    /// completed bulk (nothing to advance).
    async fn bulk_step(&mut self) -> Result<bool> {
        let Some(idx) = self.cursors.iter().position(|c| !c.bulk_completed) else {
            return Ok(false);
        };

        let sectors_per_chunk = self.config.sectors_per_chunk;
        let max_search = self.config.is_allocated_max_search;
        let total = self.cursors[idx].total_sectors;
        let mut pos = self.cursors[idx].bulk_cursor;

        if self.cursors[idx].shared_base {
            let device = Arc::clone(&self.cursors[idx].device);
            while pos < total {
                let probe = device.is_allocated(pos, max_search).await;
                if probe.allocated {
                    break;
                }
                pos += probe.run_sectors.max(1);
            }
        }

        if pos >= total {
            let cursor = &mut self.cursors[idx];
            cursor.bulk_completed = true;
            cursor.bulk_cursor = total;
            cursor.completed_sectors = total;
            info!(device = cursor.name(), "bulk phase complete for device");
            return Ok(true);
        }

        let aligned = (pos / sectors_per_chunk) * sectors_per_chunk;
        let sector_count = min(sectors_per_chunk, total - aligned);

        self.cursors[idx].completed_sectors = pos;
        self.submit_read(idx, aligned, sector_count);
        self.cursors[idx].device.reset_dirty(aligned, sector_count).await;
        self.cursors[idx].bulk_cursor = aligned + sectors_per_chunk;

        Ok(true)
    }

    /// Scan forward from the device's dirty cursor for the next dirty
    /// chunk, copying it either asynchronously (pipelined) or
    /// synchronously (the `complete()` drain). Returns `true` iff the
    /// cursor has reached the end of the device for this pass.
    async fn dirty_step(
        &mut self,
        idx: usize,
        asynchronous: bool,
        transport: &mut dyn Transport,
    ) -> Result<bool> {
        let sectors_per_chunk = self.config.sectors_per_chunk;

        loop {
            let total = self.cursors[idx].total_sectors;
            let pos = self.cursors[idx].dirty_cursor;
            if pos >= total {
                return Ok(true);
            }

            if self.cursors[idx].in_flight.test(pos) {
                debug!(device = self.cursors[idx].name(), sector = pos, "chunk in flight, draining");
                self.drain_all().await?;
                continue;
            }

            let dirty = self.cursors[idx].device.get_dirty(pos).await;
            if !dirty {
                self.cursors[idx].dirty_cursor = pos + sectors_per_chunk;
                continue;
            }

            let sector_count = min(sectors_per_chunk, total - pos);

            if asynchronous {
                self.submit_read(idx, pos, sector_count);
            } else {
                let chunk_bytes = self.config.chunk_bytes();
                let device = Arc::clone(&self.cursors[idx].device);
                let mut read =
                    PendingRead::new(device.clone(), idx, pos, sector_count, chunk_bytes);
                device
                    .read(pos, &mut read.buffer, sector_count)
                    .await
                    .map_err(|source| MigrationError::block_read(device.name(), source))?;
                let still_bulk = !self.cursors[idx].bulk_completed;
                let sparse_enable = self.cursors[idx].sparse_enable;
                self.codec
                    .encode_device_block(transport, &read, sparse_enable, still_bulk)
                    .await?;
                self.transferred += 1;
            }

            self.cursors[idx].device.reset_dirty(pos, sector_count).await;
            self.cursors[idx].dirty_cursor = pos + sectors_per_chunk;
            return Ok(false);
        }
    }

    /// Drain the pending queue head-first, subject to the transport's rate
    /// limit (spec.md §4.6).
    async fn flush_pending(&mut self, transport: &mut dyn Transport) -> Result<()> {
        loop {
            if transport.rate_limited() {
                break;
            }
            let Some(front) = self.pending.front() else {
                break;
            };
            if front.result.is_err() {
                let read = self.pending.pop_front().expect("front just checked");
                self.read_done -= 1;
                let device_name = read.device.name().to_string();
                let err = read.result.unwrap_err();
                return Err(MigrationError::block_read(device_name, err));
            }

            let read = self.pending.pop_front().expect("front just checked");
            let still_bulk = !self.cursors[read.device_index].bulk_completed;
            let sparse_enable = self.cursors[read.device_index].sparse_enable;
            self.codec
                .encode_device_block(transport, &read, sparse_enable, still_bulk)
                .await?;
            self.read_done -= 1;
            self.transferred += 1;
        }
        Ok(())
    }

    /// Convergence predicate (spec.md §4.8): true iff the bulk phase is
    /// finished and either there is no remaining dirty data, or the
    /// remaining dirty bytes can be transferred within
    /// `max_downtime_seconds` at the recently observed read throughput.
    /// `max_downtime_seconds` is supplied per-call by the migration driver.
    pub async fn stage2_done(&self, max_downtime_seconds: f64) -> bool {
        if !self.bulk_completed {
            return false;
        }

        let chunk_bytes = self.config.chunk_bytes();
        let mut remaining_dirty_bytes: u64 = 0;
        for cursor in &self.cursors {
            remaining_dirty_bytes += cursor.device.dirty_count().await * chunk_bytes;
        }

        if remaining_dirty_bytes == 0 {
            return true;
        }

        let throughput = self.recent_read_throughput_bytes_per_second();
        if throughput <= 0.0 {
            return false;
        }

        (remaining_dirty_bytes as f64 / throughput) <= max_downtime_seconds
    }

    fn recent_read_throughput_bytes_per_second(&self) -> f64 {
        if self.cumulative_read_nanos == 0 {
            return 0.0;
        }
        let chunk_bytes = self.config.chunk_bytes() as f64;
        let seconds = self.cumulative_read_nanos as f64 / 1_000_000_000.0;
        (self.reads_completed as f64 * chunk_bytes) / seconds
    }

    async fn report_progress(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let total = self.bytes_total();
        let percent = if total == 0 {
            100
        } else {
            ((self.bytes_transferred() as u128 * 100) / total as u128) as u32
        };
        let percent = percent.clamp(self.last_progress_percent, 100);
        self.last_progress_percent = percent;
        self.codec.encode_progress(transport, percent).await
    }

    fn submit_read(&mut self, idx: usize, sector: u64, sector_count: u64) {
        let chunk_bytes = self.config.chunk_bytes();
        let device = Arc::clone(&self.cursors[idx].device);

        self.cursors[idx].in_flight.set(sector, sector_count, true);
        self.submitted += 1;
        if self.submitted == 1 {
            self.last_timestamp_nanos = self.clock.monotonic_nanos();
        }

        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let mut read = PendingRead::new(device.clone(), idx, sector, sector_count, chunk_bytes);
            read.result = device.read(sector, &mut read.buffer, sector_count).await;
            let _ = tx.send(ReadCompletion {
                device_index: idx,
                read,
            });
        });
    }

    /// Move any already-completed reads from the completion channel into
    /// the pending queue without blocking.
    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.apply_completion(completion);
        }
    }

    /// Block-layer-style drain: wait for all outstanding async reads to
    /// quiesce (spec.md §4.4, §6.1 `drain_all`). The migration driver is
    /// expected to call this (after pausing the guest) before `complete`,
    /// which asserts no reads remain in flight.
    pub async fn drain_all(&mut self) -> Result<()> {
        while self.submitted > 0 {
            match self.completion_rx.recv().await {
                Some(completion) => self.apply_completion(completion),
                None => break,
            }
        }
        Ok(())
    }

    fn apply_completion(&mut self, completion: ReadCompletion) {
        let ReadCompletion { device_index, read } = completion;
        self.cursors[device_index]
            .in_flight
            .set(read.sector, read.sector_count, false);
        self.submitted -= 1;

        let now = self.clock.monotonic_nanos();
        self.cumulative_read_nanos += now.saturating_sub(self.last_timestamp_nanos);
        self.last_timestamp_nanos = now;
        self.reads_completed += 1;

        self.read_done += 1;
        debug!(
            device = self.cursors[device_index].name(),
            sector = read.sector,
            "read completed"
        );
        self.pending.push(read);
    }
}
