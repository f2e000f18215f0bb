//! End-to-end scenarios S1-S6 from spec.md §8, driven against the
//! in-memory mocks.

use std::sync::Arc;

use migration_core::{BlockDevice, EngineConfig, MigrationEngine, Receiver};
use migration_sim::{MemBlockDevice, MemTransport, SimClock};

fn test_config(sectors_per_chunk: u64, shared: bool, sparse: bool) -> EngineConfig {
    EngineConfig {
        sector_bits: 9,
        sectors_per_chunk,
        is_allocated_max_search: 65536,
        blk: true,
        shared,
        sparse,
    }
}

async fn run_until_converged(
    engine: &mut MigrationEngine,
    transport: &mut MemTransport,
    max_rounds: u32,
) -> bool {
    for _ in 0..max_rounds {
        let converged = engine.iterate(transport, 1.0).await.unwrap();
        transport.reset_window();
        if converged {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn s1_all_zero_device_sparse_elides_bulk_frames() {
    let sectors_per_chunk = 8u64;
    let config = test_config(sectors_per_chunk, false, true);
    let src = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 3, 9, sectors_per_chunk));

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::new();

    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();

    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();
    engine.complete(&mut transport).await.unwrap();

    // No device-block payload should ever have entered the wire: every
    // frame on the buffer is either a PROGRESS (8 bytes) or EOS (8 bytes)
    // header, so the buffered byte count must be a multiple of 8 with no
    // device-name/payload bytes mixed in.
    assert_eq!(transport.bytes_buffered() % 8, 0);

    let dst = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 3, 9, sectors_per_chunk));
    let mut receiver = Receiver::new(9, sectors_per_chunk, vec![dst.clone() as Arc<dyn BlockDevice>]);
    let percent = receiver.run(&mut transport).await.unwrap();

    assert_eq!(percent, Some(100));
    assert_eq!(dst.snapshot().await, src.snapshot().await);
}

#[tokio::test]
async fn s2_nonzero_single_chunk_device_transfers_payload() {
    let sectors_per_chunk = 8u64;
    let config = test_config(sectors_per_chunk, false, false);
    let src = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk, 9, sectors_per_chunk));
    src.write(0, &vec![0x5A; (sectors_per_chunk as usize) << 9], sectors_per_chunk)
        .await
        .unwrap();

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::new();

    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();
    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();
    engine.complete(&mut transport).await.unwrap();

    let dst = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk, 9, sectors_per_chunk));
    let mut receiver = Receiver::new(9, sectors_per_chunk, vec![dst.clone() as Arc<dyn BlockDevice>]);
    let percent = receiver.run(&mut transport).await.unwrap();

    assert_eq!(percent, Some(100));
    assert_eq!(dst.snapshot().await, src.snapshot().await);
    assert!(dst.snapshot().await.iter().all(|&b| b == 0x5A));
}

#[tokio::test]
async fn s3_guest_rewrite_is_recopied_in_dirty_phase() {
    let sectors_per_chunk = 8u64;
    let config = test_config(sectors_per_chunk, false, false);
    let src = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 2, 9, sectors_per_chunk));

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::new();

    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();

    // Drive bulk to completion first.
    loop {
        let converged = engine.iterate(&mut transport, 1.0).await.unwrap();
        transport.reset_window();
        if converged {
            break;
        }
    }

    // Now the guest rewrites chunk 0, after its bulk copy already went out.
    let rewrite = vec![0x7Eu8; (sectors_per_chunk as usize) << 9];
    src.guest_write(0, &rewrite).await;

    // The dirty phase should pick this up and resend it.
    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();
    engine.complete(&mut transport).await.unwrap();

    let dst = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 2, 9, sectors_per_chunk));
    let mut receiver = Receiver::new(9, sectors_per_chunk, vec![dst.clone() as Arc<dyn BlockDevice>]);
    receiver.run(&mut transport).await.unwrap();

    assert_eq!(dst.snapshot().await, src.snapshot().await);
    assert!(dst.snapshot().await[..rewrite.len()].iter().all(|&b| b == 0x7E));
}

#[tokio::test]
async fn s4_rate_limit_bounds_in_flight_plus_queued_bytes() {
    let sectors_per_chunk = 8u64;
    let chunk_bytes = sectors_per_chunk << 9;
    let config = test_config(sectors_per_chunk, false, false);
    // Four chunks total; window only allows two chunks' worth per round.
    let src = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 4, 9, sectors_per_chunk));

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::with_rate_limit(chunk_bytes * 2);

    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();

    let converged_after_one_round = engine.iterate(&mut transport, 1.0).await.unwrap();
    assert!(!converged_after_one_round, "four chunks cannot converge behind a two-chunk window in one round");

    transport.reset_window();
    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();
    engine.complete(&mut transport).await.unwrap();

    let dst = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 4, 9, sectors_per_chunk));
    let mut receiver = Receiver::new(9, sectors_per_chunk, vec![dst.clone() as Arc<dyn BlockDevice>]);
    receiver.run(&mut transport).await.unwrap();
    assert_eq!(dst.snapshot().await, src.snapshot().await);
}

#[tokio::test]
async fn s5_short_tail_device_writes_exact_remaining_sectors() {
    let sectors_per_chunk = 8u64;
    // 1.5 chunks: 12 sectors.
    let total_sectors = sectors_per_chunk + sectors_per_chunk / 2;
    let config = test_config(sectors_per_chunk, false, false);
    let src = Arc::new(MemBlockDevice::new("vda", total_sectors, 9, sectors_per_chunk));
    src.write(0, &vec![0x11; (total_sectors as usize) << 9], total_sectors)
        .await
        .unwrap();

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::new();
    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();
    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();
    engine.complete(&mut transport).await.unwrap();

    let dst = Arc::new(MemBlockDevice::new("vda", total_sectors, 9, sectors_per_chunk));
    let mut receiver = Receiver::new(9, sectors_per_chunk, vec![dst.clone() as Arc<dyn BlockDevice>]);
    receiver.run(&mut transport).await.unwrap();

    assert_eq!(dst.snapshot().await, src.snapshot().await);
    assert_eq!(dst.snapshot().await.len(), (total_sectors as usize) << 9);
}

#[tokio::test]
async fn s6_cancel_during_bulk_drains_and_releases_devices() {
    let sectors_per_chunk = 8u64;
    let config = test_config(sectors_per_chunk, false, false);
    let vda = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 4, 9, sectors_per_chunk));
    let vdb = Arc::new(MemBlockDevice::new("vdb", sectors_per_chunk * 4, 9, sectors_per_chunk));

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::new();
    let devices: Vec<Arc<dyn BlockDevice>> = vec![vda.clone(), vdb.clone()];
    engine.setup(devices, &mut transport).await.unwrap();

    assert!(vda.is_in_use().await);
    assert!(vdb.is_in_use().await);

    // Kick off some in-flight reads, then cancel mid-bulk.
    let _ = engine.iterate(&mut transport, 1.0).await.unwrap();
    engine.cancel().await;

    assert!(!vda.is_in_use().await);
    assert!(!vdb.is_in_use().await);
    assert!(!engine.active());

    // Engine is inert after cancel; a fresh setup must still work cleanly.
    let devices: Vec<Arc<dyn BlockDevice>> = vec![vda.clone()];
    engine.setup(devices, &mut transport).await.unwrap();
    assert!(engine.active());
}

#[tokio::test]
async fn s7_stage2_done_convergence_uses_injected_clock_throughput() {
    let sectors_per_chunk = 8u64;
    let chunk_bytes = sectors_per_chunk << 9;
    let config = test_config(sectors_per_chunk, false, false);
    let src = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 2, 9, sectors_per_chunk));

    let clock = Arc::new(SimClock::new());
    let mut engine = MigrationEngine::with_clock(config.clone(), clock.clone());
    let mut transport = MemTransport::new();

    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();

    // Both chunks are submitted within this single call (no rate limit);
    // the spawned reads cannot complete until the engine itself awaits the
    // completion channel, so the clock is still unadvanced at this point.
    let _ = engine.iterate(&mut transport, 1.0).await.unwrap();

    // Advance the clock by exactly 0.5s between submission and completion,
    // so the recorded read throughput is deterministic regardless of how
    // the two completions interleave: 2 chunks over 0.5s.
    clock.advance_millis(500);
    engine.drain_all().await.unwrap();

    // Re-dirty one chunk so remaining_dirty_bytes == chunk_bytes and
    // convergence must fall through to the throughput arithmetic instead of
    // short-circuiting on "no dirty data left".
    src.guest_write(0, &vec![0x42u8; chunk_bytes as usize]).await;

    let throughput = 2.0 * chunk_bytes as f64 / 0.5; // bytes/sec
    let time_needed = chunk_bytes as f64 / throughput; // == 0.25s

    assert!(engine.stage2_done(time_needed + 0.05).await);
    assert!(!engine.stage2_done(time_needed - 0.05).await);
}

#[tokio::test]
async fn s8_sparse_bulk_elides_but_dirty_phase_sends_zero_flag_on_rewrite() {
    let sectors_per_chunk = 8u64;
    let config = test_config(sectors_per_chunk, false, true);
    let src = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 3, 9, sectors_per_chunk));

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::new();

    let devices: Vec<Arc<dyn BlockDevice>> = vec![src.clone()];
    engine.setup(devices, &mut transport).await.unwrap();

    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();

    // Bulk phase elided every frame for this all-zero, sparse device: only
    // PROGRESS/EOS headers (multiples of 8 bytes) are on the wire so far.
    let baseline = transport.bytes_buffered();
    assert_eq!(baseline % 8, 0);

    // The guest rewrites chunk 0 with the same all-zero content. Dirty
    // tracking (enabled by setup) marks the chunk dirty even though its
    // bytes didn't change.
    let rewrite = vec![0u8; (sectors_per_chunk as usize) << 9];
    src.guest_write(0, &rewrite).await;

    assert!(run_until_converged(&mut engine, &mut transport, 16).await);
    engine.drain_all().await.unwrap();
    engine.complete(&mut transport).await.unwrap();

    // A dirty-phase resend of an all-zero chunk is never elided (elision is
    // bulk-only per spec.md §4.7): it still emits a `ZERO_BLOCK` frame —
    // header (8 bytes) + name length (1 byte) + "vda" (3 bytes), no
    // payload. That 12-byte frame is not a multiple of 8, unlike the
    // surrounding PROGRESS/EOS traffic, so its presence is visible as a
    // nonzero remainder on the total growth since the baseline.
    let grown = transport.bytes_buffered() - baseline;
    assert_eq!(grown % 8, 4, "expected exactly one 12-byte ZERO_BLOCK frame plus PROGRESS/EOS traffic");

    let dst = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 3, 9, sectors_per_chunk));
    let mut receiver = Receiver::new(9, sectors_per_chunk, vec![dst.clone() as Arc<dyn BlockDevice>]);
    receiver.run(&mut transport).await.unwrap();
    assert_eq!(dst.snapshot().await, src.snapshot().await);
}
