//! Scripted demo: drives a synthetic two-device migration end-to-end over
//! an in-memory transport and prints progress, the way a real migration
//! driver would call into `migration-core`'s lifecycle hooks. This is
//! test/demonstration tooling, not a hypervisor integration.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use migration_core::{EngineConfig, MigrationEngine, Receiver};
use migration_sim::{MemBlockDevice, MemTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,migration_core=debug")),
        )
        .init();

    info!("starting migsim scripted demo");

    let config = EngineConfig::from_env();
    let sectors_per_chunk = config.sectors_per_chunk;
    let sector_bits = config.sector_bits;

    let vda = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 3, sector_bits, sectors_per_chunk));
    let vdb = Arc::new(MemBlockDevice::new("vdb", sectors_per_chunk * 2, sector_bits, sectors_per_chunk));

    // Seed vda with non-zero content so bulk actually sends payload.
    vda.write(0, &vec![0xAB; (sectors_per_chunk as usize) << sector_bits], sectors_per_chunk)
        .await?;

    let devices: Vec<Arc<dyn migration_core::BlockDevice>> = vec![vda.clone(), vdb.clone()];

    let mut engine = MigrationEngine::new(config.clone());
    let mut transport = MemTransport::with_rate_limit(config.chunk_bytes() * 4);

    engine.setup(devices, &mut transport).await?;
    info!(bytes_total = engine.bytes_total(), "setup complete");

    let mut rounds = 0;
    loop {
        let converged = engine.iterate(&mut transport, 1.0).await?;
        rounds += 1;
        info!(
            rounds,
            transferred = engine.bytes_transferred(),
            total = engine.bytes_total(),
            converged,
            "iterate complete"
        );
        transport.reset_window();
        if converged || rounds > 32 {
            break;
        }
    }

    // Simulate the guest being paused by the outer driver, then run the
    // final synchronous drain.
    engine.drain_all().await?;
    engine.complete(&mut transport).await?;
    info!("sender complete, decoding on receiver side");

    // A fresh, pre-zeroed destination, as a real migration target would be.
    let dst_vda = Arc::new(MemBlockDevice::new("vda", sectors_per_chunk * 3, sector_bits, sectors_per_chunk));
    let dst_vdb = Arc::new(MemBlockDevice::new("vdb", sectors_per_chunk * 2, sector_bits, sectors_per_chunk));
    let receiver_devices: Vec<Arc<dyn migration_core::BlockDevice>> = vec![dst_vda.clone(), dst_vdb.clone()];
    let mut receiver = Receiver::new(sector_bits, sectors_per_chunk, receiver_devices);
    let final_percent = receiver.run(&mut transport).await?;

    let converged = dst_vda.snapshot().await == vda.snapshot().await && dst_vdb.snapshot().await == vdb.snapshot().await;
    info!(final_percent, converged, "migsim demo finished");
    Ok(())
}
