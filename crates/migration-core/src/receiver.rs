//! `Receiver` — decodes the stream and applies writes to local block
//! devices (spec.md §4.10).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{MigrationError, Result};
use crate::traits::{BlockDevice, Transport};
use crate::wire::{DEVICE_BLOCK, EOS, PROGRESS, ZERO_BLOCK};

/// Receiver-side applier. Looks devices up by name as they appear on the
/// wire and caches each device's total sector count on name change, per
/// spec.md §4.10.
pub struct Receiver {
    sector_bits: u32,
    chunk_bytes: u64,
    devices: HashMap<String, Arc<dyn BlockDevice>>,
    last_device_name: Option<String>,
    last_device_total_sectors: u64,
    /// Scratch buffer reused across frames; only re-zeroed when the prior
    /// frame was non-zero, to avoid re-memset on long zero runs.
    scratch: Vec<u8>,
    scratch_is_zero: bool,
}

impl Receiver {
    pub fn new(sector_bits: u32, sectors_per_chunk: u64, devices: Vec<Arc<dyn BlockDevice>>) -> Self {
        let chunk_bytes = sectors_per_chunk << sector_bits;
        Self {
            sector_bits,
            chunk_bytes,
            devices: devices.into_iter().map(|d| (d.name().to_string(), d)).collect(),
            last_device_name: None,
            last_device_total_sectors: 0,
            scratch: vec![0u8; chunk_bytes as usize],
            scratch_is_zero: true,
        }
    }

    /// Alias for [`Receiver::run`], named to match spec.md §6.2's `load`
    /// hook (the migration driver's receiver-side entry point).
    pub async fn load(&mut self, transport: &mut dyn Transport) -> Result<Option<u32>> {
        self.run(transport).await
    }

    /// Run the decode loop until an `EOS` header is seen, applying every
    /// frame as it arrives. Returns the final rendered progress percentage,
    /// if any `PROGRESS` frames were seen.
    pub async fn run(&mut self, transport: &mut dyn Transport) -> Result<Option<u32>> {
        let mut last_percent = None;

        loop {
            let header = transport
                .get_u64_be()
                .await
                .map_err(MigrationError::transport)?;
            let flags = header & 0x0F;
            let address = (header & !0x0F) >> self.sector_bits;

            if flags & EOS != 0 {
                info!("received end-of-stream marker");
                self.check_transport_error(transport)?;
                return Ok(last_percent);
            } else if flags & DEVICE_BLOCK != 0 {
                let zero = flags & ZERO_BLOCK != 0;
                self.apply_device_block(transport, address, zero).await?;
            } else if flags & PROGRESS != 0 {
                let percent = address as u32;
                debug!(percent, "progress");
                last_percent = Some(percent);
            } else {
                return Err(MigrationError::MalformedFrame(format!(
                    "unrecognized flag bits: {flags:#x}"
                )));
            }

            self.check_transport_error(transport)?;
        }
    }

    fn check_transport_error(&self, transport: &dyn Transport) -> Result<()> {
        if let Some(err) = transport.error() {
            error!("transport reported an error: {err}");
            return Err(MigrationError::Transport(err.to_string()));
        }
        Ok(())
    }

    async fn apply_device_block(
        &mut self,
        transport: &mut dyn Transport,
        address: u64,
        zero: bool,
    ) -> Result<()> {
        let name_len = transport
            .get_u8()
            .await
            .map_err(MigrationError::transport)?;
        let mut name_buf = vec![0u8; name_len as usize];
        transport
            .get_bytes(&mut name_buf)
            .await
            .map_err(MigrationError::transport)?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        let device = self
            .devices
            .get(&name)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownDevice(name.clone()))?;

        if self.last_device_name.as_deref() != Some(name.as_str()) {
            self.last_device_total_sectors = device.length_sectors(self.sector_bits);
            self.last_device_name = Some(name.clone());
        }

        let sector_count = std::cmp::min(
            self.chunk_bytes >> self.sector_bits,
            self.last_device_total_sectors.saturating_sub(address),
        );

        if zero {
            if !self.scratch_is_zero {
                self.scratch.iter_mut().for_each(|b| *b = 0);
                self.scratch_is_zero = true;
            }
        } else {
            transport
                .get_bytes(&mut self.scratch)
                .await
                .map_err(MigrationError::transport)?;
            self.scratch_is_zero = false;
        }

        debug!(device = name.as_str(), sector = address, sector_count, zero, "applying device block");

        device
            .write(address, &self.scratch, sector_count)
            .await
            .map_err(|source| MigrationError::block_write(name, source))?;

        Ok(())
    }
}
