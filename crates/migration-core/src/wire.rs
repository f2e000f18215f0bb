//! `WireCodec` — frame header packing, zero-block detection, and
//! encode/decode of device-block, progress, and end-of-stream frames
//! (spec.md §4.7, §6.4).

use crate::error::{MigrationError, Result};
use crate::queue::PendingRead;
use crate::traits::Transport;

/// Low bits of the 64-bit header word, OR'd with the byte-aligned address.
pub const DEVICE_BLOCK: u64 = 0x01;
pub const EOS: u64 = 0x02;
pub const PROGRESS: u64 = 0x04;
pub const ZERO_BLOCK: u64 = 0x08;

const FLAG_MASK: u64 = 0x0F;
const MAX_DEVICE_NAME_LEN: usize = 255;

/// Stateless encoder/decoder for the wire format described in spec.md
/// §4.7 and §6.4. Held as a unit struct (rather than free functions) to
/// match the rest of the crate's per-concern module boundaries and to give
/// future stateful additions (e.g. a checksum) a natural home, per the
/// teacher's convention of thin owning structs around protocol logic
/// (`metrics/parser.rs::LineParser`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec {
    sector_bits: u32,
}

/// Outcome of testing a buffer for all-zero content and deciding whether to
/// emit a frame at all (spec.md §4.7's zero-block / sparse elision rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroDecision {
    /// Buffer has non-zero bytes; send the full payload.
    NonZero,
    /// Buffer is all zero but the device is not (sparse && still-bulk);
    /// send a headerless-payload `ZERO_BLOCK` frame and flush.
    SendZeroFlag,
    /// Buffer is all zero, sparse mode is enabled, and the device is still
    /// in its bulk phase: elide the frame entirely.
    Elide,
}

impl WireCodec {
    pub fn new(sector_bits: u32) -> Self {
        Self { sector_bits }
    }

    /// Vectorized (word-at-a-time) all-zero scan over the whole buffer, as
    /// required by spec.md §4.7 ("the whole `CHUNK_BYTES` buffer is
    /// tested"). Operates on `u64` lanes with a scalar tail, which the
    /// compiler can widen to SIMD; a true wide-register scan is an
    /// optimization, not a semantic difference (spec.md §9).
    pub fn is_all_zero(buf: &[u8]) -> bool {
        let chunks = buf.chunks_exact(8);
        let remainder = chunks.remainder();
        chunks
            .map(|c| u64::from_ne_bytes(c.try_into().expect("chunks_exact(8) yields 8 bytes")))
            .all(|word| word == 0)
            && remainder.iter().all(|&b| b == 0)
    }

    /// Decide what to do with a chunk before emitting it, per spec.md
    /// §4.7: sparse elision only applies during the bulk phase.
    pub fn classify(buf: &[u8], sparse_enable: bool, still_bulk: bool) -> ZeroDecision {
        if !Self::is_all_zero(buf) {
            return ZeroDecision::NonZero;
        }
        if sparse_enable && still_bulk {
            ZeroDecision::Elide
        } else {
            ZeroDecision::SendZeroFlag
        }
    }

    fn pack_header(&self, sector: u64, flags: u64) -> u64 {
        (sector << self.sector_bits) | (flags & FLAG_MASK)
    }

    fn unpack_address(&self, header: u64) -> u64 {
        (header & !FLAG_MASK) >> self.sector_bits
    }

    /// Encode and send a device-block frame for `read`, honoring the
    /// zero-block optimization. `still_bulk` selects between eliding the
    /// frame (sparse + bulk) and sending a `ZERO_BLOCK` marker.
    pub async fn encode_device_block(
        &self,
        transport: &mut dyn Transport,
        read: &PendingRead,
        sparse_enable: bool,
        still_bulk: bool,
    ) -> Result<bool> {
        let decision = Self::classify(&read.buffer, sparse_enable, still_bulk);
        if decision == ZeroDecision::Elide {
            return Ok(false);
        }

        let zero = matches!(decision, ZeroDecision::SendZeroFlag);
        let mut flags = DEVICE_BLOCK;
        if zero {
            flags |= ZERO_BLOCK;
        }
        let header = self.pack_header(read.sector, flags);

        let name = read.device.name();
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(MigrationError::MalformedFrame(format!(
                "device name too long: {} bytes",
                name.len()
            )));
        }

        transport
            .put_u64_be(header)
            .await
            .map_err(MigrationError::transport)?;
        transport
            .put_u8(name.len() as u8)
            .await
            .map_err(MigrationError::transport)?;
        transport
            .put_bytes(name.as_bytes())
            .await
            .map_err(MigrationError::transport)?;

        if zero {
            // No payload; flush explicitly so long runs of headerless zero
            // frames don't stall behind the rate limiter (spec.md §4.7).
            transport
                .flush()
                .await
                .map_err(MigrationError::transport)?;
        } else {
            transport
                .put_bytes(&read.buffer)
                .await
                .map_err(MigrationError::transport)?;
        }

        Ok(true)
    }

    /// Encode and send a progress frame. `percent` is packed into the high
    /// bits of the same header word as the sector address would occupy
    /// (spec.md §4.7, §A.7).
    pub async fn encode_progress(&self, transport: &mut dyn Transport, percent: u32) -> Result<()> {
        let header = self.pack_header(percent as u64, PROGRESS);
        transport
            .put_u64_be(header)
            .await
            .map_err(MigrationError::transport)
    }

    /// Encode and send the end-of-stream marker.
    pub async fn encode_eos(&self, transport: &mut dyn Transport) -> Result<()> {
        let header = self.pack_header(0, EOS);
        transport
            .put_u64_be(header)
            .await
            .map_err(MigrationError::transport)
    }

    /// Decoded frame header, with flags and the recovered address/percent.
    pub fn decode_header(&self, header: u64) -> DecodedHeader {
        DecodedHeader {
            flags: header & FLAG_MASK,
            address: self.unpack_address(header),
        }
    }
}

/// A decoded frame header: flag bits and the recovered sector address (or
/// percentage, for `PROGRESS` frames — spec.md §4.7).
#[derive(Debug, Clone, Copy)]
pub struct DecodedHeader {
    pub flags: u64,
    pub address: u64,
}

impl DecodedHeader {
    pub fn has(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }
}
