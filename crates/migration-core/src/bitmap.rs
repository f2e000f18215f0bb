//! `ChunkBitmap` — a packed bit array keyed by chunk index, tracking
//! "read in flight for this chunk" (spec.md §4.1).

/// A packed bit array sized to `ceil(total_sectors / sectors_per_chunk)`
/// bits, rounded up to the storage word size. All bits start clear.
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    num_chunks: u64,
    sectors_per_chunk: u64,
}

const WORD_BITS: u64 = u64::BITS as u64;

impl ChunkBitmap {
    /// Allocate a bitmap covering `total_sectors` sectors at
    /// `sectors_per_chunk` sectors per chunk. `sectors_per_chunk` must be
    /// nonzero.
    pub fn new(total_sectors: u64, sectors_per_chunk: u64) -> Self {
        assert!(sectors_per_chunk > 0, "sectors_per_chunk must be nonzero");
        let num_chunks = total_sectors.div_ceil(sectors_per_chunk);
        let num_words = (num_chunks as usize).div_ceil(WORD_BITS as usize);
        Self {
            words: vec![0u64; num_words],
            num_chunks,
            sectors_per_chunk,
        }
    }

    fn chunk_of(&self, sector: u64) -> u64 {
        sector / self.sectors_per_chunk
    }

    /// Set or clear all chunks touched by the half-open sector range
    /// `[sector, sector + n)`.
    pub fn set(&mut self, sector: u64, n: u64, value: bool) {
        if n == 0 {
            return;
        }
        let first = self.chunk_of(sector);
        let last = self.chunk_of(sector + n - 1);
        for chunk in first..=last {
            if chunk >= self.num_chunks {
                break;
            }
            let word = (chunk / WORD_BITS) as usize;
            let bit = chunk % WORD_BITS;
            if value {
                self.words[word] |= 1u64 << bit;
            } else {
                self.words[word] &= !(1u64 << bit);
            }
        }
    }

    /// Whether the chunk containing `sector` is in flight. Returns `false`
    /// if the sector lies beyond the bitmap's covered range.
    pub fn test(&self, sector: u64) -> bool {
        let chunk = self.chunk_of(sector);
        if chunk >= self.num_chunks {
            return false;
        }
        let word = (chunk / WORD_BITS) as usize;
        let bit = chunk % WORD_BITS;
        (self.words[word] >> bit) & 1 == 1
    }

    /// Number of chunks this bitmap covers.
    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }
}
