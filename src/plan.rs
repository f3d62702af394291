use crate::error::PipelineError;

use std::ops::Range;

/// One contiguous piece of the source file. `index` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    pub offset: u64,
    pub len: usize,
}

/// Fixed-size chunking of a file of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub buffer_size: usize,
    pub chunk_count: usize,
}

impl ChunkPlan {
    pub fn new(file_size: u64, buffer_size: usize) -> Result<Self, PipelineError> {
        if buffer_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "buffer size must be positive".to_string(),
            ));
        }
        let chunk_count = file_size.div_ceil(buffer_size as u64) as usize;
        Ok(Self {
            file_size,
            buffer_size,
            chunk_count,
        })
    }

    pub fn offset_of(&self, index: usize) -> u64 {
        (index.saturating_sub(1) as u64) * (self.buffer_size as u64)
    }

    pub fn chunk(&self, index: usize) -> Option<ChunkSpec> {
        if index == 0 || index > self.chunk_count {
            return None;
        }
        let offset = self.offset_of(index);
        let len = (self.file_size - offset).min(self.buffer_size as u64) as usize;
        Some(ChunkSpec { index, offset, len })
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkSpec> + '_ {
        (1..=self.chunk_count).filter_map(move |i| self.chunk(i))
    }

    /// Bytes of zero padding the last frame carries.
    pub fn padding_bytes(&self) -> u64 {
        (self.chunk_count as u64) * (self.buffer_size as u64) - self.file_size
    }
}

/// Larger slices first.
pub fn split_slices(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let base = len / workers;
    let extra = len % workers;

    let mut out = Vec::with_capacity(workers);
    let mut start = 0usize;
    for w in 0..workers {
        let size = base + usize::from(w < extra);
        out.push(start..start + size);
        start += size;
    }
    out
}
