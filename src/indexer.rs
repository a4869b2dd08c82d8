//! Row identity and chunk planning.
//!
//! Row identifiers are dense: the design matrix of N rows owns exactly the ids
//! `0..N`, in file order. A chunk plan cuts that domain into contiguous ranges of
//! at most `chunk_size` rows. Every later stage relies on both facts.

use crate::config::ConfigurationError;
use crate::types::{ChunkIndex, RowId};
use std::ops::Range;

/// A contiguous, half-open range of row ids processed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: ChunkIndex,
    pub rows: Range<u64>,
}

impl Chunk {
    #[inline]
    pub fn len(&self) -> usize {
        (self.rows.end - self.rows.start) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.start == self.rows.end
    }

    #[inline]
    pub fn first_row(&self) -> RowId {
        RowId(self.rows.start)
    }

    /// The last row id in the chunk (inclusive). Chunks in a plan are never empty.
    #[inline]
    pub fn last_row(&self) -> RowId {
        RowId(self.rows.end - 1)
    }

    #[inline]
    pub fn contains(&self, row_id: RowId) -> bool {
        self.rows.contains(&row_id.0)
    }
}

/// The ordered partition of `0..num_rows` into chunks.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    num_rows: u64,
    chunk_size: usize,
    chunks: Vec<Chunk>,
}

impl ChunkPlan {
    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Chunk> {
        self.chunks.iter()
    }
}

/// Assigns row identifiers and plans chunks of a fixed maximum size.
#[derive(Debug, Clone, Copy)]
pub struct RowIndexer {
    chunk_size: usize,
}

impl RowIndexer {
    pub fn new(chunk_size: usize) -> Result<Self, ConfigurationError> {
        if chunk_size == 0 {
            return Err(ConfigurationError::InvalidChunkSize(chunk_size));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Yields the row id for each position of an N-row matrix, in order.
    pub fn assign(num_rows: usize) -> impl Iterator<Item = RowId> {
        (0..num_rows as u64).map(RowId)
    }

    /// Partitions `0..num_rows` into `ceil(num_rows / chunk_size)` contiguous chunks.
    pub fn plan(&self, num_rows: usize) -> Result<ChunkPlan, ConfigurationError> {
        if num_rows == 0 {
            return Err(ConfigurationError::EmptyDesign);
        }
        let total = num_rows as u64;
        let step = self.chunk_size as u64;
        let chunks = (0..total)
            .step_by(self.chunk_size)
            .enumerate()
            .map(|(index, start)| Chunk {
                index: ChunkIndex(index),
                rows: start..(start + step).min(total),
            })
            .collect();

        Ok(ChunkPlan {
            num_rows: total,
            chunk_size: self.chunk_size,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(num_rows: usize, chunk_size: usize) {
        let plan = RowIndexer::new(chunk_size).unwrap().plan(num_rows).unwrap();
        assert_eq!(plan.len(), num_rows.div_ceil(chunk_size));

        let mut expected_start = 0u64;
        let mut total = 0usize;
        for (position, chunk) in plan.iter().enumerate() {
            assert_eq!(chunk.index, ChunkIndex(position));
            assert_eq!(chunk.rows.start, expected_start, "gap or overlap");
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= chunk_size);
            if position + 1 < plan.len() {
                assert_eq!(chunk.len(), chunk_size, "only the last chunk may be short");
            }
            expected_start = chunk.rows.end;
            total += chunk.len();
        }
        assert_eq!(total, num_rows);
        assert_eq!(expected_start, num_rows as u64);
    }

    #[test]
    fn partitions_are_total_disjoint_and_contiguous() {
        for num_rows in [1, 2, 3, 7, 10, 99, 100, 101, 1_000] {
            for chunk_size in [1, 2, 3, 10, 64, 100, 5_000] {
                assert_partition(num_rows, chunk_size);
            }
        }
    }

    #[test]
    fn exact_multiple_has_no_short_chunk() {
        let plan = RowIndexer::new(2).unwrap().plan(4).unwrap();
        let ranges: Vec<_> = plan.iter().map(|c| c.rows.clone()).collect();
        assert_eq!(ranges, vec![0..2, 2..4]);
        assert_eq!(plan.chunks()[1].first_row(), RowId(2));
        assert_eq!(plan.chunks()[1].last_row(), RowId(3));
    }

    #[test]
    fn zero_chunk_size_is_a_configuration_error() {
        assert!(matches!(
            RowIndexer::new(0),
            Err(ConfigurationError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn empty_design_is_a_configuration_error() {
        let indexer = RowIndexer::new(10).unwrap();
        assert!(matches!(
            indexer.plan(0),
            Err(ConfigurationError::EmptyDesign)
        ));
    }

    #[test]
    fn assigned_ids_follow_file_order() {
        let ids: Vec<_> = RowIndexer::assign(4).collect();
        assert_eq!(ids, vec![RowId(0), RowId(1), RowId(2), RowId(3)]);
    }
}
