use das_sim_types::{KeyspaceExt, SampleId, U256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

use crate::{DasError, Result};

/// One erasure-coded unit of a block, addressable by row and by column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub block_id: u64,
    /// 1-based
    pub row: u32,
    /// 1-based
    pub column: u32,
    pub id_by_row: SampleId,
    pub id_by_column: SampleId,
}

impl Sample {
    /// Canonical identifier.
    pub fn id(&self) -> SampleId {
        self.id_by_row
    }

    pub fn is_in_region_by_row(&self, peer: &U256, radius: &U256) -> bool {
        self.id_by_row.key_distance(peer) <= *radius
    }

    pub fn is_in_region_by_column(&self, peer: &U256, radius: &U256) -> bool {
        self.id_by_column.key_distance(peer) <= *radius
    }
}

/// The block representation consumed by the sampling core.
pub trait SampleSource: Debug {
    fn block_id(&self) -> u64;

    /// Rows (and columns) of the square sample matrix.
    fn size(&self) -> u32;

    fn max_key(&self) -> U256;

    fn num_samples(&self) -> usize {
        (self.size() as usize) * (self.size() as usize)
    }

    fn samples(&self) -> Vec<Sample>;

    fn samples_by_row(&self, row: u32) -> Vec<Sample>;

    fn samples_by_column(&self, column: u32) -> Vec<Sample>;

    /// `n` distinct samples chosen uniformly.
    fn random_samples(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Sample>;

    /// Radius such that each sample id is covered by about
    /// `copies_per_peer` peers out of `population` (the whole network when
    /// `None`).
    fn region_radius(&self, copies_per_peer: u64, population: Option<usize>) -> U256;
}

pub type SharedBlock = Arc<dyn SampleSource + Send + Sync>;

/// Square block whose sample ids are spread evenly over the keyspace, once
/// in row-major order and once in column-major order.
#[derive(Debug, Clone)]
pub struct GridBlock {
    block_id: u64,
    size: u32,
    max_key: U256,
    step: U256,
    network_size: usize,
}

impl GridBlock {
    pub fn new(block_id: u64, size: u32, max_key: U256, network_size: usize) -> Result<Self> {
        if size == 0 {
            return Err(DasError::InvalidBlock("block size must be positive".to_string()));
        }

        let total = U256::from(size) * U256::from(size);
        if total > max_key {
            return Err(DasError::InvalidBlock(format!(
                "{} samples do not fit in keyspace of max {}",
                total, max_key
            )));
        }

        Ok(Self {
            block_id,
            size,
            max_key,
            step: max_key / total,
            network_size,
        })
    }

    pub fn sample(&self, row: u32, column: u32) -> Sample {
        let size = self.size as u64;
        let by_row = (row as u64 - 1) * size + (column as u64 - 1);
        let by_column = (column as u64 - 1) * size + (row as u64 - 1);

        Sample {
            block_id: self.block_id,
            row,
            column,
            id_by_row: self.step * U256::from(by_row),
            id_by_column: self.step * U256::from(by_column),
        }
    }

    fn sample_at(&self, index: usize) -> Sample {
        let size = self.size as usize;
        self.sample((index / size) as u32 + 1, (index % size) as u32 + 1)
    }
}

impl SampleSource for GridBlock {
    fn block_id(&self) -> u64 {
        self.block_id
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn max_key(&self) -> U256 {
        self.max_key
    }

    fn samples(&self) -> Vec<Sample> {
        (0..self.num_samples()).map(|i| self.sample_at(i)).collect()
    }

    fn samples_by_row(&self, row: u32) -> Vec<Sample> {
        if row == 0 || row > self.size {
            return Vec::new();
        }
        (1..=self.size).map(|column| self.sample(row, column)).collect()
    }

    fn samples_by_column(&self, column: u32) -> Vec<Sample> {
        if column == 0 || column > self.size {
            return Vec::new();
        }
        (1..=self.size).map(|row| self.sample(row, column)).collect()
    }

    fn random_samples(&self, n: usize, rng: &mut dyn RngCore) -> Vec<Sample> {
        let total = self.num_samples();
        rand::seq::index::sample(rng, total, n.min(total))
            .into_iter()
            .map(|i| self.sample_at(i))
            .collect()
    }

    fn region_radius(&self, copies_per_peer: u64, population: Option<usize>) -> U256 {
        let population = population.unwrap_or(self.network_size);
        if population == 0 {
            return self.max_key;
        }

        let share = self.max_key / U256::from(population as u64);
        std::cmp::min(share.saturating_mul(U256::from(copies_per_peer)) / 2, self.max_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    fn block() -> GridBlock {
        GridBlock::new(1, 4, U256::from(1_600u64), 100).unwrap()
    }

    #[test]
    fn test_row_and_column_ids_are_distinct_layouts() {
        let block = block();
        let s = block.sample(2, 3);
        assert_eq!(s.id_by_row, U256::from(100u64 * 6));
        assert_eq!(s.id_by_column, U256::from(100u64 * 9));
    }

    #[test]
    fn test_every_sample_belongs_to_one_row_and_one_column() {
        let block = block();
        let all = block.samples();
        assert_eq!(all.len(), 16);

        let by_rows: usize = (1..=4).map(|r| block.samples_by_row(r).len()).sum();
        let by_columns: usize = (1..=4).map(|c| block.samples_by_column(c).len()).sum();
        assert_eq!(by_rows, 16);
        assert_eq!(by_columns, 16);
        assert!(block.samples_by_row(5).is_empty());

        let ids: HashSet<_> = all.iter().map(|s| s.id_by_row).collect();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn test_random_samples_are_distinct() {
        let block = block();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let picked = block.random_samples(10, &mut rng);
        let ids: HashSet<_> = picked.iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 10);

        assert_eq!(block.random_samples(100, &mut rng).len(), 16);
    }

    #[test]
    fn test_region_radius() {
        let block = block();
        // 1600 / 100 * 2 / 2
        assert_eq!(block.region_radius(2, None), U256::from(16u64));
        // 1600 / 10 * 2 / 2
        assert_eq!(block.region_radius(2, Some(10)), U256::from(160u64));
        assert_eq!(block.region_radius(2, Some(0)), U256::from(1_600u64));
    }

    #[test]
    fn test_rejects_oversized_block() {
        assert!(GridBlock::new(1, 0, U256::from(100u64), 10).is_err());
        assert!(GridBlock::new(1, 11, U256::from(100u64), 10).is_err());
    }
}
