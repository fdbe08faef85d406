use das_sim_types::SampleId;
use rand::RngCore;

use super::{OperationContext, OperationState, SamplingOperation};
use crate::block::{Sample, SampleSource};
use crate::config::DasConfig;

/// Fetches a random subset of a block's samples. Complete once every seeded
/// sample is downloaded.
#[derive(Debug, Clone)]
pub struct RandomSamplingOperation {
    state: OperationState,
}

impl RandomSamplingOperation {
    pub fn new(
        ctx: OperationContext,
        block: &dyn SampleSource,
        config: &DasConfig,
        rng: &mut dyn RngCore,
    ) -> Self {
        let samples = block.random_samples(config.num_samples, rng);
        Self::with_samples(ctx, block, &samples, config)
    }

    /// Fetch exactly `samples`, each reachable through its row and its
    /// column id.
    pub fn with_samples(
        ctx: OperationContext,
        block: &dyn SampleSource,
        samples: &[Sample],
        config: &DasConfig,
    ) -> Self {
        let mut state = OperationState::new(ctx, block, config);
        for sample in samples {
            state.seed(sample.id(), vec![sample.id_by_row, sample.id_by_column]);
        }
        Self { state }
    }
}

impl SamplingOperation for RandomSamplingOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn completed(&self) -> bool {
        self.state.all_downloaded()
    }

    fn locate(&self, sample: &Sample) -> Option<SampleId> {
        let id = sample.id();
        (sample.block_id == self.state.block_id() && self.state.contains(&id)).then_some(id)
    }

    fn kind(&self) -> &'static str {
        "RandomSamplingOperation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GridBlock;
    use crate::operations::tests::{ctx, grid};
    use crate::operations::OperationStatus;
    use crate::search_table::{Neighbour, SearchTable};
    use das_sim_types::{PeerId, U256};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_completes_only_when_every_sample_arrives() {
        let block = grid();
        let samples = vec![block.sample(1, 1), block.sample(2, 3), block.sample(4, 4)];
        let mut op = RandomSamplingOperation::with_samples(ctx(), &block, &samples, &DasConfig::default());
        assert_eq!(op.status(), OperationStatus::Created);

        assert_eq!(op.elaborate_response(&samples[..2], None), 2);
        assert!(!op.completed());

        // Duplicate and unrelated samples change nothing.
        assert_eq!(op.elaborate_response(&[samples[0].clone(), block.sample(3, 3)], None), 0);
        assert!(!op.completed());

        assert_eq!(op.elaborate_response(&samples[2..], None), 1);
        assert!(op.completed());
        assert_eq!(op.status(), OperationStatus::Completed);
        assert_eq!(op.state().samples_count(), 3);
    }

    #[test]
    fn test_rejects_samples_of_other_blocks() {
        let block = grid();
        let other = GridBlock::new(2, 4, U256::from(1_600u64), 20).unwrap();
        let mut op =
            RandomSamplingOperation::with_samples(ctx(), &block, &[block.sample(1, 2)], &DasConfig::default());

        assert_eq!(op.elaborate_response(&[other.sample(1, 2)], None), 0);
        assert_eq!(op.elaborate_response(&[block.sample(1, 2)], None), 1);
    }

    #[test]
    fn test_seeds_configured_number_of_samples() {
        let block = grid();
        let config = DasConfig {
            num_samples: 5,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let op = RandomSamplingOperation::new(ctx(), &block, &config, &mut rng);
        assert_eq!(op.state().total_samples(), 5);
        assert_eq!(op.state().missing_samples().len(), 5);
    }

    #[test]
    fn test_column_holders_are_candidates() {
        let block = grid();
        // Row id 100, column id 400.
        let sample = block.sample(1, 2);
        let mut op =
            RandomSamplingOperation::with_samples(ctx(), &block, &[sample.clone()], &DasConfig::default());

        let mut table = SearchTable::new(PeerId::from(5u64), U256::from(1_600u64), &DasConfig::default());
        table.add_neighbour(Neighbour::new(PeerId::from(410u64), 0, false), None);

        assert_eq!(op.do_sampling(&mut table), vec![PeerId::from(410u64)]);
        assert_eq!(op.state().request_for(&PeerId::from(410u64)), vec![sample.id()]);

        assert_eq!(op.elaborate_response(&[sample], Some(PeerId::from(410u64))), 1);
        assert!(op.completed());
        assert!(op.do_sampling(&mut table).is_empty());
    }
}
