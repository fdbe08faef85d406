use das_sim_types::SampleId;
use serde::{Deserialize, Serialize};

use super::{OperationContext, OperationState, SamplingOperation};
use crate::block::{Sample, SampleSource};
use crate::config::DasConfig;
use crate::{DasError, Result};

/// The single row or column a validator attests to. Indices are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatorTarget {
    Row(u32),
    Column(u32),
}

impl ValidatorTarget {
    /// Build a target from a row/column pair where 0 means unset. Exactly
    /// one of the two must be set.
    pub fn from_indices(row: u32, column: u32) -> Result<Self> {
        match (row, column) {
            (0, 0) => Err(DasError::InvalidTarget("neither row nor column is set".to_string())),
            (r, 0) => Ok(ValidatorTarget::Row(r)),
            (0, c) => Ok(ValidatorTarget::Column(c)),
            (r, c) => Err(DasError::InvalidTarget(format!("both row {} and column {} are set", r, c))),
        }
    }

    pub fn row(&self) -> Option<u32> {
        match self {
            ValidatorTarget::Row(r) => Some(*r),
            ValidatorTarget::Column(_) => None,
        }
    }

    pub fn column(&self) -> Option<u32> {
        match self {
            ValidatorTarget::Column(c) => Some(*c),
            ValidatorTarget::Row(_) => None,
        }
    }

    fn covers(&self, sample: &Sample) -> bool {
        match self {
            ValidatorTarget::Row(r) => sample.row == *r,
            ValidatorTarget::Column(c) => sample.column == *c,
        }
    }
}

/// Fetches one row or column of a block. Complete once at least half of its
/// samples (rounded up) are downloaded.
#[derive(Debug, Clone)]
pub struct ValidatorSamplingOperation {
    state: OperationState,
    target: ValidatorTarget,
    quorum: usize,
}

impl ValidatorSamplingOperation {
    pub fn new(
        ctx: OperationContext,
        block: &dyn SampleSource,
        target: ValidatorTarget,
        config: &DasConfig,
    ) -> Result<Self> {
        let samples = match target {
            ValidatorTarget::Row(r) => block.samples_by_row(r),
            ValidatorTarget::Column(c) => block.samples_by_column(c),
        };
        if samples.is_empty() {
            return Err(DasError::InvalidTarget(format!(
                "{:?} is outside a block of size {}",
                target,
                block.size()
            )));
        }

        let mut state = OperationState::new(ctx, block, config);
        for sample in &samples {
            let key = match target {
                ValidatorTarget::Row(_) => sample.id_by_row,
                ValidatorTarget::Column(_) => sample.id_by_column,
            };
            state.seed(sample.id(), vec![key]);
        }

        Ok(Self {
            state,
            target,
            quorum: samples.len().div_ceil(2),
        })
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }
}

impl SamplingOperation for ValidatorSamplingOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn completed(&self) -> bool {
        self.state.samples_count() >= self.quorum
    }

    fn locate(&self, sample: &Sample) -> Option<SampleId> {
        let id = sample.id();
        let relevant = sample.block_id == self.state.block_id()
            && self.target.covers(sample)
            && self.state.contains(&id);
        relevant.then_some(id)
    }

    fn kind(&self) -> &'static str {
        "ValidatorSamplingOperation"
    }

    fn target(&self) -> Option<ValidatorTarget> {
        Some(self.target)
    }
}
