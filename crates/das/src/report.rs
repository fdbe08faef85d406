use das_sim_types::PeerId;
use serde::{Deserialize, Serialize};

use crate::operations::{OperationId, OperationStatus, SamplingOperation};

/// Read-only record of one sampling operation, for offline analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub src: PeerId,
    #[serde(rename = "type")]
    pub kind: String,
    pub num_messages: u64,
    pub start: u64,
    pub completion_time: Option<u64>,
    pub hops: u64,
    pub samples: usize,
    pub block_id: u64,
    pub validator: bool,
    pub completed: bool,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl OperationSummary {
    pub fn from_operation<O: SamplingOperation + ?Sized>(op: &O) -> Self {
        let state = op.state();
        let target = op.target();
        Self {
            id: state.id(),
            src: state.src(),
            kind: op.kind().to_string(),
            num_messages: state.num_messages(),
            start: state.start(),
            completion_time: state.stop(),
            hops: state.hops(),
            samples: state.samples_count(),
            block_id: state.block_id(),
            validator: state.is_validator(),
            completed: op.completed(),
            status: op.status(),
            row: target.and_then(|t| t.row()),
            column: target.and_then(|t| t.column()),
        }
    }

    /// Logical time from start to completion, if the operation finished.
    pub fn duration(&self) -> Option<u64> {
        self.completion_time.map(|stop| stop.saturating_sub(self.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GridBlock;
    use crate::config::DasConfig;
    use crate::operations::{OperationContext, ValidatorSamplingOperation, ValidatorTarget};
    use das_sim_types::U256;

    #[test]
    fn test_validator_summary_serializes_target() {
        let block = GridBlock::new(7, 4, U256::from(1_600u64), 10).unwrap();
        let ctx = OperationContext {
            id: 42,
            src: PeerId::from(9u64),
            start: 100,
            validator: true,
            num_validators: 4,
        };
        let mut op = ValidatorSamplingOperation::new(ctx, &block, ValidatorTarget::Row(1), &DasConfig::default())
            .unwrap();
        op.state_mut().record_request();
        op.elaborate_response(&[block.sample(1, 1), block.sample(1, 2)], None);
        op.state_mut().mark_finished(250);

        let summary = op.summary();
        assert_eq!(summary.kind, "ValidatorSamplingOperation");
        assert_eq!(summary.block_id, 7);
        assert_eq!(summary.samples, 2);
        assert!(summary.completed);
        assert_eq!(summary.duration(), Some(150));
        assert_eq!(summary.hops, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["type"], "ValidatorSamplingOperation");
        assert_eq!(json["row"], 1);
        assert!(json.get("column").is_none());
    }
}
