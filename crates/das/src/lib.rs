pub mod block;
pub mod config;
pub mod operations;
pub mod protocol;
pub mod rated_list;
pub mod report;
pub mod search_table;

pub use block::{GridBlock, Sample, SampleSource, SharedBlock};
pub use config::DasConfig;
pub use operations::{
    OperationContext, OperationId, OperationState, OperationStatus, RandomSamplingOperation,
    SamplingOperation, ValidatorSamplingOperation, ValidatorTarget,
};
pub use protocol::{validator_target, DasProtocol, Message, Network, Role, Routing, Transport};
pub use rated_list::{MemberId, NodeStatus, RatedList, RatedListMember, RatingParams};
pub use report::OperationSummary;
pub use search_table::{Neighbour, SearchTable};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DasError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid validator target: {0}")]
    InvalidTarget(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Unexpected message for {role:?} node: {message}")]
    UnexpectedMessage { role: Role, message: &'static str },

    #[error("Keyspace error: {0}")]
    Keyspace(#[from] das_sim_types::TypesError),
}

pub type Result<T> = std::result::Result<T, DasError>;
