pub mod key;
pub mod uint;

pub use key::{PeerId, SampleId, KeyRange};
pub use uint::{KeyspaceExt, U256};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("Invalid key width: {0} bits (must be 1..=256)")]
    InvalidKeyWidth(u32),

    #[error("Key {key} outside keyspace (max {max})")]
    OutOfKeyspace { key: U256, max: U256 },
}

pub type Result<T> = std::result::Result<T, TypesError>;
