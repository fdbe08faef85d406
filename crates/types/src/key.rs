use serde::{Deserialize, Serialize};

use crate::uint::{KeyspaceExt, U256};
use crate::{Result, TypesError};

/// Identifier of a peer in the DHT keyspace.
pub type PeerId = U256;

/// Identifier of a sample, living in the same keyspace as peers.
pub type SampleId = U256;

/// Closed interval `[bottom, top]` of the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub bottom: U256,
    pub top: U256,
}

impl KeyRange {
    /// Region of `radius` around `center`, clamped to `[0, max]`.
    pub fn around(center: U256, radius: U256, max: U256) -> Result<Self> {
        if center > max {
            return Err(TypesError::OutOfKeyspace { key: center, max });
        }
        let (bottom, top) = center.window(&radius, &max);
        Ok(Self { bottom, top })
    }

    pub fn contains(&self, key: &U256) -> bool {
        *key >= self.bottom && *key <= self.top
    }
}
