use primitive_types::U256 as PrimitiveU256;
use rand::Rng;

use crate::{Result, TypesError};

pub type U256 = PrimitiveU256;

/// Arithmetic over the bounded DHT keyspace `[0, max]`.
///
/// Distances are absolute differences, not XOR: region queries are plain
/// interval containment.
pub trait KeyspaceExt: Sized {
    /// Largest key of a keyspace `bits` wide.
    fn keyspace_max(bits: u32) -> Result<Self>;

    /// `|self - other|`
    fn key_distance(&self, other: &Self) -> Self;

    /// Closed window `[self - radius, self + radius]` clamped to `[0, max]`.
    fn window(&self, radius: &Self, max: &Self) -> (Self, Self);

    /// Uniformly random key in `[0, max]`.
    fn random_key<R: Rng + ?Sized>(rng: &mut R, max: &Self) -> Self;
}

impl KeyspaceExt for U256 {
    fn keyspace_max(bits: u32) -> Result<Self> {
        match bits {
            0 => Err(TypesError::InvalidKeyWidth(bits)),
            256 => Ok(U256::MAX),
            b if b < 256 => Ok((U256::one() << b) - U256::one()),
            _ => Err(TypesError::InvalidKeyWidth(bits)),
        }
    }

    fn key_distance(&self, other: &Self) -> Self {
        if self >= other {
            *self - *other
        } else {
            *other - *self
        }
    }

    fn window(&self, radius: &Self, max: &Self) -> (Self, Self) {
        let bottom = self.saturating_sub(*radius);
        let top = std::cmp::min(self.saturating_add(*radius), *max);
        (bottom, top)
    }

    fn random_key<R: Rng + ?Sized>(rng: &mut R, max: &Self) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes[..]);
        let raw = U256::from_big_endian(&bytes);

        if *max == U256::MAX {
            raw
        } else {
            raw % (*max + U256::one())
        }
    }
}
