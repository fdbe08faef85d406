use serde::{Deserialize, Serialize};

use crate::{DasError, Result};

/// Tunables shared by the reputation tree, the search table and the
/// sampling operations of one simulated node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DasConfig {
    /// Upper bound of a peer rating
    pub max_rating: f64,
    /// Rating given to a newly discovered peer
    pub initial_rating: f64,
    /// Rating gained on every successful sample
    pub successful_sample_change: f64,
    /// Consecutive failures taking a peer from `max_rating` to zero
    pub max_accepted_failures: u32,
    /// Base of the exponential failure penalty
    pub rating_base: u32,
    /// Children allowed per provenance node (level 0 is unbounded), also the
    /// number of neighbours handed out per response
    pub max_nodes_on_level: usize,
    /// Deepest provenance level a peer can be attached at
    pub max_rated_level: i32,
    /// Order candidates by diversity and rating instead of discovery order
    pub security_active: bool,
    pub diversity_weight: f64,
    pub rating_weight: f64,
    /// Samples-per-candidate growth per sampling round
    pub aggressiveness_step: u32,
    /// Concurrent requests per operation (ALPHA)
    pub alpha: usize,
    /// Random samples fetched by a non-validator per block
    pub num_samples: usize,
    /// Copies of each sample held across the peer population
    pub sample_copies_per_peer: u64,
    /// Logical time after which an unrefreshed neighbour expires
    pub neighbour_ttl: u64,
    /// Logical time before an unanswered request is abandoned
    pub request_timeout: u64,
    /// Drop neighbours whose whole provenance chain is defunct
    pub purge_defunct: bool,
}

impl Default for DasConfig {
    fn default() -> Self {
        Self {
            max_rating: 100.0,
            initial_rating: 50.0,
            successful_sample_change: 10.0,
            max_accepted_failures: 5,
            rating_base: 3,
            max_nodes_on_level: 16,
            max_rated_level: 3,
            security_active: true,
            diversity_weight: 0.5,
            rating_weight: 0.5,
            aggressiveness_step: 2,
            alpha: 3,
            num_samples: 75,
            sample_copies_per_peer: 2,
            neighbour_ttl: 60_000,
            request_timeout: 400,
            purge_defunct: false,
        }
    }
}

impl DasConfig {
    /// Per-unit failure penalty such that `max_accepted_failures` consecutive
    /// failures take a peer at `max_rating` to zero:
    /// `max_rating * (base - 1) / (base^N - 1)`.
    pub fn failed_sample_change(&self) -> f64 {
        let base = self.rating_base as f64;
        let denominator = base.powi(self.max_accepted_failures as i32) - 1.0;
        self.max_rating * (base - 1.0) / denominator
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max_rating > 0.0) {
            return Err(DasError::InvalidConfig("max_rating must be positive".to_string()));
        }

        if !(self.initial_rating > 0.0 && self.initial_rating <= self.max_rating) {
            return Err(DasError::InvalidConfig(
                "initial_rating must be in (0, max_rating]".to_string(),
            ));
        }

        if !(self.successful_sample_change > 0.0) {
            return Err(DasError::InvalidConfig(
                "successful_sample_change must be positive".to_string(),
            ));
        }

        if self.max_accepted_failures == 0 {
            return Err(DasError::InvalidConfig(
                "max_accepted_failures must be at least 1".to_string(),
            ));
        }

        if self.rating_base < 2 {
            return Err(DasError::InvalidConfig("rating_base must be at least 2".to_string()));
        }

        if self.max_nodes_on_level == 0 {
            return Err(DasError::InvalidConfig(
                "max_nodes_on_level must be at least 1".to_string(),
            ));
        }

        if self.max_rated_level < 0 {
            return Err(DasError::InvalidConfig("max_rated_level cannot be negative".to_string()));
        }

        if self.diversity_weight < 0.0 || self.rating_weight < 0.0 {
            return Err(DasError::InvalidConfig("scoring weights cannot be negative".to_string()));
        }

        if self.security_active && self.diversity_weight + self.rating_weight == 0.0 {
            return Err(DasError::InvalidConfig(
                "at least one scoring weight must be positive".to_string(),
            ));
        }

        if self.alpha == 0 || self.aggressiveness_step == 0 || self.sample_copies_per_peer == 0 {
            return Err(DasError::InvalidConfig(
                "alpha, aggressiveness_step and sample_copies_per_peer must be at least 1"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
