pub mod random;
pub mod scoring;
pub mod validator;

pub use random::RandomSamplingOperation;
pub use validator::{ValidatorSamplingOperation, ValidatorTarget};

use das_sim_types::{PeerId, SampleId, U256};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace};

use crate::block::{Sample, SampleSource};
use crate::config::DasConfig;
use crate::report::OperationSummary;
use crate::search_table::SearchTable;
use scoring::CandidateProfile;

pub type OperationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Seeded, no request issued yet
    Created,
    Sampling,
    Completed,
    /// No eligible candidate and nothing outstanding
    Exhausted,
}

/// Identity of an operation and the node running it.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext {
    pub id: OperationId,
    pub src: PeerId,
    pub start: u64,
    pub validator: bool,
    pub num_validators: usize,
}

#[derive(Debug, Clone)]
pub struct FetchingSample {
    id: SampleId,
    /// Keyspace ids under which peers may hold this sample.
    keys: Vec<SampleId>,
    downloaded: bool,
    fetching_from: HashSet<PeerId>,
}

impl FetchingSample {
    fn new(id: SampleId, keys: Vec<SampleId>) -> Self {
        Self {
            id,
            keys,
            downloaded: false,
            fetching_from: HashSet::new(),
        }
    }

    pub fn id(&self) -> SampleId {
        self.id
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded
    }

    pub fn fetching_from(&self) -> &HashSet<PeerId> {
        &self.fetching_from
    }
}

/// A peer the operation may ask, with the samples it is believed to hold.
#[derive(Debug, Clone)]
pub struct Candidate {
    id: PeerId,
    being_asked: bool,
    asked_round: u64,
    aggressiveness: u32,
    assigned: IndexSet<SampleId>,
    in_flight: Vec<SampleId>,
}

impl Candidate {
    fn new(id: PeerId, aggressiveness: u32) -> Self {
        Self {
            id,
            being_asked: false,
            asked_round: 0,
            aggressiveness,
            assigned: IndexSet::new(),
            in_flight: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_being_asked(&self) -> bool {
        self.being_asked
    }

    /// Selection round in which the outstanding request was issued.
    pub fn asked_round(&self) -> u64 {
        self.asked_round
    }

    pub fn aggressiveness(&self) -> u32 {
        self.aggressiveness
    }

    pub fn assigned(&self) -> &IndexSet<SampleId> {
        &self.assigned
    }

    pub fn in_flight(&self) -> &[SampleId] {
        &self.in_flight
    }
}

/// Bookkeeping shared by every operation variant.
#[derive(Debug, Clone)]
pub struct OperationState {
    id: OperationId,
    src: PeerId,
    block_id: u64,
    validator: bool,
    start: u64,
    stop: Option<u64>,

    samples: IndexMap<SampleId, FetchingSample>,
    candidates: IndexMap<PeerId, Candidate>,
    // (peer, sample) pairs already requested by this operation
    requested: HashSet<(PeerId, SampleId)>,

    alpha: usize,
    in_flight: usize,
    aggressiveness: u32,
    aggressiveness_step: u32,

    security_active: bool,
    diversity_weight: f64,
    rating_weight: f64,
    max_rating: f64,

    radius_validator: U256,
    radius_non_validator: U256,

    samples_count: usize,
    num_messages: u64,
    hops: u64,
    rounds: u64,
    exhausted: bool,
}

impl OperationState {
    pub fn new(ctx: OperationContext, block: &dyn SampleSource, config: &DasConfig) -> Self {
        let copies = config.sample_copies_per_peer;
        Self {
            id: ctx.id,
            src: ctx.src,
            block_id: block.block_id(),
            validator: ctx.validator,
            start: ctx.start,
            stop: None,
            samples: IndexMap::new(),
            candidates: IndexMap::new(),
            requested: HashSet::new(),
            alpha: config.alpha,
            in_flight: 0,
            aggressiveness: 0,
            aggressiveness_step: config.aggressiveness_step,
            security_active: config.security_active,
            diversity_weight: config.diversity_weight,
            rating_weight: config.rating_weight,
            max_rating: config.max_rating,
            radius_validator: block.region_radius(copies, Some(ctx.num_validators)),
            radius_non_validator: block.region_radius(copies, None),
            samples_count: 0,
            num_messages: 0,
            hops: 0,
            rounds: 0,
            exhausted: false,
        }
    }

    /// Register a sample to fetch. Re-seeding a known sample is a no-op.
    pub fn seed(&mut self, id: SampleId, keys: Vec<SampleId>) {
        self.samples
            .entry(id)
            .or_insert_with(|| FetchingSample::new(id, keys));
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn src(&self) -> PeerId {
        self.src
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn is_validator(&self) -> bool {
        self.validator
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn stop(&self) -> Option<u64> {
        self.stop
    }

    pub fn contains(&self, id: &SampleId) -> bool {
        self.samples.contains_key(id)
    }

    pub fn sample(&self, id: &SampleId) -> Option<&FetchingSample> {
        self.samples.get(id)
    }

    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    /// Distinct samples downloaded so far.
    pub fn samples_count(&self) -> usize {
        self.samples_count
    }

    pub fn all_downloaded(&self) -> bool {
        self.samples_count == self.samples.len()
    }

    pub fn missing_samples(&self) -> Vec<SampleId> {
        self.samples
            .values()
            .filter(|s| !s.downloaded)
            .map(|s| s.id)
            .collect()
    }

    pub fn radius_validator(&self) -> U256 {
        self.radius_validator
    }

    pub fn radius_non_validator(&self) -> U256 {
        self.radius_non_validator
    }

    pub fn candidates(&self) -> &IndexMap<PeerId, Candidate> {
        &self.candidates
    }

    pub fn candidate(&self, peer: &PeerId) -> Option<&Candidate> {
        self.candidates.get(peer)
    }

    pub fn aggressiveness(&self) -> u32 {
        self.aggressiveness
    }

    /// Requests that may still be issued before the concurrency cap.
    pub fn available_requests(&self) -> usize {
        self.alpha.saturating_sub(self.in_flight)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.in_flight
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn num_messages(&self) -> u64 {
        self.num_messages
    }

    pub fn hops(&self) -> u64 {
        self.hops
    }

    /// Account for one request sent on behalf of this operation.
    pub fn record_request(&mut self) {
        self.num_messages += 1;
        self.hops += 1;
    }

    pub fn record_message(&mut self) {
        self.num_messages += 1;
    }

    pub fn mark_finished(&mut self, now: u64) {
        if self.stop.is_none() {
            self.stop = Some(now);
        }
    }

    /// Whether the request sent to `peer` in `round` is still awaited.
    pub fn is_outstanding(&self, peer: &PeerId, round: u64) -> bool {
        self.candidates
            .get(peer)
            .map_or(false, |c| c.being_asked && c.asked_round == round)
    }

    pub fn was_requested(&self, peer: &PeerId, sample: &SampleId) -> bool {
        self.requested.contains(&(*peer, *sample))
    }

    /// Samples to ask `peer` for in the current round.
    pub fn request_for(&self, peer: &PeerId) -> Vec<SampleId> {
        self.candidates
            .get(peer)
            .filter(|c| c.being_asked)
            .map(|c| c.in_flight.clone())
            .unwrap_or_default()
    }

    /// Assign every pending sample to the peers of the table responsible for
    /// it, skipping pairs already requested.
    fn collect_candidates(&mut self, table: &SearchTable) {
        for sample in self.samples.values().filter(|s| !s.downloaded) {
            for key in &sample.keys {
                let holders = table
                    .nodes_by_sample(key, &self.radius_non_validator)
                    .into_iter()
                    .chain(table.validator_nodes_by_sample(key, &self.radius_validator));

                for peer in holders {
                    if self.requested.contains(&(peer, sample.id)) {
                        continue;
                    }
                    self.candidates
                        .entry(peer)
                        .or_insert_with(|| Candidate::new(peer, self.aggressiveness))
                        .assigned
                        .insert(sample.id);
                }
            }
        }
    }

    fn pending_for(&self, candidate: &Candidate) -> usize {
        candidate
            .assigned
            .iter()
            .filter(|id| !self.is_done(id) && !self.requested.contains(&(candidate.id, **id)))
            .count()
    }

    fn is_done(&self, id: &SampleId) -> bool {
        self.samples.get(id).map_or(true, |s| s.downloaded)
    }

    /// Candidates in the order they should be tried, ineligible ones removed.
    fn ordered_candidates(&self, table: &mut SearchTable) -> Vec<PeerId> {
        let idle: Vec<PeerId> = self
            .candidates
            .values()
            .filter(|c| !c.being_asked && self.pending_for(c) > 0)
            .map(|c| c.id)
            .collect();

        if !self.security_active {
            return idle;
        }

        let profiles: Vec<CandidateProfile> = self
            .candidates
            .keys()
            .map(|peer| CandidateProfile {
                peer: *peer,
                ancestors: table.ancestors(peer),
                rating: scoring::rating_score(table.rated_list_member(peer), self.max_rating),
            })
            .collect();

        let idle: HashSet<PeerId> = idle.into_iter().collect();
        scoring::rank(&profiles, self.diversity_weight, self.rating_weight)
            .into_iter()
            .filter(|scored| idle.contains(&scored.peer) && scored.combined > 0.0)
            .map(|scored| scored.peer)
            .collect()
    }

    /// One selection round: escalate aggressiveness, rank candidates and
    /// mark as many as the concurrency cap allows as being asked.
    pub fn select_targets(&mut self, table: &mut SearchTable) -> Vec<PeerId> {
        self.rounds += 1;
        self.aggressiveness += self.aggressiveness_step;
        let aggressiveness = self.aggressiveness;
        for candidate in self.candidates.values_mut() {
            candidate.aggressiveness = aggressiveness;
        }

        self.collect_candidates(table);
        let order = self.ordered_candidates(table);

        let mut targets = Vec::new();
        for peer in order {
            if self.in_flight >= self.alpha {
                break;
            }

            let Some(candidate) = self.candidates.get(&peer) else {
                continue;
            };
            let batch: Vec<SampleId> = candidate
                .assigned
                .iter()
                .filter(|id| !self.is_done(id) && !self.requested.contains(&(peer, **id)))
                .take(aggressiveness as usize)
                .copied()
                .collect();
            if batch.is_empty() {
                continue;
            }

            for id in &batch {
                self.requested.insert((peer, *id));
                if let Some(sample) = self.samples.get_mut(id) {
                    sample.fetching_from.insert(peer);
                }
            }
            if let Some(candidate) = self.candidates.get_mut(&peer) {
                candidate.being_asked = true;
                candidate.asked_round = self.rounds;
                candidate.in_flight = batch;
            }
            self.in_flight += 1;
            targets.push(peer);
        }

        self.exhausted = targets.is_empty() && self.in_flight == 0;
        if self.exhausted {
            debug!(
                "Operation {} has no eligible candidate left, {} samples missing",
                self.id,
                self.samples.len() - self.samples_count
            );
        } else {
            trace!(
                "Operation {} round {}: {} targets at aggressiveness {}",
                self.id,
                self.rounds,
                targets.len(),
                aggressiveness
            );
        }
        targets
    }

    /// Mark located samples downloaded and release the responding peer.
    /// Returns how many samples were new.
    pub fn apply_response(&mut self, located: &[SampleId], from: Option<PeerId>) -> usize {
        let mut fresh = 0;
        for id in located {
            if let Some(sample) = self.samples.get_mut(id) {
                if !sample.downloaded {
                    sample.downloaded = true;
                    sample.fetching_from.clear();
                    self.samples_count += 1;
                    fresh += 1;
                }
            }
        }

        if let Some(peer) = from {
            self.release(&peer);
        }
        fresh
    }

    /// Give up on the outstanding request to `peer`. Returns false if no
    /// request to it was outstanding.
    pub fn release(&mut self, peer: &PeerId) -> bool {
        if !self.candidates.get(peer).map_or(false, |c| c.being_asked) {
            return false;
        }
        let Some(candidate) = self.candidates.shift_remove(peer) else {
            return false;
        };

        for id in &candidate.in_flight {
            if let Some(sample) = self.samples.get_mut(id) {
                sample.fetching_from.remove(peer);
            }
        }

        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            self.drain_round();
        }
        true
    }

    /// Forget every candidate and in-flight assignment. Candidates are
    /// rebuilt from the search table on the next round.
    pub fn drain_round(&mut self) {
        self.candidates.clear();
        for sample in self.samples.values_mut() {
            sample.fetching_from.clear();
        }
        self.in_flight = 0;
    }
}

/// Behaviour shared by the random and validator sampling variants.
pub trait SamplingOperation: Send {
    fn state(&self) -> &OperationState;

    fn state_mut(&mut self) -> &mut OperationState;

    fn completed(&self) -> bool;

    /// Canonical id of `sample` if this operation is fetching it.
    fn locate(&self, sample: &Sample) -> Option<SampleId>;

    fn kind(&self) -> &'static str;

    fn target(&self) -> Option<ValidatorTarget> {
        None
    }

    fn id(&self) -> OperationId {
        self.state().id()
    }

    /// Peers to query this round, each at most once while outstanding.
    fn do_sampling(&mut self, table: &mut SearchTable) -> Vec<PeerId> {
        if self.completed() {
            return Vec::new();
        }
        self.state_mut().select_targets(table)
    }

    /// Absorb samples received from `from` (`None` for seeds pushed to us).
    /// Returns how many samples were new.
    fn elaborate_response(&mut self, samples: &[Sample], from: Option<PeerId>) -> usize {
        let located: Vec<SampleId> = samples.iter().filter_map(|s| self.locate(s)).collect();
        self.state_mut().apply_response(&located, from)
    }

    fn abandon_request(&mut self, peer: &PeerId) -> bool {
        self.state_mut().release(peer)
    }

    fn status(&self) -> OperationStatus {
        let state = self.state();
        if self.completed() {
            OperationStatus::Completed
        } else if state.is_exhausted() {
            OperationStatus::Exhausted
        } else if state.rounds() == 0 {
            OperationStatus::Created
        } else {
            OperationStatus::Sampling
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.status(), OperationStatus::Completed | OperationStatus::Exhausted)
    }

    fn summary(&self) -> OperationSummary {
        OperationSummary::from_operation(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::GridBlock;
    use crate::search_table::Neighbour;

    pub(crate) fn grid() -> GridBlock {
        // 16 samples, step 100, non-validator radius 80
        GridBlock::new(1, 4, U256::from(1_600u64), 20).unwrap()
    }

    pub(crate) fn ctx() -> OperationContext {
        OperationContext {
            id: 1,
            src: PeerId::from(5u64),
            start: 0,
            validator: false,
            num_validators: 20,
        }
    }

    fn table_with(peers: &[u64]) -> SearchTable {
        let mut table = SearchTable::new(PeerId::from(5u64), U256::from(1_600u64), &DasConfig::default());
        for n in peers {
            table.add_neighbour(Neighbour::new(PeerId::from(*n), 0, false), None);
        }
        table
    }

    fn state(config: &DasConfig, ids: &[u64]) -> OperationState {
        let mut state = OperationState::new(ctx(), &grid(), config);
        for id in ids {
            let id = SampleId::from(*id);
            state.seed(id, vec![id]);
        }
        state
    }

    #[test]
    fn test_candidates_follow_regions() {
        let config = DasConfig::default();
        let mut state = state(&config, &[100, 500]);
        let mut table = table_with(&[90, 130, 520, 1500]);

        let targets = state.select_targets(&mut table);
        assert_eq!(targets.len(), 3);
        assert!(!targets.contains(&PeerId::from(1500u64)));
        assert_eq!(state.request_for(&PeerId::from(520u64)), vec![SampleId::from(500u64)]);
        assert_eq!(state.outstanding_requests(), 3);
        assert_eq!(state.available_requests(), 0);
    }

    #[test]
    fn test_concurrency_cap_and_single_outstanding_request() {
        let config = DasConfig {
            alpha: 2,
            security_active: false,
            ..Default::default()
        };
        let mut state = state(&config, &[100, 200, 300]);
        let mut table = table_with(&[100, 200, 300]);

        let first = state.select_targets(&mut table);
        assert_eq!(first, vec![PeerId::from(100u64), PeerId::from(200u64)]);

        // Nothing new while both requests are outstanding.
        assert!(state.select_targets(&mut table).is_empty());
        assert!(!state.is_exhausted());

        assert!(state.release(&PeerId::from(100u64)));
        let second = state.select_targets(&mut table);
        assert_eq!(second, vec![PeerId::from(300u64)]);
        assert!(!state.release(&PeerId::from(100u64)));
    }

    #[test]
    fn test_response_marks_samples_once() {
        let config = DasConfig::default();
        let mut state = state(&config, &[100, 200]);
        let mut table = table_with(&[100]);

        state.select_targets(&mut table);
        let sample = SampleId::from(100u64);
        assert!(state.sample(&sample).unwrap().fetching_from().contains(&PeerId::from(100u64)));

        assert_eq!(state.apply_response(&[sample], Some(PeerId::from(100u64))), 1);
        assert_eq!(state.apply_response(&[sample], None), 0);
        assert_eq!(state.samples_count(), 1);
        assert_eq!(state.missing_samples(), vec![SampleId::from(200u64)]);
        assert!(state.sample(&sample).unwrap().fetching_from().is_empty());
    }

    #[test]
    fn test_exhaustion_when_every_pair_was_tried() {
        let config = DasConfig::default();
        let mut state = state(&config, &[100]);
        let mut table = table_with(&[100]);

        assert_eq!(state.select_targets(&mut table).len(), 1);
        state.apply_response(&[], Some(PeerId::from(100u64)));
        assert_eq!(state.outstanding_requests(), 0);

        assert!(state.select_targets(&mut table).is_empty());
        assert!(state.is_exhausted());
    }

    #[test]
    fn test_aggressiveness_bounds_batch_size() {
        let config = DasConfig {
            aggressiveness_step: 1,
            ..Default::default()
        };
        let mut state = state(&config, &[100, 110, 120]);
        let mut table = table_with(&[110]);

        state.select_targets(&mut table);
        assert_eq!(state.request_for(&PeerId::from(110u64)).len(), 1);
        state.apply_response(&[], Some(PeerId::from(110u64)));

        state.select_targets(&mut table);
        assert_eq!(state.aggressiveness(), 2);
        assert_eq!(state.request_for(&PeerId::from(110u64)).len(), 2);
    }

    #[test]
    fn test_security_skips_defunct_direct_peers() {
        let config = DasConfig::default();
        let mut state = state(&config, &[100]);
        let mut table = table_with(&[100, 120]);
        table.set_defunct(&PeerId::from(100u64));

        let targets = state.select_targets(&mut table);
        assert_eq!(targets, vec![PeerId::from(120u64)]);
    }
}
