use das_sim_types::{PeerId, SampleId, U256};
use indexmap::IndexMap;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

use crate::block::{Sample, SharedBlock};
use crate::config::DasConfig;
use crate::operations::{
    OperationContext, OperationId, RandomSamplingOperation, SamplingOperation, ValidatorSamplingOperation,
    ValidatorTarget,
};
use crate::report::OperationSummary;
use crate::search_table::{Neighbour, SearchTable};
use crate::{DasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Builder,
    Validator,
    NonValidator,
}

#[derive(Debug, Clone)]
pub enum Message {
    /// A new block is available (delivered by the environment).
    InitNewBlock { block: SharedBlock },
    /// Samples pushed by the builder to the peers responsible for them.
    SeedSample { samples: Vec<Sample> },
    /// `round` is echoed in the response so late answers can be told apart
    /// from the request currently outstanding to the same peer.
    GetSample {
        op: OperationId,
        block_id: u64,
        round: u64,
        samples: Vec<SampleId>,
    },
    GetSampleResponse {
        op: OperationId,
        block_id: u64,
        round: u64,
        samples: Vec<Sample>,
        neighbours: Vec<Neighbour>,
    },
    /// Peers found by the routing layer.
    NodesFound {
        neighbours: Vec<Neighbour>,
        validators: Vec<PeerId>,
    },
    /// Timer set when a request is sent.
    RequestTimeout {
        op: OperationId,
        peer: PeerId,
        round: u64,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::InitNewBlock { .. } => "InitNewBlock",
            Message::SeedSample { .. } => "SeedSample",
            Message::GetSample { .. } => "GetSample",
            Message::GetSampleResponse { .. } => "GetSampleResponse",
            Message::NodesFound { .. } => "NodesFound",
            Message::RequestTimeout { .. } => "RequestTimeout",
        }
    }
}

/// Message delivery and timers, provided by the simulation substrate.
pub trait Transport {
    /// Current logical time.
    fn now(&self) -> u64;

    fn send(&mut self, from: PeerId, to: PeerId, message: Message);

    /// Deliver `message` back to `node` after `delay`.
    fn schedule(&mut self, node: PeerId, delay: u64, message: Message);
}

pub trait Routing {
    fn is_up(&self, peer: &PeerId) -> bool;
}

pub trait Network: Transport + Routing {}

impl<T: Transport + Routing + ?Sized> Network for T {}

/// Row or column assigned to the validator with `index` in a block of
/// `size`: indices cycle over every row, then every column.
pub fn validator_target(index: u32, size: u32) -> ValidatorTarget {
    let slot = index % (2 * size);
    if slot < size {
        ValidatorTarget::Row(slot + 1)
    } else {
        ValidatorTarget::Column(slot - size + 1)
    }
}

pub struct DasProtocol {
    id: PeerId,
    role: Role,
    malicious: bool,
    config: DasConfig,
    builder: Option<PeerId>,
    validator_index: u32,
    num_validators: usize,

    table: SearchTable,
    kv: HashMap<(u64, SampleId), Sample>,
    current_block: Option<SharedBlock>,

    operations: IndexMap<OperationId, Box<dyn SamplingOperation>>,
    finished: Vec<OperationSummary>,
    next_operation: OperationId,

    rng: ChaCha8Rng,
}

impl DasProtocol {
    pub fn new(id: PeerId, role: Role, max_key: U256, config: DasConfig, seed: u64) -> Self {
        Self {
            id,
            role,
            malicious: false,
            table: SearchTable::new(id, max_key, &config),
            config,
            builder: None,
            validator_index: 0,
            num_validators: 0,
            kv: HashMap::new(),
            current_block: None,
            operations: IndexMap::new(),
            finished: Vec::new(),
            next_operation: 1,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Answer requests with no samples and advertise only malicious peers.
    pub fn set_malicious(&mut self) {
        self.malicious = true;
        self.table.set_only_add_evil_neighbours();
    }

    pub fn set_builder_address(&mut self, builder: PeerId) {
        self.builder = Some(builder);
        self.table.set_builder_address(builder);
    }

    pub fn set_validator_index(&mut self, index: u32) {
        self.validator_index = index;
    }

    pub fn set_num_validators(&mut self, num_validators: usize) {
        self.num_validators = num_validators;
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_builder(&self) -> bool {
        self.role == Role::Builder
    }

    pub fn is_malicious(&self) -> bool {
        self.malicious
    }

    pub fn search_table(&self) -> &SearchTable {
        &self.table
    }

    pub fn search_table_mut(&mut self) -> &mut SearchTable {
        &mut self.table
    }

    pub fn stored_samples(&self) -> usize {
        self.kv.len()
    }

    pub fn has_sample(&self, block_id: u64, id: &SampleId) -> bool {
        self.kv.contains_key(&(block_id, *id))
    }

    pub fn running_operations(&self) -> impl Iterator<Item = &dyn SamplingOperation> + '_ {
        self.operations.values().map(|op| op.as_ref())
    }

    /// Summaries of finished operations followed by the running ones.
    pub fn operation_summaries(&self) -> Vec<OperationSummary> {
        self.finished
            .iter()
            .cloned()
            .chain(self.operations.values().map(|op| op.summary()))
            .collect()
    }

    pub fn handle(&mut self, from: Option<PeerId>, message: Message, net: &mut dyn Network) -> Result<()> {
        trace!("Node {} handling {} from {:?}", self.id, message.name(), from);

        match message {
            Message::InitNewBlock { block } => self.handle_init_new_block(block, net)?,
            Message::SeedSample { samples } => self.handle_seed_sample(samples, net)?,
            Message::GetSample {
                op,
                block_id,
                round,
                samples,
            } => {
                if let Some(from) = from {
                    self.handle_get_sample(from, op, block_id, round, &samples, net);
                }
            }
            Message::GetSampleResponse {
                op,
                block_id,
                round,
                samples,
                neighbours,
            } => {
                if let Some(from) = from {
                    self.handle_get_sample_response(from, op, block_id, round, samples, neighbours, net);
                }
            }
            Message::NodesFound { neighbours, validators } => self.handle_nodes_found(neighbours, validators),
            Message::RequestTimeout { op, peer, round } => self.handle_request_timeout(op, peer, round, net),
        }

        self.retire_finished(net.now());
        Ok(())
    }

    fn handle_init_new_block(&mut self, block: SharedBlock, net: &mut dyn Network) -> Result<()> {
        let now = net.now();
        let expired = self.table.refresh(now);
        if expired > 0 {
            debug!("Node {} expired {} neighbours", self.id, expired);
        }
        if self.config.purge_defunct {
            self.table.check_nodes_to_purge();
        }

        // Operations of the previous block are superseded.
        for (_, mut op) in self.operations.drain(..) {
            op.state_mut().mark_finished(now);
            self.finished.push(op.summary());
        }

        self.current_block = Some(block.clone());

        if self.is_builder() {
            self.seed_block(&block, net);
            return Ok(());
        }

        self.start_random_sampling(&block, now);
        if self.role == Role::Validator {
            self.start_validator_sampling(&block, now)?;
        }

        let ids: Vec<OperationId> = self.operations.keys().copied().collect();
        for id in ids {
            self.continue_sampling(id, net);
        }
        Ok(())
    }

    fn next_context(&mut self, now: u64) -> OperationContext {
        let id = self.next_operation;
        self.next_operation += 1;
        OperationContext {
            id,
            src: self.id,
            start: now,
            validator: self.role == Role::Validator,
            num_validators: self.num_validators,
        }
    }

    fn start_random_sampling(&mut self, block: &SharedBlock, now: u64) {
        let ctx = self.next_context(now);
        let mut op = RandomSamplingOperation::with_samples(
            ctx,
            block.as_ref(),
            &block.random_samples(self.config.num_samples, &mut self.rng),
            &self.config,
        );
        self.absorb_stored(&mut op);

        debug!("Node {} starting random sampling of block {}", self.id, block.block_id());
        self.operations.insert(ctx.id, Box::new(op));
    }

    fn start_validator_sampling(&mut self, block: &SharedBlock, now: u64) -> Result<()> {
        let target = validator_target(self.validator_index, block.size());
        let ctx = self.next_context(now);
        let mut op = ValidatorSamplingOperation::new(ctx, block.as_ref(), target, &self.config)?;
        self.absorb_stored(&mut op);

        debug!("Validator {} sampling {:?} of block {}", self.id, target, block.block_id());
        self.operations.insert(ctx.id, Box::new(op));
        Ok(())
    }

    /// Feed samples already held locally (e.g. seeds that arrived before the
    /// announcement) into a new operation.
    fn absorb_stored(&self, op: &mut dyn SamplingOperation) {
        let block_id = op.state().block_id();
        let held: Vec<Sample> = op
            .state()
            .missing_samples()
            .iter()
            .filter_map(|id| self.kv.get(&(block_id, *id)).cloned())
            .collect();
        if !held.is_empty() {
            op.elaborate_response(&held, None);
        }
    }

    /// Push every sample to the known peers whose region holds it.
    fn seed_block(&mut self, block: &SharedBlock, net: &mut dyn Network) {
        let copies = self.config.sample_copies_per_peer;
        let mut radius_validator = block.region_radius(copies, Some(self.num_validators));
        let radius_non_validator = block.region_radius(copies, None);

        let mut batches: IndexMap<PeerId, Vec<Sample>> = IndexMap::new();
        let mut within_region = 0usize;

        for sample in block.samples() {
            self.kv.insert((sample.block_id, sample.id()), sample.clone());

            let keys = [sample.id_by_row, sample.id_by_column];
            let holders: Vec<PeerId> = keys
                .iter()
                .flat_map(|key| {
                    self.table
                        .validator_nodes_by_sample(key, &radius_validator)
                        .into_iter()
                        .chain(self.table.non_validator_nodes_by_sample(key, &radius_non_validator))
                })
                .filter(|peer| net.is_up(peer))
                .collect();

            if holders.is_empty() {
                radius_validator = radius_validator.saturating_mul(U256::from(2u64));
                continue;
            }

            within_region += 1;
            for peer in holders {
                let batch = batches.entry(peer).or_default();
                if !batch.iter().any(|s| s.id() == sample.id()) {
                    batch.push(sample.clone());
                }
            }
        }

        info!(
            "Builder seeded block {}: {} of {} samples within a node's region, {} peers",
            block.block_id(),
            within_region,
            block.num_samples(),
            batches.len()
        );

        for (peer, samples) in batches {
            net.send(self.id, peer, Message::SeedSample { samples });
        }
    }

    fn handle_seed_sample(&mut self, samples: Vec<Sample>, net: &mut dyn Network) -> Result<()> {
        if self.is_builder() {
            return Err(DasError::UnexpectedMessage {
                role: self.role,
                message: "SeedSample",
            });
        }

        for sample in &samples {
            self.kv.insert((sample.block_id, sample.id()), sample.clone());
        }
        for op in self.operations.values_mut() {
            op.elaborate_response(&samples, None);
        }

        trace!("Node {} stored {} seeded samples", self.id, samples.len());
        let ids: Vec<OperationId> = self.operations.keys().copied().collect();
        for id in ids {
            self.continue_sampling(id, net);
        }
        Ok(())
    }

    fn handle_get_sample(
        &mut self,
        from: PeerId,
        op: OperationId,
        block_id: u64,
        round: u64,
        requested: &[SampleId],
        net: &mut dyn Network,
    ) {
        if self.is_builder() {
            debug!("Builder ignoring sample request from {}", from);
            return;
        }

        let evil = self.table.is_evil(&from);
        self.table.seen_neighbour(from, evil, net.now());

        let samples: Vec<Sample> = if self.malicious {
            Vec::new()
        } else {
            requested
                .iter()
                .filter_map(|id| self.kv.get(&(block_id, *id)).cloned())
                .collect()
        };
        let neighbours: Vec<Neighbour> = self
            .table
            .neighbours()
            .into_iter()
            .filter(|n| n.id != from && (!self.malicious || n.evil))
            .collect();

        trace!(
            "Node {} answering {} with {}/{} samples",
            self.id,
            from,
            samples.len(),
            requested.len()
        );
        net.send(
            self.id,
            from,
            Message::GetSampleResponse {
                op,
                block_id,
                round,
                samples,
                neighbours,
            },
        );
    }

    fn handle_get_sample_response(
        &mut self,
        from: PeerId,
        op_id: OperationId,
        block_id: u64,
        round: u64,
        samples: Vec<Sample>,
        neighbours: Vec<Neighbour>,
        net: &mut dyn Network,
    ) {
        if self.is_builder() {
            debug!("Builder ignoring sample response from {}", from);
            return;
        }

        let now = net.now();
        for sample in samples.iter().filter(|s| s.block_id == block_id) {
            self.kv.insert((sample.block_id, sample.id()), sample.clone());
        }

        let evil = self.table.is_evil(&from);
        self.table.seen_neighbour(from, evil, now);
        let admitted = neighbours
            .into_iter()
            .filter(|n| self.table.add_neighbour(n.clone(), Some(from)))
            .count();
        trace!("Node {} admitted {} neighbours from {}", self.id, admitted, from);

        match self.operations.get_mut(&op_id) {
            Some(op) => {
                op.state_mut().record_message();

                if op.state().is_outstanding(&from, round) {
                    let requested = op.state().request_for(&from);
                    let fresh = op.elaborate_response(&samples, Some(from));

                    if samples.iter().any(|s| requested.contains(&s.id())) {
                        self.table.successful_sample(&from);
                    } else {
                        self.table.failed_sample(&from);
                    }
                    trace!("Operation {} received {} new samples from {}", op_id, fresh, from);
                } else {
                    // Answer to a request that already timed out: keep the
                    // samples, leave the current request to this peer alone.
                    let fresh = op.elaborate_response(&samples, None);
                    if samples.iter().any(|s| op.state().was_requested(&from, &s.id())) {
                        self.table.successful_sample(&from);
                    }
                    debug!(
                        "Late response from {} for operation {} round {} with {} new samples",
                        from, op_id, round, fresh
                    );
                }
            }
            None => debug!("Response from {} for unknown operation {}", from, op_id),
        }

        for (id, op) in self.operations.iter_mut() {
            if *id != op_id {
                op.elaborate_response(&samples, None);
            }
        }

        let ids: Vec<OperationId> = self.operations.keys().copied().collect();
        for id in ids {
            self.continue_sampling(id, net);
        }
    }

    fn handle_nodes_found(&mut self, neighbours: Vec<Neighbour>, validators: Vec<PeerId>) {
        let mut plain = Vec::with_capacity(neighbours.len());
        for neighbour in neighbours {
            if !validators.contains(&neighbour.id) {
                plain.push(neighbour.id);
            }
            self.table.add_neighbour(neighbour, None);
        }
        self.table.add_validator_nodes(&validators);
        self.table.add_nodes(&plain);
    }

    fn handle_request_timeout(&mut self, op_id: OperationId, peer: PeerId, round: u64, net: &mut dyn Network) {
        let Some(op) = self.operations.get_mut(&op_id) else {
            return;
        };

        if !op.state().is_outstanding(&peer, round) {
            return;
        }

        op.abandon_request(&peer);
        self.table.failed_sample(&peer);
        debug!("Request to {} timed out for operation {}", peer, op_id);

        self.continue_sampling(op_id, net);
    }

    /// Run selection rounds for one operation and send the requests.
    fn continue_sampling(&mut self, op_id: OperationId, net: &mut dyn Network) {
        let Some(op) = self.operations.get_mut(&op_id) else {
            return;
        };
        let block_id = op.state().block_id();

        for peer in op.do_sampling(&mut self.table) {
            if Some(peer) == self.builder {
                warn!("Operation {} selected the builder, skipping", op_id);
                op.abandon_request(&peer);
                continue;
            }

            let samples = op.state().request_for(&peer);
            let round = op.state().rounds();
            op.state_mut().record_request();

            net.send(
                self.id,
                peer,
                Message::GetSample {
                    op: op_id,
                    block_id,
                    round,
                    samples,
                },
            );
            net.schedule(
                self.id,
                self.config.request_timeout,
                Message::RequestTimeout { op: op_id, peer, round },
            );
        }
    }

    fn retire_finished(&mut self, now: u64) {
        let done: Vec<OperationId> = self
            .operations
            .iter()
            .filter(|(_, op)| op.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in done {
            if let Some(mut op) = self.operations.shift_remove(&id) {
                op.state_mut().mark_finished(now);
                let summary = op.summary();
                info!(
                    "Node {} {} {} for block {}: {:?} with {} samples after {} requests",
                    self.id,
                    summary.kind,
                    id,
                    summary.block_id,
                    summary.status,
                    summary.samples,
                    summary.hops
                );
                self.finished.push(summary);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{GridBlock, SampleSource};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingNetwork {
        now: u64,
        sent: Vec<(PeerId, PeerId, Message)>,
        scheduled: Vec<(PeerId, u64, Message)>,
        down: HashSet<PeerId>,
    }

    impl Transport for RecordingNetwork {
        fn now(&self) -> u64 {
            self.now
        }

        fn send(&mut self, from: PeerId, to: PeerId, message: Message) {
            self.sent.push((from, to, message));
        }

        fn schedule(&mut self, node: PeerId, delay: u64, message: Message) {
            self.scheduled.push((node, delay, message));
        }
    }

    impl Routing for RecordingNetwork {
        fn is_up(&self, peer: &PeerId) -> bool {
            !self.down.contains(peer)
        }
    }

    fn peer(n: u64) -> PeerId {
        PeerId::from(n)
    }

    const MAX_KEY: u64 = 1_600;

    fn block() -> SharedBlock {
        // 16 samples spaced 100 apart, radius 80 for 20 peers
        Arc::new(GridBlock::new(1, 4, U256::from(MAX_KEY), 20).unwrap())
    }

    fn node(id: u64, role: Role) -> DasProtocol {
        let config = DasConfig {
            num_samples: 4,
            ..Default::default()
        };
        let mut node = DasProtocol::new(peer(id), role, U256::from(MAX_KEY), config, id);
        node.set_builder_address(peer(1));
        node.set_num_validators(20);
        node
    }

    fn found(ids: &[u64]) -> Message {
        Message::NodesFound {
            neighbours: ids.iter().map(|n| Neighbour::new(peer(*n), 0, false)).collect(),
            validators: Vec::new(),
        }
    }

    #[test]
    fn test_builder_seeds_peers_in_region() {
        let mut builder = DasProtocol::new(peer(1), Role::Builder, U256::from(MAX_KEY), DasConfig::default(), 1);
        builder.set_num_validators(20);
        let mut net = RecordingNetwork::default();
        builder.handle(None, found(&[0, 450, 1203]), &mut net).unwrap();
        net.down.insert(peer(1203));

        builder.handle(None, Message::InitNewBlock { block: block() }, &mut net).unwrap();
        assert_eq!(builder.stored_samples(), 16);

        let receivers: HashSet<PeerId> = net.sent.iter().map(|(_, to, _)| *to).collect();
        assert_eq!(receivers, [peer(0), peer(450)].into_iter().collect());

        // Peer 450 holds row id 400 and 500 samples, as well as column id 400 and 500 ones.
        let (_, _, message) = net.sent.iter().find(|(_, to, _)| *to == peer(450)).unwrap();
        match message {
            Message::SeedSample { samples } => {
                assert!(samples.iter().all(|s| s.is_in_region_by_row(&peer(450), &U256::from(80u64))
                    || s.is_in_region_by_column(&peer(450), &U256::from(80u64))));
                assert!(!samples.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(builder.running_operations().next().is_none());
    }

    #[test]
    fn test_builder_rejects_seeds() {
        let mut builder = DasProtocol::new(peer(1), Role::Builder, U256::from(MAX_KEY), DasConfig::default(), 1);
        let mut net = RecordingNetwork::default();
        let result = builder.handle(Some(peer(2)), Message::SeedSample { samples: Vec::new() }, &mut net);
        assert!(matches!(result, Err(DasError::UnexpectedMessage { role: Role::Builder, .. })));
    }

    #[test]
    fn test_new_block_starts_sampling_within_budget() {
        let mut node = node(5, Role::NonValidator);
        let mut net = RecordingNetwork::default();
        let all: Vec<u64> = (0..16).map(|i| i * 100 + 10).collect();
        node.handle(None, found(&all), &mut net).unwrap();

        node.handle(None, Message::InitNewBlock { block: block() }, &mut net).unwrap();

        let requests: Vec<_> = net
            .sent
            .iter()
            .filter(|(_, _, m)| matches!(m, Message::GetSample { .. }))
            .collect();
        assert_eq!(requests.len(), DasConfig::default().alpha);
        assert_eq!(net.scheduled.len(), requests.len());
        assert!(requests.iter().all(|(from, to, _)| *from == peer(5) && *to != peer(1)));
    }

    #[test]
    fn test_serves_stored_samples_and_neighbours() {
        let mut node = node(5, Role::NonValidator);
        let mut net = RecordingNetwork::default();
        node.handle(None, found(&[300, 700]), &mut net).unwrap();

        let grid = GridBlock::new(1, 4, U256::from(MAX_KEY), 20).unwrap();
        let seeded = vec![grid.sample(1, 1), grid.sample(2, 2)];
        node.handle(Some(peer(1)), Message::SeedSample { samples: seeded.clone() }, &mut net)
            .unwrap();

        let request = Message::GetSample {
            op: 9,
            block_id: 1,
            round: 1,
            samples: vec![seeded[0].id(), grid.sample(4, 4).id()],
        };
        node.handle(Some(peer(300)), request, &mut net).unwrap();

        let (_, to, response) = net.sent.last().unwrap();
        assert_eq!(*to, peer(300));
        match response {
            Message::GetSampleResponse {
                op,
                round,
                samples,
                neighbours,
                ..
            } => {
                assert_eq!(*op, 9);
                assert_eq!(*round, 1);
                assert_eq!(samples, &vec![seeded[0].clone()]);
                assert_eq!(neighbours.iter().map(|n| n.id).collect::<Vec<_>>(), vec![peer(700)]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_malicious_node_withholds_samples() {
        let mut node = node(5, Role::NonValidator);
        node.set_malicious();
        let mut net = RecordingNetwork::default();
        node.handle(
            None,
            Message::NodesFound {
                neighbours: vec![Neighbour::new(peer(300), 0, false), Neighbour::new(peer(400), 0, true)],
                validators: Vec::new(),
            },
            &mut net,
        )
        .unwrap();

        let grid = GridBlock::new(1, 4, U256::from(MAX_KEY), 20).unwrap();
        node.handle(Some(peer(1)), Message::SeedSample { samples: vec![grid.sample(1, 1)] }, &mut net)
            .unwrap();
        let request = Message::GetSample {
            op: 1,
            block_id: 1,
            round: 1,
            samples: vec![grid.sample(1, 1).id()],
        };
        node.handle(Some(peer(600)), request, &mut net).unwrap();

        match &net.sent.last().unwrap().2 {
            Message::GetSampleResponse { samples, neighbours, .. } => {
                assert!(samples.is_empty());
                assert_eq!(neighbours.iter().map(|n| n.id).collect::<Vec<_>>(), vec![peer(400)]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_response_rewards_and_admits_neighbours() {
        let mut node = node(5, Role::NonValidator);
        let mut net = RecordingNetwork::default();
        let all: Vec<u64> = (0..16).map(|i| i * 100 + 10).collect();
        node.handle(None, found(&all), &mut net).unwrap();
        node.handle(None, Message::InitNewBlock { block: block() }, &mut net).unwrap();

        let (_, target, request) = net
            .sent
            .iter()
            .find(|(_, _, m)| matches!(m, Message::GetSample { .. }))
            .cloned()
            .unwrap();
        let Message::GetSample {
            op,
            block_id,
            round,
            samples,
        } = request
        else {
            unreachable!()
        };

        let grid = GridBlock::new(1, 4, U256::from(MAX_KEY), 20).unwrap();
        let answer: Vec<Sample> = grid.samples().into_iter().filter(|s| samples.contains(&s.id())).collect();
        let before = node.search_table().rated_list().member(&target).unwrap().rating();

        let response = Message::GetSampleResponse {
            op,
            block_id,
            round,
            samples: answer,
            neighbours: vec![Neighbour::new(peer(1555), 0, false)],
        };
        node.handle(Some(target), response, &mut net).unwrap();

        let member = node.search_table().rated_list().member(&target).unwrap();
        assert!(member.rating() > before);
        let child = node.search_table().rated_list().member(&peer(1555)).unwrap();
        assert_eq!(child.level(), 1);
        assert!(node.search_table().nodes_indexed().contains(&peer(1555)));
    }

    #[test]
    fn test_timeout_penalizes_and_retries() {
        let mut node = node(5, Role::NonValidator);
        let mut net = RecordingNetwork::default();
        let all: Vec<u64> = (0..16).map(|i| i * 100 + 10).collect();
        node.handle(None, found(&all), &mut net).unwrap();
        node.handle(None, Message::InitNewBlock { block: block() }, &mut net).unwrap();

        let (_, _, timeout) = net.scheduled[0].clone();
        let Message::RequestTimeout { peer: target, .. } = timeout.clone() else {
            unreachable!()
        };
        let sent_before = net.sent.len();

        net.now = 500;
        node.handle(None, timeout.clone(), &mut net).unwrap();
        let member = node.search_table().rated_list().member(&target).unwrap();
        assert_eq!(member.consecutive_failures(), 1);
        assert!(net.sent.len() > sent_before);

        // A repeated timer for the same request is ignored.
        node.handle(None, timeout, &mut net).unwrap();
        let member = node.search_table().rated_list().member(&target).unwrap();
        assert_eq!(member.consecutive_failures(), 1);
    }

    #[test]
    fn test_late_response_is_credited_without_releasing_retry() {
        let config = DasConfig {
            num_samples: 4,
            alpha: 1,
            aggressiveness_step: 1,
            ..Default::default()
        };
        let mut node = DasProtocol::new(peer(5), Role::NonValidator, U256::from(MAX_KEY), config, 5);
        node.set_builder_address(peer(1));
        node.set_num_validators(20);
        let mut net = RecordingNetwork::default();
        node.handle(None, found(&[150]), &mut net).unwrap();

        // A single-peer network: every sample lies in peer 150's region.
        let block: SharedBlock = Arc::new(GridBlock::new(1, 4, U256::from(MAX_KEY), 1).unwrap());
        node.handle(None, Message::InitNewBlock { block: block.clone() }, &mut net).unwrap();

        let Some((_, target, Message::GetSample { op, block_id, round, samples: first })) = net.sent.last().cloned()
        else {
            panic!("no request sent");
        };
        assert_eq!(target, peer(150));
        assert_eq!(first.len(), 1);

        net.now = 500;
        let (_, _, timeout) = net.scheduled[0].clone();
        node.handle(None, timeout, &mut net).unwrap();
        let after_timeout = node.search_table().rated_list().member(&peer(150)).unwrap().rating();
        assert_eq!(
            node.search_table().rated_list().member(&peer(150)).unwrap().consecutive_failures(),
            1
        );

        let Some((_, _, Message::GetSample { round: retry_round, samples: retry, .. })) = net.sent.last().cloned()
        else {
            panic!("no retry sent");
        };
        assert_ne!(retry_round, round);
        assert!(!retry.is_empty());
        assert!(!retry.contains(&first[0]));

        let answer: Vec<Sample> = block.samples().into_iter().filter(|s| first.contains(&s.id())).collect();
        net.now = 600;
        node.handle(
            Some(peer(150)),
            Message::GetSampleResponse {
                op,
                block_id,
                round,
                samples: answer,
                neighbours: Vec::new(),
            },
            &mut net,
        )
        .unwrap();

        let member = node.search_table().rated_list().member(&peer(150)).unwrap();
        assert_eq!(member.consecutive_failures(), 0);
        assert!(member.rating() > after_timeout);

        let operation = node.running_operations().next().unwrap();
        assert!(!operation.state().missing_samples().contains(&first[0]));
        assert!(operation.state().is_outstanding(&peer(150), retry_round));
        assert_eq!(operation.state().outstanding_requests(), 1);
    }

    #[test]
    fn test_validator_targets_cycle_rows_then_columns() {
        assert_eq!(validator_target(0, 4), ValidatorTarget::Row(1));
        assert_eq!(validator_target(3, 4), ValidatorTarget::Row(4));
        assert_eq!(validator_target(4, 4), ValidatorTarget::Column(1));
        assert_eq!(validator_target(9, 4), ValidatorTarget::Row(2));
    }

    #[test]
    fn test_validator_runs_row_or_column_operation() {
        let mut node = node(5, Role::Validator);
        node.set_validator_index(5);
        let mut net = RecordingNetwork::default();
        node.handle(None, Message::InitNewBlock { block: block() }, &mut net).unwrap();

        let summaries = node.operation_summaries();
        assert_eq!(summaries.len(), 2);
        let validator = summaries
            .iter()
            .find(|s| s.kind == "ValidatorSamplingOperation")
            .unwrap();
        assert_eq!(validator.column, Some(2));
        assert!(validator.validator);
    }
}
