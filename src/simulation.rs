use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::{Context, Result};
use das_sim_core::{
    DasProtocol, GridBlock, Message, Neighbour, OperationStatus, OperationSummary, Role, Routing,
    SharedBlock, Transport,
};
use das_sim_types::{KeyspaceExt, PeerId, U256};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;

struct Event {
    time: u64,
    seq: u64,
    target: usize,
    from: Option<PeerId>,
    message: Message,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

/// Min-queue of pending deliveries, FIFO among equal timestamps.
#[derive(Default)]
struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    seq: u64,
}

impl EventQueue {
    fn push(&mut self, time: u64, target: usize, from: Option<PeerId>, message: Message) {
        self.seq += 1;
        self.heap.push(Reverse(Event {
            time,
            seq: self.seq,
            target,
            from,
            message,
        }));
    }

    fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(event)| event)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub events: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub handler_errors: u64,
}

/// The view of the simulation one node gets while handling an event.
struct SimNetwork<'a> {
    now: u64,
    latency: (u64, u64),
    queue: &'a mut EventQueue,
    index: &'a HashMap<PeerId, usize>,
    down: &'a BTreeSet<PeerId>,
    rng: &'a mut ChaCha8Rng,
    stats: &'a mut TrafficStats,
}

impl Transport for SimNetwork<'_> {
    fn now(&self) -> u64 {
        self.now
    }

    fn send(&mut self, from: PeerId, to: PeerId, message: Message) {
        self.stats.messages_sent += 1;
        match self.index.get(&to) {
            Some(&target) if !self.down.contains(&to) => {
                let (min, max) = self.latency;
                let delay = self.rng.gen_range(min..=max);
                self.queue.push(self.now + delay, target, Some(from), message);
            }
            _ => self.stats.messages_dropped += 1,
        }
    }

    fn schedule(&mut self, node: PeerId, delay: u64, message: Message) {
        if let Some(&target) = self.index.get(&node) {
            self.queue.push(self.now + delay, target, None, message);
        }
    }
}

impl Routing for SimNetwork<'_> {
    fn is_up(&self, peer: &PeerId) -> bool {
        self.index.contains_key(peer) && !self.down.contains(peer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub nodes: usize,
    pub validators: usize,
    pub malicious: usize,
    pub down: usize,
    pub blocks: u64,
    pub end_time: u64,
    pub cancelled: bool,
    pub traffic: TrafficStats,
    pub operations: Vec<OperationSummary>,
}

impl SimulationReport {
    /// Share of operations that reached their completion predicate.
    pub fn completion_rate(&self) -> f64 {
        if self.operations.is_empty() {
            return 0.0;
        }
        let completed = self.operations.iter().filter(|op| op.completed).count();
        completed as f64 / self.operations.len() as f64
    }

    pub fn count_status(&self, status: OperationStatus) -> usize {
        self.operations.iter().filter(|op| op.status == status).count()
    }
}

pub struct Simulation {
    config: Config,
    max_key: U256,
    nodes: Vec<DasProtocol>,
    index: HashMap<PeerId, usize>,
    malicious: BTreeSet<PeerId>,
    down: BTreeSet<PeerId>,
    queue: EventQueue,
    rng: ChaCha8Rng,
    stats: TrafficStats,
    now: u64,
}

/// Node 0 is always the builder.
const BUILDER: usize = 0;

impl Simulation {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let sim = &config.simulation;
        let mut rng = ChaCha8Rng::seed_from_u64(sim.seed);
        let max_key = U256::keyspace_max(sim.key_bits).context("Invalid keyspace width")?;

        // Distinct ids for the builder and every node.
        let mut ids = Vec::with_capacity(sim.nodes + 1);
        let mut seen = HashSet::new();
        while ids.len() < sim.nodes + 1 {
            let id = U256::random_key(&mut rng, &max_key);
            if seen.insert(id) {
                ids.push(id);
            }
        }
        let builder_id = ids[BUILDER];

        let mut others: Vec<usize> = (1..=sim.nodes).collect();
        others.shuffle(&mut rng);
        let validators: BTreeSet<usize> = others.iter().take(sim.validators).copied().collect();

        others.shuffle(&mut rng);
        let malicious_count = (sim.malicious_fraction * sim.nodes as f64).floor() as usize;
        let malicious: BTreeSet<PeerId> = others.iter().take(malicious_count).map(|i| ids[*i]).collect();

        others.shuffle(&mut rng);
        let down_count = (sim.down_fraction * sim.nodes as f64).floor() as usize;
        let down: BTreeSet<PeerId> = others.iter().take(down_count).map(|i| ids[*i]).collect();

        let mut nodes = Vec::with_capacity(ids.len());
        let mut validator_index = 0u32;
        for (i, id) in ids.iter().enumerate() {
            let role = if i == BUILDER {
                Role::Builder
            } else if validators.contains(&i) {
                Role::Validator
            } else {
                Role::NonValidator
            };

            let mut node = DasProtocol::new(*id, role, max_key, config.das.clone(), rng.gen());
            node.set_num_validators(sim.validators);
            if i != BUILDER {
                node.set_builder_address(builder_id);
            }
            if role == Role::Validator {
                node.set_validator_index(validator_index);
                validator_index += 1;
            }
            if malicious.contains(id) {
                node.set_malicious();
                node.search_table_mut().set_evil_ids(malicious.iter().copied());
            }
            nodes.push(node);
        }

        let index = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        info!(
            "Simulation of {} nodes ({} validators, {} malicious, {} down), seed {}",
            sim.nodes,
            sim.validators,
            malicious.len(),
            down.len(),
            sim.seed
        );

        let mut simulation = Self {
            config,
            max_key,
            nodes,
            index,
            malicious,
            down,
            queue: EventQueue::default(),
            rng,
            stats: TrafficStats::default(),
            now: 0,
        };
        simulation.bootstrap(&ids, &validators);
        simulation.announce_blocks()?;
        Ok(simulation)
    }

    fn neighbour(&self, id: PeerId) -> Neighbour {
        Neighbour::new(id, 0, self.malicious.contains(&id))
    }

    fn validator_ids(&self, ids: &[PeerId], validators: &BTreeSet<usize>) -> Vec<PeerId> {
        validators.iter().map(|i| ids[*i]).collect()
    }

    /// Give the builder the whole network and every node a random set of
    /// direct neighbours. Malicious nodes also learn each other.
    fn bootstrap(&mut self, ids: &[PeerId], validators: &BTreeSet<usize>) {
        let validator_ids = self.validator_ids(ids, validators);
        let all: Vec<Neighbour> = ids[1..].iter().map(|id| self.neighbour(*id)).collect();

        self.queue.push(
            0,
            BUILDER,
            None,
            Message::NodesFound {
                neighbours: all.clone(),
                validators: validator_ids.clone(),
            },
        );

        let wanted = self.config.simulation.bootstrap_neighbours;
        let evil: Vec<Neighbour> = self.malicious.iter().map(|id| self.neighbour(*id)).collect();

        for (i, id) in ids.iter().enumerate().skip(1) {
            let mut neighbours: Vec<Neighbour> = all
                .choose_multiple(&mut self.rng, wanted.min(all.len()))
                .filter(|n| n.id != *id)
                .cloned()
                .collect();
            if self.malicious.contains(id) {
                neighbours.extend(evil.iter().filter(|n| n.id != *id).cloned());
            }

            let known: HashSet<PeerId> = neighbours.iter().map(|n| n.id).collect();
            let validators = validator_ids.iter().filter(|v| known.contains(*v)).copied().collect();

            self.queue.push(0, i, None, Message::NodesFound { neighbours, validators });
        }
    }

    fn announce_blocks(&mut self) -> Result<()> {
        let sim = &self.config.simulation;
        for b in 0..sim.blocks {
            let block: SharedBlock = Arc::new(
                GridBlock::new(b + 1, sim.block_size, self.max_key, sim.nodes)
                    .context("Failed to build block")?,
            );
            let at = sim.block_interval * b + 1;

            self.queue.push(at, BUILDER, None, Message::InitNewBlock { block: block.clone() });
            for i in 1..self.nodes.len() {
                if self.down.contains(&self.nodes[i].id()) {
                    continue;
                }
                self.queue.push(
                    at + sim.block_propagation_delay,
                    i,
                    None,
                    Message::InitNewBlock { block: block.clone() },
                );
            }
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[DasProtocol] {
        &self.nodes
    }

    pub fn node(&self, id: &PeerId) -> Option<&DasProtocol> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }

    pub fn builder(&self) -> &DasProtocol {
        &self.nodes[BUILDER]
    }

    pub fn is_malicious(&self, id: &PeerId) -> bool {
        self.malicious.contains(id)
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Process one event. Returns false once the queue is empty or the end
    /// time is reached.
    pub fn step(&mut self) -> bool {
        let end_time = self.config.simulation.end_time;
        let Some(event) = self.queue.pop() else {
            return false;
        };
        if end_time > 0 && event.time > end_time {
            return false;
        }

        self.now = event.time;
        self.stats.events += 1;

        let name = event.message.name();
        let mut net = SimNetwork {
            now: self.now,
            latency: (self.config.simulation.min_latency, self.config.simulation.max_latency),
            queue: &mut self.queue,
            index: &self.index,
            down: &self.down,
            rng: &mut self.rng,
            stats: &mut self.stats,
        };

        let node = &mut self.nodes[event.target];
        if let Err(e) = node.handle(event.from, event.message, &mut net) {
            warn!("Node {} failed to handle {}: {}", node.id(), name, e);
            self.stats.handler_errors += 1;
        }
        true
    }

    /// Run until quiescence, the end time, or cancellation.
    pub fn run(mut self, cancel: &AtomicBool) -> SimulationReport {
        let mut cancelled = false;
        while self.step() {
            if cancel.load(AtomicOrdering::Relaxed) {
                warn!("Simulation cancelled at time {}", self.now);
                cancelled = true;
                break;
            }
            if self.stats.events % 100_000 == 0 {
                debug!("{} events processed, {} pending, time {}", self.stats.events, self.queue.len(), self.now);
            }
        }

        let report = self.report(cancelled);
        info!(
            "Simulation finished at time {}: {} events, {} operations, {:.1}% completed",
            report.end_time,
            report.traffic.events,
            report.operations.len(),
            report.completion_rate() * 100.0
        );
        report
    }

    pub fn report(&self, cancelled: bool) -> SimulationReport {
        let include_unfinished = self.config.simulation.include_unfinished;
        let operations = self
            .nodes
            .iter()
            .flat_map(|node| node.operation_summaries())
            .filter(|op| include_unfinished || matches!(op.status, OperationStatus::Completed | OperationStatus::Exhausted))
            .collect();

        let sim = &self.config.simulation;
        SimulationReport {
            seed: sim.seed,
            nodes: sim.nodes,
            validators: sim.validators,
            malicious: self.malicious.len(),
            down: self.down.len(),
            blocks: sim.blocks,
            end_time: self.now,
            cancelled,
            traffic: self.stats.clone(),
            operations,
        }
    }
}
