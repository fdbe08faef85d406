use das_sim_types::{KeyRange, PeerId, SampleId, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::DasConfig;
use crate::rated_list::{MemberId, RatedList, RatedListMember};

/// Liveness record of a known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbour {
    pub id: PeerId,
    pub last_seen: u64,
    pub evil: bool,
}

impl Neighbour {
    pub fn new(id: PeerId, last_seen: u64, evil: bool) -> Self {
        Self { id, last_seen, evil }
    }

    pub fn expired(&self, now: u64, ttl: u64) -> bool {
        now.saturating_sub(self.last_seen) > ttl
    }
}

pub struct SearchTable {
    own_id: PeerId,
    builder_id: Option<PeerId>,
    max_key: U256,

    neighbours: HashMap<PeerId, Neighbour>,
    nodes_indexed: BTreeSet<PeerId>,
    validators_indexed: BTreeSet<PeerId>,
    non_validators_indexed: BTreeSet<PeerId>,

    rated: RatedList,

    black_list: HashSet<PeerId>,
    evil_ids: HashSet<PeerId>,
    only_add_evil_neighbours: bool,

    max_nodes_returned: usize,
    neighbour_ttl: u64,
}

impl SearchTable {
    pub fn new(own_id: PeerId, max_key: U256, config: &DasConfig) -> Self {
        Self {
            own_id,
            builder_id: None,
            max_key,
            neighbours: HashMap::new(),
            nodes_indexed: BTreeSet::new(),
            validators_indexed: BTreeSet::new(),
            non_validators_indexed: BTreeSet::new(),
            rated: RatedList::new(config),
            black_list: HashSet::new(),
            evil_ids: HashSet::new(),
            only_add_evil_neighbours: false,
            max_nodes_returned: config.max_nodes_on_level,
            neighbour_ttl: config.neighbour_ttl,
        }
    }

    pub fn set_builder_address(&mut self, builder: PeerId) {
        self.builder_id = Some(builder);
        self.remove_node(&builder);
    }

    pub fn max_key(&self) -> U256 {
        self.max_key
    }

    pub fn rated_list(&self) -> &RatedList {
        &self.rated
    }

    fn is_reserved(&self, id: &PeerId) -> bool {
        *id == self.own_id || self.builder_id.as_ref() == Some(id) || self.black_list.contains(id)
    }

    /// Admit a discovered peer. `parent` is the peer that reported it, `None`
    /// for a direct report. An unknown or refusing parent falls back to
    /// attaching the peer at the root. Returns whether the peer was admitted.
    pub fn add_neighbour(&mut self, neighbour: Neighbour, parent: Option<PeerId>) -> bool {
        if self.only_add_evil_neighbours && !neighbour.evil {
            return false;
        }
        if self.is_reserved(&neighbour.id) {
            return false;
        }

        let parent_member = parent.filter(|p| *p != neighbour.id).and_then(|p| {
            let member = self.rated.lookup(&p);
            if member.is_none() {
                debug!("Unknown provenance parent {} of {}, attaching at root", p, neighbour.id);
            }
            member
        });

        let attached = match (self.rated.lookup(&neighbour.id), parent_member) {
            (Some(_), None) => true,
            (Some(existing), Some(parent)) => {
                if !self.rated.attach(parent, existing) {
                    debug!("Additional provenance edge for {} rejected", neighbour.id);
                }
                true
            }
            (None, Some(parent)) => self
                .rated
                .attach_peer(neighbour.id, parent)
                .or_else(|| self.rated.attach_peer(neighbour.id, MemberId::ROOT))
                .is_some(),
            (None, None) => self.rated.attach_peer(neighbour.id, MemberId::ROOT).is_some(),
        };

        if !attached {
            return false;
        }

        match self.neighbours.get_mut(&neighbour.id) {
            Some(known) => {
                if known.last_seen < neighbour.last_seen {
                    known.last_seen = neighbour.last_seen;
                }
            }
            None => {
                self.nodes_indexed.insert(neighbour.id);
                self.neighbours.insert(neighbour.id, neighbour);
            }
        }
        true
    }

    /// Index plain (non-validator) peers.
    pub fn add_nodes(&mut self, nodes: &[PeerId]) {
        for id in nodes {
            if self.is_reserved(id) || self.validators_indexed.contains(id) {
                continue;
            }
            self.ensure_member(*id);
            self.non_validators_indexed.insert(*id);
        }
    }

    pub fn add_validator_nodes(&mut self, nodes: &[PeerId]) {
        for id in nodes {
            if self.is_reserved(id) {
                continue;
            }
            self.ensure_member(*id);
            self.non_validators_indexed.remove(id);
            self.validators_indexed.insert(*id);
        }
    }

    pub fn seen_neighbour(&mut self, id: PeerId, evil: bool, now: u64) {
        if self.is_reserved(&id) || (self.only_add_evil_neighbours && !evil) {
            return;
        }
        self.ensure_member(id);
        self.nodes_indexed.insert(id);
        self.neighbours.insert(id, Neighbour::new(id, now, evil));
    }

    pub fn remove_node(&mut self, id: &PeerId) {
        self.nodes_indexed.remove(id);
        self.non_validators_indexed.remove(id);
        self.validators_indexed.remove(id);
        self.neighbours.remove(id);
    }

    pub fn blacklist(&mut self, id: PeerId) {
        self.remove_node(&id);
        self.black_list.insert(id);
    }

    pub fn nodes_indexed(&self) -> &BTreeSet<PeerId> {
        &self.nodes_indexed
    }

    pub fn validators_indexed(&self) -> &BTreeSet<PeerId> {
        &self.validators_indexed
    }

    pub fn non_validators_indexed(&self) -> &BTreeSet<PeerId> {
        &self.non_validators_indexed
    }

    fn in_region(&self, index: &BTreeSet<PeerId>, sample: &SampleId, radius: &U256) -> Vec<PeerId> {
        match KeyRange::around(*sample, *radius, self.max_key) {
            Ok(range) => index.range(range.bottom..=range.top).copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Known peers within `radius` of `sample`, in keyspace order.
    pub fn nodes_by_sample(&self, sample: &SampleId, radius: &U256) -> Vec<PeerId> {
        self.in_region(&self.nodes_indexed, sample, radius)
    }

    pub fn validator_nodes_by_sample(&self, sample: &SampleId, radius: &U256) -> Vec<PeerId> {
        self.in_region(&self.validators_indexed, sample, radius)
    }

    pub fn non_validator_nodes_by_sample(&self, sample: &SampleId, radius: &U256) -> Vec<PeerId> {
        self.in_region(&self.non_validators_indexed, sample, radius)
    }

    fn freshest(&self, mut neighbours: Vec<Neighbour>) -> Vec<Neighbour> {
        neighbours.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        neighbours.truncate(self.max_nodes_returned);
        neighbours
    }

    /// Most recently seen neighbours, capped at the fan-out.
    pub fn neighbours(&self) -> Vec<Neighbour> {
        self.freshest(self.neighbours.values().cloned().collect())
    }

    pub fn neighbours_near(&self, id: &PeerId, radius: &U256) -> Vec<Neighbour> {
        let near = self
            .nodes_by_sample(id, radius)
            .iter()
            .filter_map(|peer| self.neighbours.get(peer).cloned())
            .collect();
        self.freshest(near)
    }

    pub fn is_neighbour_known(&self, id: &PeerId) -> bool {
        self.neighbours.contains_key(id)
    }

    pub fn all_neighbours_count(&self) -> usize {
        self.neighbours.len()
    }

    pub fn malicious_neighbours_count(&self) -> usize {
        self.neighbours.values().filter(|n| n.evil).count()
    }

    pub fn set_only_add_evil_neighbours(&mut self) {
        self.only_add_evil_neighbours = true;
    }

    pub fn set_evil_ids<I: IntoIterator<Item = PeerId>>(&mut self, ids: I) {
        self.evil_ids = ids.into_iter().collect();
    }

    pub fn is_evil(&self, id: &PeerId) -> bool {
        self.evil_ids.contains(id)
    }

    /// Drop liveness records not refreshed within the TTL.
    pub fn refresh(&mut self, now: u64) -> usize {
        let ttl = self.neighbour_ttl;
        let expired: Vec<PeerId> = self
            .neighbours
            .values()
            .filter(|n| n.expired(now, ttl))
            .map(|n| n.id)
            .collect();

        for id in &expired {
            self.neighbours.remove(id);
            self.nodes_indexed.remove(id);
        }
        expired.len()
    }

    fn ensure_member(&mut self, peer: PeerId) -> MemberId {
        self.rated.get_or_insert(peer)
    }

    /// Reputation entry for `peer`, created at the root on first use.
    pub fn rated_list_member(&mut self, peer: &PeerId) -> &RatedListMember {
        let id = self.ensure_member(*peer);
        self.rated.get(id)
    }

    /// Ancestor closure of `peer` as peer ids; empty for unknown peers.
    pub fn ancestors(&mut self, peer: &PeerId) -> HashSet<PeerId> {
        let Some(id) = self.rated.lookup(peer) else {
            return HashSet::new();
        };
        let parents: Vec<MemberId> = self.rated.all_parents(id).iter().copied().collect();
        parents
            .into_iter()
            .filter_map(|p| self.rated.get(p).peer_id())
            .collect()
    }

    pub fn find_member(&self, peer: &PeerId) -> Option<&RatedListMember> {
        self.rated.find(peer).map(|id| self.rated.get(id))
    }

    fn member_for_update(&mut self, peer: &PeerId, event: &'static str) -> MemberId {
        if let Some(id) = self.rated.lookup(peer) {
            return id;
        }
        warn!("{} for peer {} with no provenance entry, creating at root", event, peer);
        self.ensure_member(*peer)
    }

    fn propagate<F>(&mut self, peer: &PeerId, event: &'static str, apply: F)
    where
        F: Fn(&mut RatedListMember),
    {
        let member = self.member_for_update(peer, event);
        let ancestors: Vec<MemberId> = self.rated.all_parents(member).iter().copied().collect();

        apply(self.rated.get_mut(member));
        for ancestor in ancestors {
            apply(self.rated.get_mut(ancestor));
        }
    }

    /// Penalize `peer` and every peer on its provenance chain.
    pub fn failed_sample(&mut self, peer: &PeerId) {
        self.propagate(peer, "failed_sample", RatedListMember::failed_sample);
    }

    /// Reward `peer` and every peer on its provenance chain.
    pub fn successful_sample(&mut self, peer: &PeerId) {
        self.propagate(peer, "successful_sample", RatedListMember::successful_sample);
    }

    pub fn set_defunct(&mut self, peer: &PeerId) {
        let member = self.member_for_update(peer, "set_defunct");
        self.rated.get_mut(member).set_defunct();
    }

    /// Remove neighbours whose whole provenance chain is defunct. A directly
    /// reported neighbour goes only when it is defunct itself.
    pub fn check_nodes_to_purge(&mut self) -> Vec<PeerId> {
        let candidates: Vec<PeerId> = self.neighbours.keys().copied().collect();
        let mut purged = Vec::new();

        for peer in candidates {
            let ancestors = self.ancestors(&peer);
            let remove = if ancestors.is_empty() {
                self.rated.member(&peer).map_or(false, |m| m.is_defunct())
            } else {
                ancestors
                    .iter()
                    .all(|a| self.rated.member(a).map_or(true, |m| m.is_defunct()))
            };

            if remove {
                self.remove_node(&peer);
                purged.push(peer);
            }
        }

        if !purged.is_empty() {
            debug!("Purged {} neighbours with defunct provenance", purged.len());
        }
        purged
    }
}
