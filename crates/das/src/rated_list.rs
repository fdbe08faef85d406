use das_sim_types::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::DasConfig;

/// Arena index of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(usize);

impl MemberId {
    /// The synthetic sentinel every directly reported peer hangs from.
    pub const ROOT: MemberId = MemberId(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Inactive,
    Defunct,
}

/// Rating transition constants, derived once from [`DasConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingParams {
    pub max_rating: f64,
    pub successful_sample_change: f64,
    pub failed_sample_change: f64,
    pub base: f64,
}

impl RatingParams {
    pub fn from_config(config: &DasConfig) -> Self {
        Self {
            max_rating: config.max_rating,
            successful_sample_change: config.successful_sample_change,
            failed_sample_change: config.failed_sample_change(),
            base: config.rating_base as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatedListMember {
    peer: Option<PeerId>,
    level: i32,
    rating: f64,
    activity: NodeStatus,
    consecutive_failures: u32,
    params: RatingParams,
    parents: HashSet<MemberId>,
    children: HashSet<MemberId>,
    // Ancestor closure cache; `parental_change` marks it stale.
    parental_change: bool,
    known_parents: HashSet<MemberId>,
}

impl RatedListMember {
    pub fn new(peer: PeerId, level: i32, rating: f64, params: RatingParams) -> Self {
        Self {
            peer: Some(peer),
            level,
            rating,
            activity: NodeStatus::Inactive,
            consecutive_failures: 0,
            params,
            parents: HashSet::new(),
            children: HashSet::new(),
            parental_change: false,
            known_parents: HashSet::new(),
        }
    }

    fn root(params: RatingParams) -> Self {
        Self {
            peer: None,
            level: -1,
            rating: params.max_rating,
            activity: NodeStatus::Active,
            consecutive_failures: 0,
            params,
            parents: HashSet::new(),
            children: HashSet::new(),
            parental_change: false,
            known_parents: HashSet::new(),
        }
    }

    /// `None` for the sentinel root.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn rating(&self) -> f64 {
        self.rating
    }

    pub fn activity(&self) -> NodeStatus {
        self.activity
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn parents(&self) -> &HashSet<MemberId> {
        &self.parents
    }

    pub fn children(&self) -> &HashSet<MemberId> {
        &self.children
    }

    pub fn is_defunct(&self) -> bool {
        self.activity == NodeStatus::Defunct
    }

    pub fn successful_sample(&mut self) {
        self.rating = (self.rating + self.params.successful_sample_change).min(self.params.max_rating);
        self.activity = NodeStatus::Active;
        self.consecutive_failures = 0;
    }

    /// Exponential decrease: a member at maximum rating reaches zero after
    /// the configured number of consecutive failures.
    pub fn failed_sample(&mut self) {
        self.consecutive_failures += 1;
        let decrement =
            self.params.failed_sample_change * self.params.base.powi(self.consecutive_failures as i32);
        self.rating -= decrement;
        self.activity = NodeStatus::Inactive;
        if self.rating <= 0.0 {
            self.set_defunct();
        }
    }

    pub fn set_defunct(&mut self) {
        self.rating = 0.0;
        self.activity = NodeStatus::Defunct;
    }
}

/// Arena owning every [`RatedListMember`] of one node, indexed by peer id.
#[derive(Debug, Clone)]
pub struct RatedList {
    members: Vec<RatedListMember>,
    by_peer: HashMap<PeerId, MemberId>,
    params: RatingParams,
    initial_rating: f64,
    max_children: usize,
    max_level: i32,
}

impl RatedList {
    pub fn new(config: &DasConfig) -> Self {
        let params = RatingParams::from_config(config);
        Self {
            members: vec![RatedListMember::root(params)],
            by_peer: HashMap::new(),
            params,
            initial_rating: config.initial_rating,
            max_children: config.max_nodes_on_level,
            max_level: config.max_rated_level,
        }
    }

    pub fn params(&self) -> RatingParams {
        self.params
    }

    /// Number of peer members, the root excluded.
    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    pub fn get(&self, id: MemberId) -> &RatedListMember {
        &self.members[id.0]
    }

    pub fn get_mut(&mut self, id: MemberId) -> &mut RatedListMember {
        &mut self.members[id.0]
    }

    pub fn lookup(&self, peer: &PeerId) -> Option<MemberId> {
        self.by_peer.get(peer).copied()
    }

    pub fn member(&self, peer: &PeerId) -> Option<&RatedListMember> {
        self.lookup(peer).map(|id| self.get(id))
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.by_peer.keys()
    }

    /// Record `parent` as a parent of `child`. Rejected unless the parent
    /// sits strictly above the child.
    pub fn add_parent(&mut self, child: MemberId, parent: MemberId) -> bool {
        if child == parent || self.members[parent.0].level >= self.members[child.0].level {
            return false;
        }

        if self.members[child.0].parents.insert(parent) {
            self.invalidate_ancestors(child);
        }
        true
    }

    /// Record `child` as a child of `parent`, subject to the level ordering,
    /// the depth limit and the per-node fan-out cap.
    pub fn add_child(&mut self, parent: MemberId, child: MemberId) -> bool {
        if !self.admits_child(parent, child, self.members[child.0].level) {
            return false;
        }

        self.members[parent.0].children.insert(child);
        true
    }

    /// Link both directions or neither.
    pub fn attach(&mut self, parent: MemberId, child: MemberId) -> bool {
        let child_level = self.members[child.0].level;
        if self.members[parent.0].level >= child_level || !self.admits_child(parent, child, child_level) {
            return false;
        }

        self.add_child(parent, child) && self.add_parent(child, parent)
    }

    /// Attach `peer` below `parent`, creating its member one level down if
    /// the peer is new. Returns `None` when the edge is rejected; a rejected
    /// new peer is not created.
    pub fn attach_peer(&mut self, peer: PeerId, parent: MemberId) -> Option<MemberId> {
        if let Some(existing) = self.lookup(&peer) {
            return self.attach(parent, existing).then_some(existing);
        }

        let level = self.members[parent.0].level + 1;
        if !self.admits_level(parent, level) {
            return None;
        }

        let id = MemberId(self.members.len());
        self.members
            .push(RatedListMember::new(peer, level, self.initial_rating, self.params));
        self.by_peer.insert(peer, id);

        let attached = self.attach(parent, id);
        debug_assert!(attached);
        Some(id)
    }

    /// Member of `peer`, created directly below the root if unknown. The root
    /// level has no fan-out cap so this never fails.
    pub fn get_or_insert(&mut self, peer: PeerId) -> MemberId {
        if let Some(existing) = self.lookup(&peer) {
            return existing;
        }

        let id = MemberId(self.members.len());
        let mut member = RatedListMember::new(peer, 0, self.initial_rating, self.params);
        member.parents.insert(MemberId::ROOT);
        self.members.push(member);
        self.members[MemberId::ROOT.0].children.insert(id);
        self.by_peer.insert(peer, id);
        id
    }

    /// Ancestor closure of `id`, the sentinel root excluded. Cached until a
    /// parent edge is added somewhere above `id`.
    pub fn all_parents(&mut self, id: MemberId) -> &HashSet<MemberId> {
        if self.members[id.0].parental_change {
            let closure = self.closure(id, |m| &m.parents);
            let member = &mut self.members[id.0];
            member.known_parents = closure;
            member.parental_change = false;
        }
        &self.members[id.0].known_parents
    }

    /// Descendant closure of `id`.
    pub fn all_children(&self, id: MemberId) -> HashSet<MemberId> {
        self.closure(id, |m| &m.children)
    }

    /// Breadth-first search for `peer` down from the root.
    pub fn find(&self, peer: &PeerId) -> Option<MemberId> {
        let mut queue = VecDeque::from([MemberId::ROOT]);
        let mut visited = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if self.members[current.0].peer.as_ref() == Some(peer) {
                return Some(current);
            }
            queue.extend(self.members[current.0].children.iter().copied());
        }
        None
    }

    fn admits_child(&self, parent: MemberId, child: MemberId, child_level: i32) -> bool {
        if parent == child {
            return false;
        }
        if self.members[parent.0].children.contains(&child) {
            return true;
        }
        self.admits_level(parent, child_level)
    }

    fn admits_level(&self, parent: MemberId, child_level: i32) -> bool {
        let parent = &self.members[parent.0];
        if child_level <= parent.level {
            return false;
        }

        // The bottom layer is unbounded.
        if child_level == 0 {
            return true;
        }

        child_level <= self.max_level && parent.children.len() < self.max_children
    }

    fn closure<F>(&self, start: MemberId, edges: F) -> HashSet<MemberId>
    where
        F: Fn(&RatedListMember) -> &HashSet<MemberId>,
    {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<MemberId> = edges(&self.members[start.0]).iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if current == MemberId::ROOT || !seen.insert(current) {
                continue;
            }
            queue.extend(edges(&self.members[current.0]).iter().copied());
        }
        seen
    }

    fn invalidate_ancestors(&mut self, from: MemberId) {
        self.members[from.0].parental_change = true;
        for descendant in self.all_children(from) {
            self.members[descendant.0].parental_change = true;
        }
    }
}
