use das_sim_types::PeerId;
use std::collections::HashSet;

use crate::rated_list::RatedListMember;

/// What the ranking needs to know about one candidate.
#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub peer: PeerId,
    pub ancestors: HashSet<PeerId>,
    /// Rating normalized to `[0, 1]`, see [`rating_score`].
    pub rating: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCandidate {
    pub peer: PeerId,
    pub diversity: f64,
    pub rating: f64,
    pub combined: f64,
}

/// `1 - |A ∩ B| / |A ∪ B|`, defined as 0 when both sets are empty.
pub fn jaccard_distance(a: &HashSet<PeerId>, b: &HashSet<PeerId>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    1.0 - intersection as f64 / union as f64
}

/// Average Jaccard distance between `candidate` and every set in `others`.
/// A candidate without ancestors, or alone in its pool, scores 0.
pub fn diversity_score<'a, I>(candidate: &HashSet<PeerId>, others: I) -> f64
where
    I: IntoIterator<Item = &'a HashSet<PeerId>>,
{
    if candidate.is_empty() {
        return 0.0;
    }

    let (total, count) = others
        .into_iter()
        .fold((0.0, 0usize), |(total, count), other| {
            (total + jaccard_distance(candidate, other), count + 1)
        });

    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Normalized rating. Defunct or non-positive members contribute nothing.
pub fn rating_score(member: &RatedListMember, max_rating: f64) -> f64 {
    if member.is_defunct() || member.rating() <= 0.0 || max_rating <= 0.0 {
        return 0.0;
    }
    (member.rating() / max_rating).min(1.0)
}

/// Score every profile against the rest of the pool and sort by combined
/// score, highest first. Ties keep their input order.
pub fn rank(profiles: &[CandidateProfile], diversity_weight: f64, rating_weight: f64) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = profiles
        .iter()
        .enumerate()
        .map(|(i, profile)| {
            let others = profiles
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, other)| &other.ancestors);
            let diversity = diversity_score(&profile.ancestors, others);

            ScoredCandidate {
                peer: profile.peer,
                diversity,
                rating: profile.rating,
                combined: diversity_weight * diversity + rating_weight * profile.rating,
            }
        })
        .collect();

    scored.sort_by(|a, b| b.combined.total_cmp(&a.combined));
    scored
}
