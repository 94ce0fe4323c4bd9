//! Participant selection from importance scores.
//!
//! Ranking is by descending score with ascending client id as tie-break; NaN ranks
//! with the sentinel. Same scores in, same selection out.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::importance::{ImportanceScore, SENTINEL_SCORE};
use super::{ClientId, ClusterId};

/// Ordered set of distinct participating client ids.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SelectionSet(Vec<ClientId>);

impl SelectionSet {
    /// Keeps the first occurrence of each id.
    pub fn from_ids(ids: impl IntoIterator<Item = ClientId>) -> Self {
        let mut out: Vec<ClientId> = Vec::new();
        for id in ids { if !out.contains(&id) { out.push(id); } }
        Self(out)
    }
    pub fn ids(&self) -> &[ClientId] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn contains(&self, id: ClientId) -> bool { self.0.contains(&id) }
    pub fn position(&self, id: ClientId) -> Option<usize> { self.0.iter().position(|c| *c == id) }
}

/// When the participating set is recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRefresh {
    /// Re-select every round against the latest (possibly stale) scores.
    #[default]
    EveryRound,
    /// Keep the set fixed until the next estimation.
    OnEstimation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicyKind {
    #[default]
    TopK,
    ClusterBalanced,
}

impl SelectionPolicyKind {
    pub fn build(self, membership: BTreeMap<ClientId, ClusterId>) -> Box<dyn SelectionPolicy> {
        match self {
            SelectionPolicyKind::TopK => Box::new(TopK),
            SelectionPolicyKind::ClusterBalanced => Box::new(ClusterBalanced::new(membership)),
        }
    }
}

pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Exactly `min(k, distinct clients in scores)` ids.
    fn select(&self, scores: &[ImportanceScore], k: usize) -> SelectionSet;
}

fn rank_value(v: f64) -> f64 { if v.is_nan() { SENTINEL_SCORE } else { v } }

fn by_rank(a: &ImportanceScore, b: &ImportanceScore) -> Ordering {
    rank_value(b.value).total_cmp(&rank_value(a.value)).then(a.client_id.cmp(&b.client_id))
}

/// Best-first ranking with one entry per client (its best score).
pub fn rank(scores: &[ImportanceScore]) -> Vec<ClientId> {
    let mut sorted: Vec<&ImportanceScore> = scores.iter().collect();
    sorted.sort_by(|a, b| by_rank(a, b));
    SelectionSet::from_ids(sorted.into_iter().map(|s| s.client_id)).0
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TopK;

impl SelectionPolicy for TopK {
    fn name(&self) -> &'static str { "top_k" }
    fn select(&self, scores: &[ImportanceScore], k: usize) -> SelectionSet {
        SelectionSet(rank(scores).into_iter().take(k).collect())
    }
}

/// Round-robin over clusters (ascending id), taking each cluster's best remaining client.
#[derive(Debug, Clone, Default)]
pub struct ClusterBalanced { membership: BTreeMap<ClientId, ClusterId> }

impl ClusterBalanced {
    pub fn new(membership: BTreeMap<ClientId, ClusterId>) -> Self { Self { membership } }
}

impl SelectionPolicy for ClusterBalanced {
    fn name(&self) -> &'static str { "cluster_balanced" }
    fn select(&self, scores: &[ImportanceScore], k: usize) -> SelectionSet {
        let mut queues: BTreeMap<ClusterId, VecDeque<ClientId>> = BTreeMap::new();
        for id in rank(scores) {
            let cluster = self.membership.get(&id).copied().unwrap_or(ClusterId::MAX);
            queues.entry(cluster).or_default().push_back(id);
        }
        let mut picked = Vec::with_capacity(k);
        while picked.len() < k && queues.values().any(|q| !q.is_empty()) {
            for q in queues.values_mut() {
                if picked.len() == k { break; }
                if let Some(id) = q.pop_front() { picked.push(id); }
            }
        }
        SelectionSet(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(client_id: ClientId, value: f64) -> ImportanceScore { ImportanceScore { client_id, round_index: 0, value } }

    #[test]
    fn top_k_ranks_descending_with_id_tie_break() {
        let scores = vec![s(4, 0.5), s(2, 0.9), s(7, 0.5), s(1, 0.5), s(3, SENTINEL_SCORE), s(0, f64::NAN)];
        let sel = TopK.select(&scores, 4);
        assert_eq!(sel.ids(), &[2, 1, 4, 7]);
        assert_eq!(TopK.select(&scores, 10).ids(), &[2, 1, 4, 7, 0, 3]);
    }

    #[test]
    fn selection_is_order_independent() {
        let a = vec![s(0, 0.1), s(1, 0.3), s(2, 0.3), s(3, 0.2)];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(TopK.select(&a, 3), TopK.select(&b, 3));
    }

    #[test]
    fn duplicates_collapse_to_distinct_ids() {
        let scores = vec![s(1, 0.2), s(1, 0.9), s(2, 0.5)];
        assert_eq!(TopK.select(&scores, 5).ids(), &[1, 2]);
    }

    #[test]
    fn cluster_balanced_cycles_clusters() {
        let membership: BTreeMap<_, _> = [(0, 0), (1, 0), (2, 0), (3, 1), (4, 1), (5, 2)].into_iter().collect();
        let scores = vec![s(0, 0.9), s(1, 0.8), s(2, 0.7), s(3, 0.2), s(4, 0.1), s(5, 0.05)];
        let policy = SelectionPolicyKind::ClusterBalanced.build(membership);
        assert_eq!(policy.select(&scores, 4).ids(), &[0, 3, 5, 1]);
        assert_eq!(policy.select(&scores, 6).len(), 6);
        assert_eq!(policy.select(&scores, 0).len(), 0);
    }
}
