// src/nft/cluster.rs

//! Hierarchical k-medoids index over binary descriptors.
//!
//! Queries descend to the closest medoid at every level and keep the other
//! branches in a priority queue, so the search is approximate but bounded
//! by `max_checks` descriptor comparisons.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::nft::descriptor::{hamming, Descriptor};

/// Tree shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexParams {
    pub branching: usize,
    pub leaf_size: usize,
    /// Medoid update rounds per node.
    pub iterations: usize,
    /// Members tried as replacement medoid per cluster and round.
    pub medoid_candidates: usize,
    pub seed: u64,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            branching: 8,
            leaf_size: 16,
            iterations: 3,
            medoid_candidates: 8,
            seed: 0x5eed,
        }
    }
}

/// Acceptance rules for a query descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchParams {
    /// Largest accepted Hamming distance.
    pub max_distance: u32,
    /// Best distance must be below `ratio` times the second best.
    pub ratio: f32,
    /// Descriptor comparisons per query.
    pub max_checks: usize,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            max_distance: 64,
            ratio: 0.8,
            max_checks: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    /// Index into the query descriptors.
    pub query: usize,
    /// Index into the indexed descriptors.
    pub reference: usize,
    pub distance: u32,
}

#[derive(Debug, Clone)]
enum Node {
    Branch { medoids: Vec<usize>, children: Vec<usize> },
    Leaf(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct FeatureIndex {
    descriptors: Vec<Descriptor>,
    nodes: Vec<Node>,
}

impl FeatureIndex {
    pub fn build(descriptors: Vec<Descriptor>, params: &IndexParams) -> Self {
        let mut index = Self {
            descriptors,
            nodes: Vec::new(),
        };
        let mut rng = StdRng::seed_from_u64(params.seed);
        let all: Vec<usize> = (0..index.descriptors.len()).collect();
        index.build_node(all, params, &mut rng);
        index
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    fn build_node(&mut self, items: Vec<usize>, params: &IndexParams, rng: &mut StdRng) -> usize {
        let id = self.nodes.len();
        let k = params.branching.max(2);
        if items.len() <= params.leaf_size.max(1) || items.len() <= k {
            self.nodes.push(Node::Leaf(items));
            return id;
        }
        self.nodes.push(Node::Leaf(Vec::new()));

        let mut medoids: Vec<usize> = items.choose_multiple(rng, k).copied().collect();
        let mut clusters = self.assign(&items, &medoids);
        for _ in 0..params.iterations {
            let mut moved = false;
            for (c, members) in clusters.iter().enumerate() {
                let candidates: Vec<usize> = members
                    .choose_multiple(rng, params.medoid_candidates)
                    .copied()
                    .collect();
                let cost = |m: usize| -> u64 {
                    members
                        .iter()
                        .map(|&i| hamming(&self.descriptors[m], &self.descriptors[i]) as u64)
                        .sum()
                };
                let mut best = (cost(medoids[c]), medoids[c]);
                for cand in candidates {
                    let v = cost(cand);
                    if v < best.0 {
                        best = (v, cand);
                    }
                }
                if best.1 != medoids[c] {
                    medoids[c] = best.1;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
            clusters = self.assign(&items, &medoids);
        }

        // Identical descriptors cannot be split further.
        if clusters.iter().any(|c| c.len() == items.len()) {
            self.nodes[id] = Node::Leaf(items);
            return id;
        }

        let mut kept = Vec::with_capacity(k);
        let mut children = Vec::with_capacity(k);
        for (medoid, members) in medoids.into_iter().zip(clusters) {
            if members.is_empty() {
                continue;
            }
            kept.push(medoid);
            children.push(self.build_node(members, params, rng));
        }
        self.nodes[id] = Node::Branch {
            medoids: kept,
            children,
        };
        id
    }

    fn assign(&self, items: &[usize], medoids: &[usize]) -> Vec<Vec<usize>> {
        let mut clusters = vec![Vec::new(); medoids.len()];
        for &i in items {
            let nearest = medoids
                .iter()
                .enumerate()
                .min_by_key(|(_, &m)| hamming(&self.descriptors[m], &self.descriptors[i]))
                .map(|(c, _)| c)
                .unwrap_or(0);
            clusters[nearest].push(i);
        }
        clusters
    }

    /// Best and second-best `(index, distance)` for `query`.
    pub fn nearest_two(
        &self,
        query: &Descriptor,
        max_checks: usize,
    ) -> (Option<(usize, u32)>, Option<(usize, u32)>) {
        let mut best: Option<(usize, u32)> = None;
        let mut second: Option<(usize, u32)> = None;
        if self.nodes.is_empty() {
            return (best, second);
        }

        let mut heap = BinaryHeap::new();
        heap.push(Reverse((0u32, 0usize)));
        let mut checks = 0usize;

        while let Some(Reverse((_, start))) = heap.pop() {
            let mut node = start;
            loop {
                match &self.nodes[node] {
                    Node::Leaf(items) => {
                        for &i in items {
                            let d = hamming(query, &self.descriptors[i]);
                            checks += 1;
                            if best.map_or(true, |(_, bd)| d < bd) {
                                second = best;
                                best = Some((i, d));
                            } else if second.map_or(true, |(_, sd)| d < sd) {
                                second = Some((i, d));
                            }
                        }
                        break;
                    }
                    Node::Branch { medoids, children } => {
                        let dists: Vec<u32> = medoids
                            .iter()
                            .map(|&m| hamming(query, &self.descriptors[m]))
                            .collect();
                        let Some(closest) = (0..dists.len()).min_by_key(|&c| dists[c]) else {
                            break;
                        };
                        for (c, &d) in dists.iter().enumerate() {
                            if c != closest {
                                heap.push(Reverse((d, children[c])));
                            }
                        }
                        node = children[closest];
                    }
                }
            }
            if checks >= max_checks {
                break;
            }
        }
        (best, second)
    }
}

/// Matches every query descriptor against `index` and keeps the
/// unambiguous ones.
pub fn match_features(
    queries: &[Descriptor],
    index: &FeatureIndex,
    params: &MatchParams,
) -> Vec<FeatureMatch> {
    let mut out = Vec::new();
    for (q, d) in queries.iter().enumerate() {
        let (best, second) = index.nearest_two(d, params.max_checks);
        let Some((reference, distance)) = best else {
            continue;
        };
        if distance > params.max_distance {
            continue;
        }
        if let Some((_, sd)) = second {
            if distance as f32 >= params.ratio * sd as f32 {
                continue;
            }
        }
        out.push(FeatureMatch {
            query: q,
            reference,
            distance,
        });
    }
    out
}
