//! Which image pairs get matched.
//!
//! Every strategy hands out pairs through a [`PairLedger`], so a pair is scheduled at
//! most once per run. Multi-row matching is a small state machine that alternates
//! between emitting batches and waiting for the caller to run them, updating the
//! [`ConnectivityGraph`] in between.

use std::collections::HashSet;
use std::fmt;

use pano_core::{ImageInfo, ImagePair};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

fn default_window() -> usize {
    1
}

/// Pair selection mode, fixed for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum MatchingStrategy {
    #[default]
    AllPairs,
    /// Each image against the next `window` images
    Linear {
        #[serde(default = "default_window")]
        window: usize,
    },
    MultiRow,
    /// Pairs overlapping under the poses already stored in the project
    Prealigned,
}

impl fmt::Display for MatchingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchingStrategy::AllPairs => f.write_str("all-pairs"),
            MatchingStrategy::Linear { window } => write!(f, "linear (window {})", window),
            MatchingStrategy::MultiRow => f.write_str("multi-row"),
            MatchingStrategy::Prealigned => f.write_str("prealigned"),
        }
    }
}

/// Pairs scheduled so far in this run
#[derive(Debug, Clone, Default)]
pub struct PairLedger {
    scheduled: HashSet<ImagePair>,
    order: Vec<ImagePair>,
}

impl PairLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pair`; false when it was already scheduled
    pub fn insert(&mut self, pair: ImagePair) -> bool {
        if pair.first == pair.second || !self.scheduled.insert(pair) {
            return false;
        }
        self.order.push(pair);
        true
    }

    pub fn contains(&self, pair: ImagePair) -> bool {
        self.scheduled.contains(&pair)
    }

    /// Keep the candidates not scheduled before, in order, and record them
    pub fn claim<I: IntoIterator<Item = ImagePair>>(&mut self, candidates: I) -> Vec<ImagePair> {
        candidates.into_iter().filter(|&p| self.insert(p)).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All scheduled pairs in scheduling order
    pub fn pairs(&self) -> &[ImagePair] {
        &self.order
    }
}

/// Union-find over image indices, joined by pairs that have control points
#[derive(Debug, Clone)]
pub struct ConnectivityGraph {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl ConnectivityGraph {
    pub fn new(images: usize) -> Self {
        Self {
            parent: (0..images).collect(),
            size: vec![1; images],
        }
    }

    pub fn from_pairs<I: IntoIterator<Item = ImagePair>>(images: usize, pairs: I) -> Self {
        let mut graph = Self::new(images);
        for pair in pairs {
            graph.union(pair.first, pair.second);
        }
        graph
    }

    pub fn find(&self, mut image: usize) -> usize {
        while self.parent[image] != image {
            image = self.parent[image];
        }
        image
    }

    /// Join the components of `a` and `b`; false if already joined
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        true
    }

    pub fn connected(&self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Components among `members`, each in member order, ordered by first member
    pub fn components(&self, members: &[usize]) -> Vec<Vec<usize>> {
        let mut roots: Vec<usize> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for &m in members {
            let root = self.find(m);
            match roots.iter().position(|&r| r == root) {
                Some(i) => groups[i].push(m),
                None => {
                    roots.push(root);
                    groups.push(vec![m]);
                }
            }
        }
        groups
    }
}

/// Every unordered pair of `images`
pub fn all_pairs(images: &[usize]) -> Vec<ImagePair> {
    let mut pairs = Vec::with_capacity(images.len() * images.len().saturating_sub(1) / 2);
    for (i, &a) in images.iter().enumerate() {
        for &b in &images[i + 1..] {
            pairs.push(ImagePair::new(a, b));
        }
    }
    pairs
}

/// `(i, i + 1 ..= i + window)` for every image, clipped to `count`
pub fn linear_pairs(count: usize, window: usize) -> Vec<ImagePair> {
    let mut pairs = Vec::new();
    for i in 0..count {
        for j in i + 1..=(i + window).min(count.saturating_sub(1)) {
            pairs.push(ImagePair::new(i, j));
        }
    }
    pairs
}

/// Overlapping pairs that have no control points yet
pub fn prealigned_pairs<F>(images: &[ImageInfo], existing: &HashSet<ImagePair>, overlaps: F) -> Vec<ImagePair>
where
    F: Fn(&ImageInfo, &ImageInfo) -> bool,
{
    let mut pairs = Vec::new();
    for (i, a) in images.iter().enumerate() {
        for b in &images[i + 1..] {
            let pair = ImagePair::new(a.index, b.index);
            if existing.contains(&pair) {
                debug!("pair {} already has control points", pair);
                continue;
            }
            if overlaps(a, b) {
                pairs.push(pair);
            }
        }
    }
    pairs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiRowState {
    Stacks,
    LayerChain,
    Bridge,
    Fallback,
    Align,
    Overlap,
    Done,
}

/// What the multi-row planner wants next
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    /// Run these pairs, update the graph, then ask again
    Match(Vec<ImagePair>),
    /// Roughly align the layer from the control points found so far, then ask again
    Align(Vec<usize>),
    Done,
}

/// Multi-row / stacked matching plan.
///
/// Images sharing a `stack` id are exposure brackets of one view. Each stack is
/// represented by its median-exposure image; the representatives form the layer.
pub struct MultiRowPlanner {
    state: MultiRowState,
    stacks: Vec<Vec<usize>>,
    stack_of: Vec<usize>,
    layer: Vec<usize>,
}

impl MultiRowPlanner {
    pub fn new(images: &[ImageInfo]) -> Self {
        let mut stacks: Vec<Vec<usize>> = Vec::new();
        let mut ids: Vec<Option<usize>> = Vec::new();
        let mut stack_of = vec![0; images.len()];
        for image in images {
            let slot = match image.stack {
                Some(id) => ids.iter().position(|&s| s == Some(id)),
                None => None,
            };
            let slot = slot.unwrap_or_else(|| {
                ids.push(image.stack);
                stacks.push(Vec::new());
                stacks.len() - 1
            });
            stacks[slot].push(image.index);
            stack_of[image.index] = slot;
        }

        let layer = stacks
            .iter()
            .map(|members| {
                let mut by_ev = members.clone();
                by_ev.sort_by(|&a, &b| images[a].exposure_value.total_cmp(&images[b].exposure_value));
                by_ev[by_ev.len() / 2]
            })
            .collect();

        Self {
            state: MultiRowState::Stacks,
            stacks,
            stack_of,
            layer,
        }
    }

    pub fn state(&self) -> MultiRowState {
        self.state
    }

    pub fn stacks(&self) -> &[Vec<usize>] {
        &self.stacks
    }

    /// Representative image of every stack
    pub fn layer(&self) -> &[usize] {
        &self.layer
    }

    pub fn representative_of(&self, image: usize) -> usize {
        self.layer[self.stack_of[image]]
    }

    pub fn same_stack(&self, a: usize, b: usize) -> bool {
        self.stack_of[a] == self.stack_of[b]
    }

    /// Advance until there is work for the caller.
    ///
    /// `overlaps(a, b)` is consulted only for the final overlap batch, after the caller
    /// has handled [`PlanStep::Align`].
    pub fn next_step<F>(&mut self, graph: &ConnectivityGraph, ledger: &mut PairLedger, overlaps: F) -> PlanStep
    where
        F: Fn(usize, usize) -> bool,
    {
        loop {
            match self.state {
                MultiRowState::Stacks => {
                    self.state = MultiRowState::LayerChain;
                    let chained = self
                        .stacks
                        .iter()
                        .flat_map(|members| members.windows(2).map(|w| ImagePair::new(w[0], w[1])));
                    let pairs = ledger.claim(chained.collect::<Vec<_>>());
                    if !pairs.is_empty() {
                        info!("multi-row: matching {} pairs inside stacks", pairs.len());
                        return PlanStep::Match(pairs);
                    }
                }
                MultiRowState::LayerChain => {
                    self.state = MultiRowState::Bridge;
                    let chained: Vec<ImagePair> = self.layer.windows(2).map(|w| ImagePair::new(w[0], w[1])).collect();
                    let pairs = ledger.claim(chained);
                    if !pairs.is_empty() {
                        info!("multi-row: chaining {} layer images", self.layer.len());
                        return PlanStep::Match(pairs);
                    }
                }
                MultiRowState::Bridge => {
                    self.state = MultiRowState::Fallback;
                    let components = graph.components(&self.layer);
                    if components.len() <= 1 {
                        self.state = MultiRowState::Align;
                        continue;
                    }
                    let pairs = self.bridge_pairs(&components, ledger);
                    if !pairs.is_empty() {
                        info!(
                            "multi-row: layer has {} components, trying {} bridging pairs",
                            components.len(),
                            pairs.len()
                        );
                        return PlanStep::Match(pairs);
                    }
                }
                MultiRowState::Fallback => {
                    self.state = MultiRowState::Align;
                    if graph.components(&self.layer).len() > 1 {
                        let pairs = ledger.claim(all_pairs(&self.layer));
                        if !pairs.is_empty() {
                            warn!("multi-row: layer still disconnected, matching {} remaining layer pairs", pairs.len());
                            return PlanStep::Match(pairs);
                        }
                    }
                }
                MultiRowState::Align => {
                    self.state = MultiRowState::Overlap;
                    let components = graph.components(&self.layer).len();
                    if components > 1 {
                        warn!("multi-row: layer remains split into {} components", components);
                    }
                    return PlanStep::Align(self.layer.clone());
                }
                MultiRowState::Overlap => {
                    self.state = MultiRowState::Done;
                    let n = self.stack_of.len();
                    let mut candidates = Vec::new();
                    for a in 0..n {
                        for b in a + 1..n {
                            if !self.same_stack(a, b) && overlaps(a, b) {
                                candidates.push(ImagePair::new(a, b));
                            }
                        }
                    }
                    let pairs = ledger.claim(candidates);
                    if !pairs.is_empty() {
                        info!("multi-row: matching {} overlapping pairs", pairs.len());
                        return PlanStep::Match(pairs);
                    }
                }
                MultiRowState::Done => return PlanStep::Done,
            }
        }
    }

    /// One unscheduled pair per pair of components, closest in cyclic layer order
    fn bridge_pairs(&self, components: &[Vec<usize>], ledger: &mut PairLedger) -> Vec<ImagePair> {
        let len = self.layer.len();
        let position = |image: usize| self.layer.iter().position(|&l| l == image).unwrap_or(0);
        let mut picked = Vec::new();
        for (i, ci) in components.iter().enumerate() {
            for cj in &components[i + 1..] {
                let best = ci
                    .iter()
                    .flat_map(|&a| cj.iter().map(move |&b| ImagePair::new(a, b)))
                    .filter(|&pair| !ledger.contains(pair))
                    .min_by_key(|pair| {
                        let d = position(pair.first).abs_diff(position(pair.second));
                        (d.min(len - d), *pair)
                    });
                if let Some(pair) = best {
                    picked.push(pair);
                }
            }
        }
        ledger.claim(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn images(n: usize) -> Vec<ImageInfo> {
        (0..n).map(|i| ImageInfo::new(i, format!("{}.jpg", i), 1000, 800, 50.0)).collect()
    }

    #[test]
    fn test_all_pairs_count() {
        let pairs = all_pairs(&[0, 1, 2, 3, 4]);
        assert_eq!(pairs.len(), 10);
        let unique: HashSet<_> = pairs.iter().copied().collect();
        assert_eq!(unique.len(), 10);
    }

    #[test]
    fn test_ledger_schedules_once() {
        let mut ledger = PairLedger::new();
        assert!(ledger.insert(ImagePair::new(0, 1)));
        assert!(!ledger.insert(ImagePair::new(1, 0)));
        assert!(!ledger.insert(ImagePair::new(2, 2)));
        let claimed = ledger.claim(vec![ImagePair::new(0, 1), ImagePair::new(1, 2)]);
        assert_eq!(claimed, vec![ImagePair::new(1, 2)]);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_components() {
        let graph = ConnectivityGraph::from_pairs(6, vec![ImagePair::new(0, 1), ImagePair::new(4, 5)]);
        assert!(graph.connected(1, 0));
        assert!(!graph.connected(1, 2));
        assert_eq!(graph.components(&[0, 1, 2, 3, 4, 5]), vec![vec![0, 1], vec![2], vec![3], vec![4, 5]]);
    }

    #[test]
    fn test_prealigned_skips_connected_pairs() {
        let infos = images(3);
        let existing: HashSet<_> = [ImagePair::new(0, 1)].into_iter().collect();
        let pairs = prealigned_pairs(&infos, &existing, |_, _| true);
        assert_eq!(pairs, vec![ImagePair::new(0, 2), ImagePair::new(1, 2)]);
        let none = prealigned_pairs(&infos, &HashSet::new(), |_, _| false);
        assert!(none.is_empty());
    }

    #[test]
    fn test_stack_representative_is_median_exposure() {
        let infos = vec![
            ImageInfo::new(0, "a", 10, 10, 50.0).with_stack(7, 2.0),
            ImageInfo::new(1, "b", 10, 10, 50.0).with_stack(7, -2.0),
            ImageInfo::new(2, "c", 10, 10, 50.0).with_stack(7, 0.0),
            ImageInfo::new(3, "d", 10, 10, 50.0),
            ImageInfo::new(4, "e", 10, 10, 50.0).with_stack(9, 1.0),
        ];
        let planner = MultiRowPlanner::new(&infos);
        assert_eq!(planner.stacks(), &[vec![0, 1, 2], vec![3], vec![4]]);
        assert_eq!(planner.layer(), &[2, 3, 4]);
        assert_eq!(planner.representative_of(1), 2);
        assert!(planner.same_stack(0, 2));
    }

    #[test]
    fn test_multirow_bridges_then_falls_back_before_alignment() {
        let infos = images(6);
        let mut planner = MultiRowPlanner::new(&infos);
        let mut ledger = PairLedger::new();
        let no_overlap = |_: usize, _: usize| false;

        // Singleton stacks: the first batch chains the layer
        let graph = ConnectivityGraph::new(6);
        let chain = match planner.next_step(&graph, &mut ledger, no_overlap) {
            PlanStep::Match(pairs) => pairs,
            other => panic!("expected layer chain, got {:?}", other),
        };
        assert_eq!(chain, linear_pairs(6, 1));

        // Pair (2, 3) found nothing: two components
        let graph = ConnectivityGraph::from_pairs(
            6,
            chain.iter().copied().filter(|&p| p != ImagePair::new(2, 3)),
        );
        let bridges = match planner.next_step(&graph, &mut ledger, no_overlap) {
            PlanStep::Match(pairs) => pairs,
            other => panic!("expected bridging pairs, got {:?}", other),
        };
        assert_eq!(bridges, vec![ImagePair::new(0, 5)]);
        assert_eq!(planner.state(), MultiRowState::Fallback);

        // Bridging failed too: all remaining layer pairs before any alignment
        let fallback = match planner.next_step(&graph, &mut ledger, no_overlap) {
            PlanStep::Match(pairs) => pairs,
            other => panic!("expected all-pairs fallback, got {:?}", other),
        };
        assert_eq!(fallback.len(), 15 - chain.len() - bridges.len());
        assert_eq!(ledger.len(), 15);

        assert_eq!(planner.next_step(&graph, &mut ledger, no_overlap), PlanStep::Align(vec![0, 1, 2, 3, 4, 5]));
        assert_eq!(planner.next_step(&graph, &mut ledger, no_overlap), PlanStep::Done);
    }

    #[test]
    fn test_multirow_one_bridge_per_component_pair() {
        let infos = images(6);
        let mut planner = MultiRowPlanner::new(&infos);
        let mut ledger = PairLedger::new();
        let _ = planner.next_step(&ConnectivityGraph::new(6), &mut ledger, |_, _| false);

        let graph = ConnectivityGraph::from_pairs(6, vec![ImagePair::new(0, 1), ImagePair::new(2, 3), ImagePair::new(4, 5)]);
        match planner.next_step(&graph, &mut ledger, |_, _| false) {
            PlanStep::Match(pairs) => assert_eq!(pairs.len(), 3),
            other => panic!("expected bridging pairs, got {:?}", other),
        }
    }

    #[test]
    fn test_multirow_connected_layer_goes_to_overlap() {
        let infos = vec![
            ImageInfo::new(0, "a", 10, 10, 50.0).with_stack(0, -1.0),
            ImageInfo::new(1, "b", 10, 10, 50.0).with_stack(0, 1.0),
            ImageInfo::new(2, "c", 10, 10, 50.0).with_stack(1, -1.0),
            ImageInfo::new(3, "d", 10, 10, 50.0).with_stack(1, 1.0),
        ];
        let mut planner = MultiRowPlanner::new(&infos);
        let mut ledger = PairLedger::new();
        let all_overlap = |_: usize, _: usize| true;

        let graph = ConnectivityGraph::new(4);
        assert_eq!(
            planner.next_step(&graph, &mut ledger, all_overlap),
            PlanStep::Match(vec![ImagePair::new(0, 1), ImagePair::new(2, 3)])
        );
        assert_eq!(planner.layer(), &[1, 3]);
        assert_eq!(
            planner.next_step(&graph, &mut ledger, all_overlap),
            PlanStep::Match(vec![ImagePair::new(1, 3)])
        );

        let graph = ConnectivityGraph::from_pairs(4, ledger.pairs().to_vec());
        assert_eq!(planner.next_step(&graph, &mut ledger, all_overlap), PlanStep::Align(vec![1, 3]));
        // Same-stack and already scheduled pairs are skipped
        assert_eq!(
            planner.next_step(&graph, &mut ledger, all_overlap),
            PlanStep::Match(vec![ImagePair::new(0, 2), ImagePair::new(0, 3), ImagePair::new(1, 2)])
        );
        assert_eq!(planner.next_step(&graph, &mut ledger, all_overlap), PlanStep::Done);
    }

    proptest! {
        #[test]
        fn prop_linear_schedules_exactly_the_window(count in 0usize..40, window in 1usize..8) {
            let pairs = linear_pairs(count, window);
            let unique: HashSet<_> = pairs.iter().copied().collect();
            prop_assert_eq!(unique.len(), pairs.len());
            for p in &pairs {
                prop_assert!(p.second > p.first && p.second - p.first <= window && p.second < count);
            }
            let expected: usize = (0..count).map(|i| window.min(count - 1 - i)).sum();
            prop_assert_eq!(pairs.len(), expected);
        }
    }
}
