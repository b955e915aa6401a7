pub mod eval;
mod hasher;
mod linear;
mod ofo;
pub mod train;

pub use hasher::HasherKind;
pub use train::{HyperParam, TreeVariant, TunerVariant};

use crate::tree::{AdaptiveTree, CompleteTree, ExplicitTree, LabelTree};
use crate::{Index, IndexSet, Value};
use hashbrown::HashMap;
use hasher::FeatureHasher;
use linear::ClassifierBank;
use log::{info, warn};
use ofo::OfoTuner;
use ordered_float::NotNan;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Error, ErrorKind, Result};
use std::path::Path;

/// The tree shapes a model can carry, dispatched without trait objects so
/// the whole model stays serializable and cheap to match on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TreeKind {
    Complete(CompleteTree),
    Explicit(ExplicitTree),
    Adaptive(AdaptiveTree),
}

macro_rules! delegate {
    ($self:expr, $tree:ident => $body:expr) => {
        match $self {
            TreeKind::Complete($tree) => $body,
            TreeKind::Explicit($tree) => $body,
            TreeKind::Adaptive($tree) => $body,
        }
    };
}

impl LabelTree for TreeKind {
    fn size(&self) -> usize {
        delegate!(self, tree => tree.size())
    }

    fn n_internal(&self) -> usize {
        delegate!(self, tree => tree.n_internal())
    }

    fn n_labels(&self) -> usize {
        delegate!(self, tree => tree.n_labels())
    }

    fn branching(&self) -> usize {
        delegate!(self, tree => tree.branching())
    }

    fn root(&self) -> usize {
        delegate!(self, tree => tree.root())
    }

    fn parent(&self, node: usize) -> Option<usize> {
        delegate!(self, tree => tree.parent(node))
    }

    fn children(&self, node: usize) -> Vec<usize> {
        delegate!(self, tree => tree.children(node))
    }

    fn is_leaf(&self, node: usize) -> bool {
        delegate!(self, tree => tree.is_leaf(node))
    }

    fn node_for_label(&self, label: Index) -> Option<usize> {
        delegate!(self, tree => tree.node_for_label(label))
    }

    fn label_at(&self, node: usize) -> Option<Index> {
        delegate!(self, tree => tree.label_at(node))
    }

    fn node_depth(&self, node: usize) -> usize {
        delegate!(self, tree => tree.node_depth(node))
    }

    fn depth(&self) -> usize {
        delegate!(self, tree => tree.depth())
    }
}

/// An online probabilistic label tree learner: one binary classifier per
/// tree node, all sharing a single hashed weight array, with per-label
/// decision thresholds tuned online.
pub struct Model {
    pub(crate) tree: TreeKind,
    pub(crate) bank: ClassifierBank,
    pub(crate) thresholds: Vec<Value>,
    pub(crate) tuner: Option<OfoTuner>,
    pub(crate) hyper: HyperParam,
    pub(crate) rng: StdRng,
    pub(crate) n_trained: u64,
}

/// Best-first search entry; ties in accumulated probability break toward
/// the earlier insertion for deterministic expansion order.
#[derive(PartialEq, Eq)]
struct SearchEntry {
    prob: NotNan<Value>,
    seq: u64,
    node: usize,
}

impl Ord for SearchEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.prob
            .cmp(&other.prob)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SearchEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Model {
    pub fn tree(&self) -> &TreeKind {
        &self.tree
    }

    pub fn n_labels(&self) -> usize {
        self.tree.n_labels()
    }

    pub fn n_nodes(&self) -> usize {
        self.tree.size()
    }

    pub fn n_trained(&self) -> u64 {
        self.n_trained
    }

    /// Marginal probability of the label: the product of partial posteriors
    /// along the root-to-leaf path.
    ///
    /// Panics if the label has no leaf; callers must check `has_label` on
    /// non-adaptive trees first.
    pub fn posterior(&self, x: &[(Index, Value)], label: Index) -> Value {
        let leaf = self
            .tree
            .node_for_label(label)
            .unwrap_or_else(|| panic!("label {} has no leaf in this tree", label));

        let mut posterior = self.bank.partial_posterior(x, leaf);
        let mut node = leaf;
        while let Some(parent) = self.tree.parent(node) {
            posterior *= self.bank.partial_posterior(x, parent);
            node = parent;
        }
        posterior
    }

    /// Labels whose accumulated path probability clears every threshold on
    /// the way down, with their posteriors, ordered by descending score.
    ///
    /// Soundness of the pruning relies on thresholds being non-increasing
    /// from root to leaf, which `set_threshold`/`set_thresholds` maintain by
    /// min-propagation.
    pub fn predict_positive_scored(&self, x: &[(Index, Value)]) -> Vec<(Index, Value)> {
        let mut found = Vec::new();
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        heap.push(SearchEntry {
            prob: NotNan::new(1.).unwrap(),
            seq,
            node: self.tree.root(),
        });

        while let Some(SearchEntry { prob, node, .. }) = heap.pop() {
            let p_acc = prob.into_inner() * self.bank.partial_posterior(x, node);
            if p_acc < self.thresholds[node] {
                continue;
            }
            if self.tree.is_leaf(node) {
                // The bootstrap placeholder leaf carries no label
                if let Some(label) = self.tree.label_at(node) {
                    found.push((label, p_acc));
                }
            } else {
                for child in self.tree.children(node) {
                    seq += 1;
                    heap.push(SearchEntry {
                        prob: NotNan::new(p_acc).unwrap(),
                        seq,
                        node: child,
                    });
                }
            }
        }

        found.sort_unstable_by(|(_, p1), (_, p2)| p2.partial_cmp(p1).unwrap());
        found
    }

    /// The predicted positive label set.
    pub fn predict_positive(&self, x: &[(Index, Value)]) -> IndexSet {
        self.predict_positive_scored(x)
            .into_iter()
            .map(|(label, _)| label)
            .collect()
    }

    /// The k labels with the highest posteriors, descending. No threshold
    /// test applies; fewer than k labels are returned only when the tree has
    /// fewer than k leaves.
    pub fn predict_top_k(&self, x: &[(Index, Value)], k: usize) -> Vec<(Index, Value)> {
        let mut found = Vec::with_capacity(k);
        if k == 0 {
            return found;
        }

        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        let root = self.tree.root();
        heap.push(SearchEntry {
            prob: NotNan::new(self.bank.partial_posterior(x, root)).unwrap(),
            seq,
            node: root,
        });

        while let Some(SearchEntry { prob, node, .. }) = heap.pop() {
            if self.tree.is_leaf(node) {
                if let Some(label) = self.tree.label_at(node) {
                    found.push((label, prob.into_inner()));
                    if found.len() >= k {
                        break;
                    }
                }
            } else {
                for child in self.tree.children(node) {
                    seq += 1;
                    heap.push(SearchEntry {
                        prob: NotNan::new(
                            prob.into_inner() * self.bank.partial_posterior(x, child),
                        )
                        .unwrap(),
                        seq,
                        node: child,
                    });
                }
            }
        }

        found
    }

    /// Threshold decision for a single label.
    pub fn is_positive(&self, x: &[(Index, Value)], label: Index) -> bool {
        match self.tree.node_for_label(label) {
            Some(leaf) => self.posterior(x, label) >= self.thresholds[leaf],
            None => false,
        }
    }

    /// Set one leaf threshold and restore min-propagation along its
    /// ancestor chain only.
    pub fn set_threshold(&mut self, label: Index, threshold: Value) {
        let leaf = match self.tree.node_for_label(label) {
            Some(leaf) => leaf,
            None => {
                warn!("Ignoring threshold for unregistered label {}", label);
                return;
            }
        };
        self.thresholds[leaf] = threshold;

        let mut node = leaf;
        while let Some(parent) = self.tree.parent(node) {
            self.thresholds[parent] = self
                .tree
                .children(parent)
                .into_iter()
                .map(|child| self.thresholds[child])
                .fold(Value::MAX, Value::min);
            node = parent;
        }
    }

    /// Set many leaf thresholds at once, then recompute every internal
    /// node's threshold bottom-up. Equivalent to repeated `set_threshold`
    /// but touches each internal node once.
    pub fn set_thresholds(&mut self, leaf_thresholds: &HashMap<Index, Value>) {
        for (&label, &threshold) in leaf_thresholds {
            match self.tree.node_for_label(label) {
                Some(leaf) => self.thresholds[leaf] = threshold,
                None => warn!("Ignoring threshold for unregistered label {}", label),
            }
        }

        match &self.tree {
            // Level-order ids let a single reverse sweep visit children first
            TreeKind::Complete(tree) => {
                for node in (0..tree.n_internal()).rev() {
                    self.thresholds[node] = tree
                        .children(node)
                        .into_iter()
                        .map(|child| self.thresholds[child])
                        .fold(Value::MAX, Value::min);
                }
            }
            _ => {
                refresh_min_thresholds(&self.tree, &mut self.thresholds, self.tree.root());
            }
        }
    }

    /// Running macro F-measure of the threshold tuner, if one is configured.
    pub fn macro_f1(&self) -> Option<Value> {
        self.tuner.as_ref().map(|tuner| tuner.macro_f1())
    }

    /// Macro F-measure after a hypothetical tuning batch, without changing
    /// any state.
    pub fn hypothetical_macro_f1(&self, batch: &[(IndexSet, IndexSet)]) -> Option<Value> {
        self.tuner
            .as_ref()
            .map(|tuner| tuner.hypothetical_macro_f1(batch))
    }

    /// Write the model into a directory: human-readable settings plus a
    /// binary state blob. The feature hasher is re-derived from its seed on
    /// load, never stored.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        info!("Saving model to {}", dir.display());
        fs::create_dir_all(dir)?;

        serde_json::to_writer_pretty(
            BufWriter::new(File::create(dir.join(SETTINGS_FILE))?),
            &self.hyper,
        )
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

        let state = SavedState {
            tree: self.tree.clone(),
            weights: self.bank.weights.clone(),
            bias: self.bank.bias.clone(),
            visits: self.bank.visits.clone(),
            scalars: self.bank.scalars.clone(),
            thresholds: self.thresholds.clone(),
            tuner: self.tuner.clone(),
            n_trained: self.n_trained,
        };
        bincode::serialize_into(
            BufWriter::new(File::create(dir.join(STATE_FILE))?),
            &state,
        )
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

        Ok(())
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        info!("Loading model from {}", dir.display());

        let hyper: HyperParam =
            serde_json::from_reader(BufReader::new(File::open(dir.join(SETTINGS_FILE))?))
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        hyper.validate()?;

        let state: SavedState =
            bincode::deserialize_from(BufReader::new(File::open(dir.join(STATE_FILE))?))
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;

        let size = state.tree.size();
        if state.weights.len() != hyper.hash_dim {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Weight array has {} entries but the declared hash dimension is {}",
                    state.weights.len(),
                    hyper.hash_dim
                ),
            ));
        }
        for (name, len) in &[
            ("bias", state.bias.len()),
            ("visit", state.visits.len()),
            ("scalar", state.scalars.len()),
            ("threshold", state.thresholds.len()),
        ] {
            if *len != size {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "The {} array has {} entries but the tree has {} nodes",
                        name, len, size
                    ),
                ));
            }
        }

        let hasher = FeatureHasher::new(hyper.hasher, hyper.hasher_seed, hyper.hash_dim, size)?;
        let mut bank = ClassifierBank::new(hasher, hyper.hash_dim, hyper.gamma, hyper.lambda, size);
        bank.weights = state.weights;
        bank.bias = state.bias;
        bank.visits = state.visits;
        bank.scalars = state.scalars;

        Ok(Model {
            tree: state.tree,
            bank,
            thresholds: state.thresholds,
            tuner: state.tuner,
            rng: StdRng::seed_from_u64(hyper.rng_seed),
            hyper,
            n_trained: state.n_trained,
        })
    }
}

const SETTINGS_FILE: &str = "settings.json";
const STATE_FILE: &str = "state.bin";

#[derive(Serialize, Deserialize)]
struct SavedState {
    tree: TreeKind,
    weights: Vec<Value>,
    bias: Vec<Value>,
    visits: Vec<u64>,
    scalars: Vec<Value>,
    thresholds: Vec<Value>,
    tuner: Option<OfoTuner>,
    n_trained: u64,
}

fn refresh_min_thresholds(tree: &TreeKind, thresholds: &mut [Value], node: usize) -> Value {
    if tree.is_leaf(node) {
        thresholds[node]
    } else {
        let min = tree
            .children(node)
            .into_iter()
            .map(|child| refresh_min_thresholds(tree, thresholds, child))
            .fold(Value::MAX, Value::min);
        thresholds[node] = min;
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn complete_model() -> Model {
        let hyper = HyperParam {
            tree_variant: TreeVariant::Complete,
            k: 2,
            hash_dim: 1000,
            hasher: HasherKind::Murmur,
            ..HyperParam::default()
        };
        hyper.allocate_with_labels(7, None).unwrap()
    }

    #[test]
    fn test_min_propagation_after_single_update() {
        let mut model = complete_model();
        model.set_threshold(3, 0.2);
        assert_min_propagated(&model);

        model.set_threshold(0, 0.05);
        model.set_threshold(6, 0.9);
        assert_min_propagated(&model);
        // Root carries the global minimum
        assert_eq!(0.05, model.thresholds[model.tree.root()]);
    }

    #[test]
    fn test_min_propagation_after_bulk_update() {
        let mut model = complete_model();
        let updates: HashMap<Index, Value> = vec![(0, 0.4), (2, 0.1), (5, 0.8), (6, 0.3)]
            .into_iter()
            .collect();
        model.set_thresholds(&updates);
        assert_min_propagated(&model);
        assert_eq!(0.1, model.thresholds[model.tree.root()]);

        // The sparse and bulk paths agree
        let mut other = complete_model();
        other.set_threshold(0, 0.4);
        other.set_threshold(2, 0.1);
        other.set_threshold(5, 0.8);
        other.set_threshold(6, 0.3);
        assert_eq!(other.thresholds, model.thresholds);
    }

    #[test]
    fn test_posterior_is_probability() {
        let model = complete_model();
        let x = vec![(0, 0.5), (3, -2.), (7, 10.)];
        for label in 0..7 {
            let p = model.posterior(&x, label);
            assert!((0. ..=1.).contains(&p), "posterior {} out of range", p);
        }
    }

    #[test]
    #[should_panic(expected = "has no leaf")]
    fn test_posterior_panics_for_unknown_label() {
        let model = complete_model();
        model.posterior(&[(0, 1.)], 7);
    }

    #[test]
    fn test_top_k_counts() {
        let model = complete_model();
        let x = vec![(1, 1.)];

        for k in &[1, 3, 7] {
            let top = model.predict_top_k(&x, *k);
            assert_eq!(*k, top.len());
            let distinct: IndexSet = top.iter().map(|&(label, _)| label).collect();
            assert_eq!(*k, distinct.len());
            for pair in top.windows(2) {
                assert!(pair[0].1 >= pair[1].1);
            }
        }

        // Asking for more labels than the tree has leaves
        assert_eq!(7, model.predict_top_k(&x, 20).len());
        assert!(model.predict_top_k(&x, 0).is_empty());
    }

    #[test]
    fn test_top_k_scores_match_posteriors() {
        let model = complete_model();
        let x = vec![(2, 1.), (4, -1.)];
        for (label, score) in model.predict_top_k(&x, 7) {
            assert!((score - model.posterior(&x, label)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_positive_prediction_respects_thresholds() {
        let mut model = complete_model();
        // Untrained partial posteriors are all 0.5, so the accumulated
        // probability at depth d is 0.5^d; a root-high threshold blocks all
        let updates: HashMap<Index, Value> =
            (0..7).map(|label| (label as Index, 0.9)).collect();
        model.set_thresholds(&updates);
        assert!(model.predict_positive(&[(0, 1.)]).is_empty());

        // Lowering every leaf threshold lets every label through
        let updates: HashMap<Index, Value> =
            (0..7).map(|label| (label as Index, 0.001)).collect();
        model.set_thresholds(&updates);
        let positives = model.predict_positive(&[(0, 1.)]);
        assert_eq!(IndexSet::from_iter(0..7), positives);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("adaplt-model-{}", std::process::id()));
        let mut model = complete_model();

        // Make the state non-trivial before persisting
        let instance = crate::Instance {
            features: vec![(0, 1.), (1, 1.)],
            labels: IndexSet::from_iter(vec![3]),
        };
        for _ in 0..10 {
            model.train_instance(&instance);
        }
        model.save(&dir).unwrap();

        let loaded = Model::load(&dir).unwrap();
        assert_eq!(model.n_nodes(), loaded.n_nodes());
        assert_eq!(model.n_trained(), loaded.n_trained());
        assert_eq!(model.thresholds, loaded.thresholds);

        let probes = vec![
            vec![(0, 1.), (1, 1.)],
            vec![(1, -0.5)],
            vec![(0, 0.3), (5, 2.)],
            vec![],
        ];
        for x in &probes {
            for label in 0..7 {
                assert!(
                    (model.posterior(x, label) - loaded.posterior(x, label)).abs() < 1e-9,
                    "posterior mismatch after reload"
                );
            }
        }

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_rejects_mismatched_arrays() {
        let dir = std::env::temp_dir().join(format!("adaplt-model-bad-{}", std::process::id()));
        let model = complete_model();
        model.save(&dir).unwrap();

        // Truncate the bias array inside the saved state
        let state_path = dir.join(STATE_FILE);
        let mut state: SavedState =
            bincode::deserialize_from(BufReader::new(File::open(&state_path).unwrap())).unwrap();
        state.bias.pop();
        bincode::serialize_into(
            BufWriter::new(File::create(&state_path).unwrap()),
            &state,
        )
        .unwrap();

        match Model::load(&dir) {
            Ok(_) => panic!("corrupted state should be rejected"),
            Err(err) => assert_eq!(ErrorKind::InvalidData, err.kind()),
        }

        fs::remove_dir_all(&dir).unwrap();
    }

    fn assert_min_propagated(model: &Model) {
        for node in 0..model.n_nodes() {
            if !model.tree.is_leaf(node) {
                let min = model
                    .tree
                    .children(node)
                    .into_iter()
                    .map(|child| model.thresholds[child])
                    .fold(Value::MAX, Value::min);
                assert_eq!(min, model.thresholds[node], "node {}", node);
            }
        }
    }
}
