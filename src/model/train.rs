use super::hasher::{FeatureHasher, HasherKind};
use super::linear::ClassifierBank;
use super::ofo::{instance_f1, OfoTuner};
use super::{Model, TreeKind};
use crate::tree::{AdaptiveTree, CompleteTree, ExplicitTree, LabelTree};
use crate::util;
use crate::{DataSet, Index, Instance, Value};
use clap::ValueEnum;
use const_default::ConstDefault;
use hashbrown::{HashMap, HashSet};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum TreeVariant {
    /// Complete k-ary tree over labels 0..n_labels, derived arithmetically.
    Complete,
    /// Tree structure loaded from a text file.
    Precomputed,
    /// Frequency-based Huffman tree; frequent labels get short paths.
    Huffman,
    /// Tree that grows a leaf per label as labels are first seen.
    Adaptive,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum TunerVariant {
    /// Keep all thresholds at the initial value.
    None,
    /// Online F-measure optimization of per-label thresholds.
    Ofo,
}

/// Hyper-parameters; same set covers batch allocation, incremental
/// bootstrap, and reload from a saved model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperParam {
    pub tree_variant: TreeVariant,
    pub k: usize,
    pub tree_file: Option<String>,
    pub hasher: HasherKind,
    pub hash_dim: usize,
    pub hasher_seed: u32,
    pub gamma: Value,
    pub lambda: Value,
    pub epochs: usize,
    pub tuner: TunerVariant,
    pub ofo_a_seed: u64,
    pub ofo_b_seed: u64,
    pub probability_weight: Value,
    pub prefer_highest_prob_leaf: bool,
    pub prefer_shallow_leaf: bool,
    pub rng_seed: u64,
}

impl ConstDefault for HyperParam {
    const DEFAULT: Self = Self {
        tree_variant: TreeVariant::Complete,
        k: 2,
        tree_file: None,
        hasher: HasherKind::Mask,
        hash_dim: 1 << 23,
        hasher_seed: 1,
        gamma: 1.,
        lambda: 1e-5,
        epochs: 1,
        tuner: TunerVariant::Ofo,
        ofo_a_seed: 100,
        ofo_b_seed: 200,
        probability_weight: 0.5,
        prefer_highest_prob_leaf: true,
        prefer_shallow_leaf: true,
        rng_seed: 2018,
    };
}

impl Default for HyperParam {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl HyperParam {
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, message: String) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::new(ErrorKind::InvalidInput, message))
            }
        }

        check(
            self.k >= 2,
            format!("Branching factor must be at least 2, got {}", self.k),
        )?;
        check(self.hash_dim > 0, "Hash dimension must be positive".into())?;
        check(
            self.gamma > 0. && self.gamma.is_finite(),
            format!("gamma must be a positive finite number, got {}", self.gamma),
        )?;
        check(
            self.lambda >= 0. && self.lambda.is_finite(),
            format!("lambda must be non-negative, got {}", self.lambda),
        )?;
        check(self.epochs >= 1, "Number of epochs must be at least 1".into())?;
        check(
            (0. ..=1.).contains(&self.probability_weight),
            format!(
                "probability_weight must lie in [0, 1], got {}",
                self.probability_weight
            ),
        )?;
        check(
            self.ofo_a_seed > 0 && self.ofo_a_seed <= self.ofo_b_seed,
            format!(
                "OFO seeds must satisfy 0 < a <= b, got a={} b={}",
                self.ofo_a_seed, self.ofo_b_seed
            ),
        )?;
        if self.tree_variant == TreeVariant::Precomputed {
            check(
                self.tree_file.is_some(),
                "A precomputed tree needs a tree file".into(),
            )?;
        }
        Ok(())
    }

    /// Allocate an untrained model sized for the given dataset.
    pub fn allocate(&self, dataset: &DataSet) -> Result<Model> {
        match self.tree_variant {
            TreeVariant::Huffman => {
                self.allocate_with_labels(dataset.n_labels, Some(&dataset.label_frequencies()))
            }
            _ => self.allocate_with_labels(dataset.n_labels, None),
        }
    }

    /// Allocate for a known label count without a dataset in hand. Huffman
    /// trees degenerate to uniform frequencies when none are given.
    pub fn allocate_with_labels(
        &self,
        n_labels: usize,
        label_frequencies: Option<&[u64]>,
    ) -> Result<Model> {
        self.validate()?;
        let tree = match self.tree_variant {
            TreeVariant::Complete => TreeKind::Complete(CompleteTree::new(self.k, n_labels)?),
            TreeVariant::Precomputed => {
                let path = self
                    .tree_file
                    .as_ref()
                    .ok_or_else(|| {
                        Error::new(ErrorKind::InvalidInput, "A precomputed tree needs a tree file")
                    })?;
                TreeKind::Explicit(ExplicitTree::from_tree_file(path)?)
            }
            TreeVariant::Huffman => {
                let uniform;
                let frequencies = match label_frequencies {
                    Some(frequencies) => frequencies,
                    None => {
                        uniform = vec![1u64; n_labels];
                        &uniform
                    }
                };
                TreeKind::Explicit(ExplicitTree::huffman(self.k, frequencies)?)
            }
            TreeVariant::Adaptive => {
                let labels: Vec<Index> = (0..n_labels as Index).collect();
                TreeKind::Adaptive(AdaptiveTree::from_complete(self.k, &labels)?)
            }
        };
        self.assemble(tree)
    }

    /// Allocate a model that starts from a single placeholder leaf and learns
    /// its label set from the stream. Only meaningful with an adaptive tree.
    pub fn allocate_incremental(&self) -> Result<Model> {
        self.validate()?;
        if self.tree_variant != TreeVariant::Adaptive {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Incremental allocation requires an adaptive tree",
            ));
        }
        self.assemble(TreeKind::Adaptive(AdaptiveTree::bootstrap(self.k)?))
    }

    fn assemble(&self, tree: TreeKind) -> Result<Model> {
        let size = tree.size();
        let hasher = FeatureHasher::new(self.hasher, self.hasher_seed, self.hash_dim, size)?;
        let bank = ClassifierBank::new(hasher, self.hash_dim, self.gamma, self.lambda, size);
        let tuner = match self.tuner {
            TunerVariant::None => None,
            TunerVariant::Ofo => {
                let labels: Vec<Index> =
                    (0..size).filter_map(|node| tree.label_at(node)).collect();
                Some(OfoTuner::with_labels(labels, self.ofo_a_seed, self.ofo_b_seed))
            }
        };

        let mut model = Model {
            tree,
            bank,
            thresholds: vec![INITIAL_THRESHOLD; size],
            tuner,
            hyper: self.clone(),
            rng: StdRng::seed_from_u64(self.rng_seed),
            n_trained: 0,
        };
        let seeded = model.tuner.as_ref().map(|tuner| tuner.thresholds());
        if let Some(thresholds) = seeded {
            model.set_thresholds(&thresholds);
        }
        info!(
            "Allocated {:?} tree with {} nodes over {} labels; k={} hasher={:?} hash_dim={} \
             gamma={} lambda={} tuner={:?}",
            self.tree_variant,
            model.tree.size(),
            model.tree.n_labels(),
            self.k,
            self.hasher,
            self.hash_dim,
            self.gamma,
            self.lambda,
            self.tuner,
        );
        Ok(model)
    }
}

const INITIAL_THRESHOLD: Value = 0.5;

impl Model {
    /// Run the configured number of epochs over the dataset.
    pub fn train(&mut self, dataset: &DataSet) {
        let start_t = time::precise_time_s();
        let n_examples = dataset.instances.len();
        info!(
            "Training on {} examples for {} epoch(s)",
            n_examples, self.hyper.epochs
        );

        let mut bar = util::create_progress_bar((self.hyper.epochs * n_examples) as u64);
        let mut f1_sum = 0.;
        for _ in 0..self.hyper.epochs {
            let mut cursor = dataset.cursor();
            while let Some(instance) = cursor.next_instance() {
                f1_sum += self.train_instance(instance);
                bar.inc();
            }
        }
        bar.finish();

        let n_updates = (self.hyper.epochs * n_examples).max(1);
        info!(
            "Training took {:.2}s; prequential example F1 {:.4}; weight density {:.4}",
            time::precise_time_s() - start_t,
            f1_sum / n_updates as Value,
            self.bank.weight_density(),
        );
        if let Some(f1) = self.macro_f1() {
            info!("Running macro F1 estimate {:.4}", f1);
        }
    }

    /// One online step: grow leaves for unseen labels if the tree is
    /// adaptive, score the instance and feed that prediction to the
    /// threshold tuner, then update the classifiers along the true paths
    /// and their sibling frontier. Returns the instance-wise F1 of the
    /// prediction.
    pub fn train_instance(&mut self, instance: &Instance) -> Value {
        let x = &instance.features;

        let mut true_labels: Vec<Index> = instance.labels.iter().cloned().collect();
        true_labels.sort_unstable();

        if let TreeKind::Adaptive(_) = self.tree {
            for i in 0..true_labels.len() {
                let label = true_labels[i];
                if !self.tree.has_label(label) {
                    self.grow_leaf(x, label, &true_labels);
                }
            }
        }

        // Prequential step: score the instance with the model as it stands,
        // then learn from it. The same prediction feeds the threshold tuner.
        let predicted = self.predict_positive(x);
        let f1 = instance_f1(&predicted, &instance.labels);
        let batch = [(predicted, instance.labels.clone())];
        let affected = match self.tuner.as_mut() {
            Some(tuner) => tuner.fit(&batch),
            None => HashMap::new(),
        };
        for (&label, &threshold) in &affected {
            self.set_threshold(label, threshold);
        }

        // Positive nodes are the union of root paths of the true leaves;
        // negatives are their non-positive children. Without any usable true
        // label the root alone gets a negative update.
        let mut positive = HashSet::new();
        for &label in &true_labels {
            match self.tree.node_for_label(label) {
                Some(leaf) => {
                    let mut node = leaf;
                    loop {
                        if !positive.insert(node) {
                            break;
                        }
                        match self.tree.parent(node) {
                            Some(parent) => node = parent,
                            None => break,
                        }
                    }
                }
                None => warn!("Skipping unregistered label {} during training", label),
            }
        }

        let mut negative = Vec::new();
        if positive.is_empty() {
            negative.push(self.tree.root());
        } else {
            for &node in &positive {
                for child in self.tree.children(node) {
                    if !positive.contains(&child) {
                        negative.push(child);
                    }
                }
            }
        }

        // Update in ascending node order so runs are reproducible
        let mut positive: Vec<usize> = positive.into_iter().collect();
        positive.sort_unstable();
        negative.sort_unstable();
        for &node in &positive {
            let p = self.bank.partial_posterior(x, node);
            self.bank.update(x, node, -(1. - p));
        }
        for &node in &negative {
            let p = self.bank.partial_posterior(x, node);
            self.bank.update(x, node, p);
        }

        self.n_trained += 1;
        f1
    }

    /// Grow the adaptive tree to give `label` a leaf, then extend classifier
    /// state and thresholds to cover the new nodes.
    fn grow_leaf(&mut self, x: &[(Index, Value)], label: Index, known_true: &[Index]) {
        let host = self.resolve_host(x, known_true);
        let new_leaf = match &mut self.tree {
            TreeKind::Adaptive(tree) => tree.adapt_leaf(host, label),
            _ => unreachable!("only adaptive trees grow"),
        };

        let size = self.tree.size();
        self.bank.grow(size);
        self.thresholds.resize(size, INITIAL_THRESHOLD);

        let threshold = match self.tuner.as_mut() {
            Some(tuner) => {
                tuner.accommodate(label);
                tuner.threshold(label).unwrap_or(INITIAL_THRESHOLD)
            }
            None => INITIAL_THRESHOLD,
        };
        // Also restores min-propagation through any freshly split ancestor
        self.set_threshold(label, threshold);

        info!(
            "Grew leaf {} for label {}; tree now has {} nodes over {} labels",
            new_leaf,
            label,
            size,
            self.tree.n_labels()
        );
    }

    /// Choose the host leaf a new label should grow next to.
    ///
    /// Prefers the positive-predicted leaf scoring highest on a blend of its
    /// probability and its relative depth; falls back to a random registered
    /// true label of the instance, then to the shallowest (or deepest)
    /// labeled leaf. `None` means the bootstrap placeholder is still in
    /// place and should simply be relabeled.
    fn resolve_host(&mut self, x: &[(Index, Value)], known_true: &[Index]) -> Option<Index> {
        if self.tree.n_labels() == 0 {
            return None;
        }

        let probability_weight = self.hyper.probability_weight;
        let prefer_highest_prob = self.hyper.prefer_highest_prob_leaf;
        let prefer_shallow = self.hyper.prefer_shallow_leaf;

        let tree_depth = self.tree.depth() as Value;
        let mut best: Option<(Value, Index)> = None;
        for (label, posterior) in self.predict_positive_scored(x) {
            let leaf = self
                .tree
                .node_for_label(label)
                .expect("predicted labels are registered");
            let prob_pref = if prefer_highest_prob {
                posterior
            } else {
                1. - posterior
            };
            // The depth term always favors shallow hosts; the shallow/deep
            // preference only steers the no-prediction fallback below
            let depth_pref = 1. - self.tree.node_depth(leaf) as Value / tree_depth;
            let score =
                probability_weight * prob_pref + (1. - probability_weight) * depth_pref;
            match best {
                Some((top, _)) if top >= score => {}
                _ => best = Some((score, label)),
            }
        }
        if let Some((_, label)) = best {
            return Some(label);
        }

        let registered: Vec<Index> = known_true
            .iter()
            .cloned()
            .filter(|&label| self.tree.has_label(label))
            .collect();
        if !registered.is_empty() {
            return Some(registered[self.rng.gen_range(0..registered.len())]);
        }

        let mut pick: Option<(usize, Index)> = None;
        for node in 0..self.tree.size() {
            if !self.tree.is_leaf(node) {
                continue;
            }
            if let Some(label) = self.tree.label_at(node) {
                let depth = self.tree.node_depth(node);
                let better = match pick {
                    None => true,
                    Some((best_depth, _)) => {
                        if prefer_shallow {
                            depth < best_depth
                        } else {
                            depth > best_depth
                        }
                    }
                };
                if better {
                    pick = Some((depth, label));
                }
            }
        }
        pick.map(|(_, label)| label)
    }
}
