use super::LabelTree;
use crate::Index;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct AdaptiveNode {
    parent: Option<usize>,
    children: Vec<usize>,
    label: Option<Index>,
    depth: usize,
}

/// Label tree that grows one leaf at a time.
///
/// Starts either as a snapshot of a fixed tree or as a single unlabeled
/// placeholder leaf. Node ids are append-only: splits never renumber
/// existing nodes, so hashed per-node state stays valid across growth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveTree {
    k: usize,
    root: usize,
    nodes: Vec<AdaptiveNode>,
    label_to_node: HashMap<Index, usize>,
    n_internal: usize,
    /// True while the tree consists of the single bootstrap leaf with no label.
    placeholder: bool,
}

impl AdaptiveTree {
    /// Start with a single placeholder leaf and no labels; the first
    /// `adapt_leaf` call relabels it in place.
    pub fn bootstrap(k: usize) -> Result<Self> {
        if k < 2 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Branching factor must be at least 2, got {}", k),
            ));
        }
        Ok(Self {
            k,
            root: 0,
            nodes: vec![AdaptiveNode {
                parent: None,
                children: Vec::new(),
                label: None,
                depth: 1,
            }],
            label_to_node: HashMap::new(),
            n_internal: 0,
            placeholder: true,
        })
    }

    /// Snapshot an existing tree into adaptable form, preserving node ids,
    /// shape and label assignment.
    pub fn from_tree(tree: &impl LabelTree) -> Self {
        let mut nodes = Vec::with_capacity(tree.size());
        let mut label_to_node = HashMap::new();
        for id in 0..tree.size() {
            let label = tree.label_at(id);
            if let Some(label) = label {
                label_to_node.insert(label, id);
            }
            nodes.push(AdaptiveNode {
                parent: tree.parent(id),
                children: tree.children(id),
                label,
                depth: tree.node_depth(id),
            });
        }
        Self {
            k: tree.branching(),
            root: tree.root(),
            nodes,
            label_to_node,
            n_internal: tree.n_internal(),
            placeholder: false,
        }
    }

    /// Complete-tree shape over an arbitrary label set: the i-th leaf in
    /// level order carries `labels[i]`. An empty label set bootstraps;
    /// duplicate labels are rejected.
    pub fn from_complete(k: usize, labels: &[Index]) -> Result<Self> {
        if labels.is_empty() {
            return Self::bootstrap(k);
        }
        let complete = super::CompleteTree::new(k, labels.len())?;
        let mut tree = Self::from_tree(&complete);
        tree.label_to_node.clear();
        for id in 0..tree.nodes.len() {
            if let Some(slot) = tree.nodes[id].label {
                let label = labels[slot as usize];
                tree.nodes[id].label = Some(label);
                if tree.label_to_node.insert(label, id).is_some() {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!("Label {} appears more than once", label),
                    ));
                }
            }
        }
        Ok(tree)
    }

    /// Labels currently registered, in no particular order.
    pub fn labels(&self) -> impl Iterator<Item = Index> + '_ {
        self.label_to_node.keys().cloned()
    }

    /// Grow the tree to accommodate `new_label` next to the leaf carrying
    /// `host`. With room under the host's parent the new leaf attaches
    /// directly (size +1); otherwise the host leaf is replaced by a fresh
    /// internal node adopting both it and the new leaf (size +2). A `None`
    /// host relabels the bootstrap placeholder in place (size +0).
    ///
    /// Returns the node id of the new leaf.
    ///
    /// Panics when the host label is not registered, or when `None` is
    /// passed without a placeholder present; callers resolve hosts from the
    /// tree itself, so either is a logic error.
    pub fn adapt_leaf(&mut self, host: Option<Index>, new_label: Index) -> usize {
        assert!(
            !self.label_to_node.contains_key(&new_label),
            "label {} is already registered",
            new_label
        );

        let host = match host {
            Some(label) => label,
            None => {
                assert!(
                    self.placeholder,
                    "no host label given and no placeholder leaf to relabel"
                );
                let root = self.root;
                self.nodes[root].label = Some(new_label);
                self.label_to_node.insert(new_label, root);
                self.placeholder = false;
                return root;
            }
        };

        let leaf = *self
            .label_to_node
            .get(&host)
            .unwrap_or_else(|| panic!("host label {} is not registered", host));

        let new_leaf = self.nodes.len();
        self.nodes.push(AdaptiveNode {
            parent: None,
            children: Vec::new(),
            label: Some(new_label),
            depth: 0,
        });
        self.label_to_node.insert(new_label, new_leaf);

        let parent = self.nodes[leaf].parent;
        match parent {
            Some(parent) if self.nodes[parent].children.len() < self.k => {
                self.attach(new_leaf, parent);
            }
            _ => {
                // Host's parent is full (or the host is the root): a fresh
                // internal node takes the host's place and adopts both leaves
                let new_parent = self.nodes.len();
                self.nodes.push(AdaptiveNode {
                    parent: None,
                    children: Vec::new(),
                    label: None,
                    depth: 0,
                });
                if let Some(grandparent) = parent {
                    self.attach(new_parent, grandparent);
                    self.detach(leaf, grandparent);
                } else {
                    self.nodes[new_parent].depth = 1;
                    self.root = new_parent;
                }
                self.attach(leaf, new_parent);
                self.attach(new_leaf, new_parent);
                self.n_internal += 1;
            }
        }

        new_leaf
    }

    fn attach(&mut self, node: usize, parent: usize) {
        self.nodes[parent].children.push(node);
        self.nodes[node].parent = Some(parent);
        self.nodes[node].depth = self.nodes[parent].depth + 1;
    }

    fn detach(&mut self, node: usize, parent: usize) {
        self.nodes[parent].children.retain(|&child| child != node);
        self.nodes[node].parent = None;
    }
}

impl LabelTree for AdaptiveTree {
    fn size(&self) -> usize {
        self.nodes.len()
    }

    fn n_internal(&self) -> usize {
        self.n_internal
    }

    fn n_labels(&self) -> usize {
        self.label_to_node.len()
    }

    fn branching(&self) -> usize {
        self.k
    }

    fn root(&self) -> usize {
        self.root
    }

    fn parent(&self, node: usize) -> Option<usize> {
        self.nodes[node].parent
    }

    fn children(&self, node: usize) -> Vec<usize> {
        self.nodes[node].children.clone()
    }

    fn is_leaf(&self, node: usize) -> bool {
        self.nodes[node].children.is_empty()
    }

    fn node_for_label(&self, label: Index) -> Option<usize> {
        self.label_to_node.get(&label).cloned()
    }

    fn label_at(&self, node: usize) -> Option<Index> {
        self.nodes[node].label
    }

    fn node_depth(&self, node: usize) -> usize {
        self.nodes[node].depth
    }

    fn depth(&self) -> usize {
        // Splits shift whole subtrees down, so recompute instead of caching
        self.nodes
            .iter()
            .filter(|node| node.children.is_empty())
            .map(|node| node.depth)
            .max()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::CompleteTree;
    use itertools::Itertools;

    #[test]
    fn test_snapshot_matches_original_tree() {
        let complete = CompleteTree::new(2, 7).unwrap();
        let tree = AdaptiveTree::from_tree(&complete);

        assert_eq!(complete.branching(), tree.branching());
        assert_eq!(complete.n_labels(), tree.n_labels());
        assert_eq!(complete.n_internal(), tree.n_internal());
        assert_eq!(complete.size(), tree.size());
        assert_eq!(4, tree.depth());
        for label in 0..7 {
            assert_eq!(complete.node_for_label(label), tree.node_for_label(label));
        }
    }

    #[test]
    fn test_adapting_full_parent_splits_leaf() {
        let complete = CompleteTree::new(2, 7).unwrap();
        let mut tree = AdaptiveTree::from_tree(&complete);
        let depth = tree.depth();

        let new_leaf = tree.adapt_leaf(Some(0), 700);

        assert_eq!(complete.n_labels() + 1, tree.n_labels());
        assert_eq!(complete.n_internal() + 1, tree.n_internal());
        assert_eq!(complete.size() + 2, tree.size());
        assert_eq!(Some(new_leaf), tree.node_for_label(700));
        assert_eq!(depth, tree.depth());
    }

    #[test]
    fn test_adapting_non_full_parent_attaches_directly() {
        let complete = CompleteTree::new(3, 6).unwrap();
        let mut tree = AdaptiveTree::from_tree(&complete);
        let depth = tree.depth();

        tree.adapt_leaf(Some(5), 700);

        assert_eq!(complete.n_labels() + 1, tree.n_labels());
        assert_eq!(complete.size() + 1, tree.size());
        assert!(tree.children(2).contains(&tree.node_for_label(700).unwrap()));
        assert_eq!(depth, tree.depth());
    }

    #[test]
    fn test_adapting_full_tree_increases_depth() {
        let complete = CompleteTree::new(3, 9).unwrap();
        let mut tree = AdaptiveTree::from_tree(&complete);
        let depth = tree.depth();

        tree.adapt_leaf(Some(8), 700);

        assert_eq!(complete.n_labels() + 1, tree.n_labels());
        assert_eq!(complete.size() + 2, tree.size());
        assert!(tree.children(3).contains(&14));
        assert!(tree.children(14).contains(&12));
        assert!(tree.children(14).contains(&13));
        assert_eq!(depth + 1, tree.depth());
    }

    #[test]
    fn test_bootstrap_relabels_in_place_then_splits() {
        let mut tree = AdaptiveTree::bootstrap(2).unwrap();
        assert_eq!(1, tree.size());
        assert_eq!(0, tree.n_labels());
        assert!(tree.label_at(tree.root()).is_none());

        // First label takes over the placeholder without growing
        let leaf = tree.adapt_leaf(None, 5);
        assert_eq!(tree.root(), leaf);
        assert_eq!(1, tree.size());
        assert_eq!(1, tree.n_labels());
        assert!(tree.has_label(5));

        // Second label splits the root leaf
        tree.adapt_leaf(Some(5), 9);
        assert_eq!(3, tree.size());
        assert_eq!(1, tree.n_internal());
        assert_eq!(2, tree.depth());
        assert_eq!(vec![5, 9], tree.labels().sorted().collect_vec());
        assert!(!tree.is_leaf(tree.root()));
        for label in &[5, 9] {
            let node = tree.node_for_label(*label).unwrap();
            assert_eq!(Some(tree.root()), tree.parent(node));
        }
    }

    #[test]
    fn test_child_count_never_exceeds_branching() {
        let mut tree = AdaptiveTree::bootstrap(3).unwrap();
        tree.adapt_leaf(None, 0);
        for label in 1..30 {
            let host = (label - 1) / 2;
            tree.adapt_leaf(Some(host), label);
            for node in 0..tree.size() {
                assert!(tree.children(node).len() <= 3);
            }
        }
        assert_eq!(30, tree.n_labels());
    }

    #[test]
    fn test_from_complete_with_sparse_label_set() {
        let tree = AdaptiveTree::from_complete(2, &[3, 8, 21]).unwrap();
        assert_eq!(3, tree.n_labels());
        assert_eq!(5, tree.size());
        for label in &[3, 8, 21] {
            let node = tree.node_for_label(*label).unwrap();
            assert!(tree.is_leaf(node));
            assert_eq!(Some(*label), tree.label_at(node));
        }
        assert!(!tree.has_label(0));
    }

    #[test]
    fn test_from_complete_rejects_duplicate_labels() {
        assert!(AdaptiveTree::from_complete(2, &[3, 3]).is_err());
        assert!(AdaptiveTree::from_complete(2, &[1, 2, 1]).is_err());
        assert!(AdaptiveTree::from_complete(2, &[1, 2, 3]).is_ok());
    }
}
