mod adaptive;
mod explicit;

pub use adaptive::AdaptiveTree;
pub use explicit::ExplicitTree;

use crate::Index;
use serde::{Deserialize, Serialize};

/// Contract shared by all label-tree shapes.
///
/// Node ids are dense and append-only; the root always exists. Every leaf
/// carries at most one label, every registered label maps to exactly one leaf.
/// The root has depth 1.
pub trait LabelTree {
    /// Total number of nodes.
    fn size(&self) -> usize;

    /// Number of nodes with at least one child.
    fn n_internal(&self) -> usize;

    /// Number of registered labels.
    fn n_labels(&self) -> usize;

    /// Maximum number of children per internal node (k).
    fn branching(&self) -> usize;

    fn root(&self) -> usize;

    fn parent(&self, node: usize) -> Option<usize>;

    fn children(&self, node: usize) -> Vec<usize>;

    fn is_leaf(&self, node: usize) -> bool {
        self.children(node).is_empty()
    }

    /// The leaf node carrying the given label, if registered.
    fn node_for_label(&self, label: Index) -> Option<usize>;

    /// The label carried by the given node; `None` for internal nodes and
    /// the bootstrap placeholder leaf.
    fn label_at(&self, node: usize) -> Option<Index>;

    fn has_label(&self, label: Index) -> bool {
        self.node_for_label(label).is_some()
    }

    fn node_depth(&self, node: usize) -> usize {
        let mut depth = 1;
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Maximum depth over all leaves.
    fn depth(&self) -> usize;
}

/// Complete k-ary tree with level-order node ids.
///
/// Internal nodes occupy ids `[0, n_internal)`, leaves the last `m` ids, so
/// parent/child relations reduce to heap arithmetic and label `l` sits at
/// node `n_internal + l`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteTree {
    k: usize,
    m: usize,
    n_internal: usize,
    size: usize,
}

impl CompleteTree {
    pub fn new(k: usize, m: usize) -> std::io::Result<Self> {
        if k < 2 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Branching factor must be at least 2, got {}", k),
            ));
        }
        if m == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Cannot build a complete tree without labels",
            ));
        }
        // Smallest number of internal nodes that leaves room for m leaves
        let n_internal = (m - 1 + k - 2) / (k - 1);
        Ok(Self {
            k,
            m,
            n_internal,
            size: n_internal + m,
        })
    }
}

impl LabelTree for CompleteTree {
    fn size(&self) -> usize {
        self.size
    }

    fn n_internal(&self) -> usize {
        self.n_internal
    }

    fn n_labels(&self) -> usize {
        self.m
    }

    fn branching(&self) -> usize {
        self.k
    }

    fn root(&self) -> usize {
        0
    }

    fn parent(&self, node: usize) -> Option<usize> {
        debug_assert!(node < self.size);
        if node == 0 {
            None
        } else {
            Some((node - 1) / self.k)
        }
    }

    fn children(&self, node: usize) -> Vec<usize> {
        debug_assert!(node < self.size);
        let first = self.k * node + 1;
        (first..(first + self.k).min(self.size)).collect()
    }

    fn is_leaf(&self, node: usize) -> bool {
        node >= self.n_internal
    }

    fn node_for_label(&self, label: Index) -> Option<usize> {
        if (label as usize) < self.m {
            Some(self.n_internal + label as usize)
        } else {
            None
        }
    }

    fn label_at(&self, node: usize) -> Option<Index> {
        debug_assert!(node < self.size);
        if node >= self.n_internal {
            Some((node - self.n_internal) as Index)
        } else {
            None
        }
    }

    fn depth(&self) -> usize {
        // The last node in level order is among the deepest
        self.node_depth(self.size - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_tree_shape() {
        let tree = CompleteTree::new(2, 7).unwrap();
        assert_eq!(13, tree.size());
        assert_eq!(6, tree.n_internal());
        assert_eq!(7, tree.n_labels());
        assert_eq!(0, tree.root());
        assert_eq!(4, tree.depth());

        // Leaves are the last m ids
        for node in 0..6 {
            assert!(!tree.is_leaf(node));
        }
        for node in 6..13 {
            assert!(tree.is_leaf(node));
            assert!(tree.children(node).is_empty());
        }
    }

    #[test]
    fn test_complete_tree_parent_child_consistency() {
        for &(k, m) in &[(2, 7), (3, 6), (3, 9), (4, 1), (2, 1), (5, 23)] {
            let tree = CompleteTree::new(k, m).unwrap();
            for node in 0..tree.size() {
                let children = tree.children(node);
                assert!(children.len() <= k);
                for &child in &children {
                    assert_eq!(Some(node), tree.parent(child));
                    assert_eq!(tree.node_depth(node) + 1, tree.node_depth(child));
                }
            }
            // Every non-root node is reachable as a child of its parent
            for node in 1..tree.size() {
                assert!(tree.children(tree.parent(node).unwrap()).contains(&node));
            }
        }
    }

    #[test]
    fn test_complete_tree_label_round_trip() {
        let tree = CompleteTree::new(3, 6).unwrap();
        for label in 0..6 {
            let node = tree.node_for_label(label).unwrap();
            assert!(tree.is_leaf(node));
            assert_eq!(Some(label), tree.label_at(node));
        }
        assert!(tree.node_for_label(6).is_none());
        assert!(!tree.has_label(6));
    }

    #[test]
    fn test_single_label_tree() {
        let tree = CompleteTree::new(2, 1).unwrap();
        assert_eq!(1, tree.size());
        assert_eq!(0, tree.n_internal());
        assert_eq!(1, tree.depth());
        assert!(tree.is_leaf(tree.root()));
        assert_eq!(Some(0), tree.node_for_label(0));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(CompleteTree::new(1, 5).is_err());
        assert!(CompleteTree::new(2, 0).is_err());
    }
}
