use super::LabelTree;
use crate::Index;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NodeRecord {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub label: Option<Index>,
}

/// Label tree backed by explicit adjacency records, used for structures that
/// cannot be derived arithmetically: trees loaded from a file and
/// frequency-built Huffman trees.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitTree {
    k: usize,
    root: usize,
    nodes: Vec<NodeRecord>,
    label_to_node: HashMap<Index, usize>,
}

impl ExplicitTree {
    /// Load a tree structure from a text file.
    ///
    /// The first line holds `size k`; each of the following `size` lines
    /// describes one node as `parent label`, with `-1` standing for "none".
    /// Node ids are implicit line numbers starting at 0.
    pub fn from_tree_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let mut lines = content.lines();

        let (size, k) = {
            let header = lines
                .next()
                .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Missing tree file header"))?;
            let tokens: Vec<&str> = header.split_whitespace().collect();
            if tokens.len() != 2 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Expect header with 2 tokens, found {}", tokens.len()),
                ));
            }
            let size = tokens[0]
                .parse::<usize>()
                .map_err(|_| Error::new(ErrorKind::InvalidData, "Failed to parse tree size"))?;
            let k = tokens[1].parse::<usize>().map_err(|_| {
                Error::new(ErrorKind::InvalidData, "Failed to parse branching factor")
            })?;
            (size, k)
        };

        let mut nodes = Vec::with_capacity(size);
        for (id, line) in lines.take(size).enumerate() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 2 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Expect 2 tokens for node {}, found {}", id, tokens.len()),
                ));
            }
            let parent = match tokens[0].parse::<i64>() {
                Ok(-1) => None,
                Ok(p) if p >= 0 && (p as usize) < size => Some(p as usize),
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Invalid parent for node {}: {}", id, tokens[0]),
                    ));
                }
            };
            let label = match tokens[1].parse::<i64>() {
                Ok(-1) => None,
                Ok(l) if l >= 0 => Some(l as Index),
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Invalid label for node {}: {}", id, tokens[1]),
                    ));
                }
            };
            nodes.push(NodeRecord {
                parent,
                children: Vec::new(),
                label,
            });
        }
        if nodes.len() != size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Expected {} node lines, found {}", size, nodes.len()),
            ));
        }

        let mut root = None;
        for id in 0..size {
            match nodes[id].parent {
                Some(parent) => nodes[parent].children.push(id),
                None => {
                    if root.replace(id).is_some() {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "Tree file declares more than one root",
                        ));
                    }
                }
            }
        }
        let root =
            root.ok_or_else(|| Error::new(ErrorKind::InvalidData, "Tree file declares no root"))?;

        Self::assemble(k, root, nodes)
    }

    /// Build a k-ary Huffman tree over labels `0..frequencies.len()`, merging
    /// the lowest-frequency forest roots first so frequent labels end up on
    /// short paths. Ids are dense: leaves first, then internal nodes in
    /// creation order, the root last.
    pub fn huffman(k: usize, frequencies: &[u64]) -> Result<Self> {
        if k < 2 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("Branching factor must be at least 2, got {}", k),
            ));
        }
        let m = frequencies.len();
        if m == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Cannot build a Huffman tree without labels",
            ));
        }

        let mut nodes: Vec<NodeRecord> = (0..m)
            .map(|label| NodeRecord {
                parent: None,
                children: Vec::new(),
                label: Some(label as Index),
            })
            .collect();

        // Min-heap of forest roots; ties broken by node id for determinism
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = (0..m)
            .map(|id| Reverse((frequencies[id], id)))
            .collect();

        // The first merge may take fewer than k nodes so that all later
        // merges are full and the tree stays k-ary without gaps
        let mut merge_width = if m > 1 {
            let remainder = (m - 1) % (k - 1);
            if remainder == 0 {
                k
            } else {
                remainder + 1
            }
        } else {
            1
        };

        while heap.len() > 1 {
            let id = nodes.len();
            let mut weight = 0u64;
            let mut children = Vec::with_capacity(merge_width);
            for _ in 0..merge_width.min(heap.len()) {
                let Reverse((w, child)) = heap.pop().expect("heap underflow");
                weight += w;
                nodes[child].parent = Some(id);
                children.push(child);
            }
            nodes.push(NodeRecord {
                parent: None,
                children,
                label: None,
            });
            heap.push(Reverse((weight, id)));
            merge_width = k;
        }

        let root = nodes.len() - 1;
        Self::assemble(k, root, nodes)
    }

    fn assemble(k: usize, root: usize, nodes: Vec<NodeRecord>) -> Result<Self> {
        let mut label_to_node = HashMap::new();
        for (id, node) in nodes.iter().enumerate() {
            if node.children.len() > k {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "Node {} has {} children, more than branching factor {}",
                        id,
                        node.children.len(),
                        k
                    ),
                ));
            }
            if let Some(label) = node.label {
                if !node.children.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Internal node {} carries label {}", id, label),
                    ));
                }
                if label_to_node.insert(label, id).is_some() {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("Label {} is assigned to more than one leaf", label),
                    ));
                }
            }
        }

        let tree = Self {
            k,
            root,
            nodes,
            label_to_node,
        };

        // Every node must hang off the root exactly once
        let mut visited = vec![false; tree.nodes.len()];
        let mut stack = vec![tree.root];
        while let Some(node) = stack.pop() {
            if visited[node] {
                return Err(Error::new(ErrorKind::InvalidData, "Tree contains a cycle"));
            }
            visited[node] = true;
            stack.extend(&tree.nodes[node].children);
        }
        if !visited.iter().all(|&v| v) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Tree contains nodes unreachable from the root",
            ));
        }

        Ok(tree)
    }
}

impl LabelTree for ExplicitTree {
    fn size(&self) -> usize {
        self.nodes.len()
    }

    fn n_internal(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| !node.children.is_empty())
            .count()
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

    fn depth(&self) -> usize {
        (0..self.nodes.len())
            .filter(|&node| self.is_leaf(node))
            .map(|node| self.node_depth(node))
            .max()
            .unwrap_or(1)
    }
}
