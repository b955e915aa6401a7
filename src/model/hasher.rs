use crate::{Index, Value};
use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind, Result};

/// Hashing strategy for mapping (node, feature) pairs into the shared
/// weight array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum HasherKind {
    /// Bit-mask hasher; requires the hash dimension to be a power of two.
    Mask,
    /// Murmur-based hasher with per-node parameters; works for any dimension
    /// and grows parameters for new nodes as an adaptive tree splits.
    Murmur,
}

const SIGN_SALT: u32 = 0x9e37_79b9;

/// Single-word murmur3 (32-bit) with the standard finalizer.
fn murmur3_32(key: u32, seed: u32) -> u32 {
    let mut k = key.wrapping_mul(0xcc9e_2d51);
    k = k.rotate_left(15);
    k = k.wrapping_mul(0x1b87_3593);

    let mut h = seed ^ k;
    h = h.rotate_left(13);
    h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);

    h ^= 4;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Deterministic map from (node, feature) to a slot and sign in a weight
/// array of fixed size. Collisions are accepted, never resolved; both
/// strategies are pure functions of (seed, node, feature) so the mapping
/// survives tree growth and model reloads without being persisted.
#[derive(Clone, Debug)]
pub enum FeatureHasher {
    Mask { seed: u32, mask: u32 },
    Murmur {
        seed: u32,
        hash_dim: usize,
        node_seeds: Vec<u32>,
    },
}

impl FeatureHasher {
    pub fn new(kind: HasherKind, seed: u32, hash_dim: usize, n_nodes: usize) -> Result<Self> {
        if hash_dim == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Hash dimension must be positive",
            ));
        }
        match kind {
            HasherKind::Mask => {
                if !hash_dim.is_power_of_two() {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!(
                            "Mask hasher needs a power-of-two hash dimension, got {}",
                            hash_dim
                        ),
                    ));
                }
                Ok(FeatureHasher::Mask {
                    seed,
                    mask: (hash_dim - 1) as u32,
                })
            }
            HasherKind::Murmur => {
                let mut hasher = FeatureHasher::Murmur {
                    seed,
                    hash_dim,
                    node_seeds: Vec::new(),
                };
                hasher.grow(n_nodes);
                Ok(hasher)
            }
        }
    }

    /// Allocate hash parameters for node ids up to `n_nodes`. Parameters for
    /// existing nodes are left untouched, so hashes computed before a tree
    /// split stay valid after it.
    pub fn grow(&mut self, n_nodes: usize) {
        if let FeatureHasher::Murmur {
            seed, node_seeds, ..
        } = self
        {
            for node in node_seeds.len()..n_nodes {
                node_seeds.push(murmur3_32(node as u32, *seed));
            }
        }
    }

    /// Weight-array slot for the given (node, feature) pair, in `[0, hash_dim)`.
    pub fn index(&self, node: usize, feature: Index) -> usize {
        match self {
            FeatureHasher::Mask { seed, mask } => {
                let node_seed = murmur3_32(node as u32, *seed);
                (murmur3_32(feature, node_seed) & mask) as usize
            }
            FeatureHasher::Murmur {
                hash_dim,
                node_seeds,
                ..
            } => murmur3_32(feature, node_seeds[node]) as usize % hash_dim,
        }
    }

    /// Sign (+1 or -1) for the given (node, feature) pair, drawn from hash
    /// bits independent of the slot choice.
    pub fn sign(&self, node: usize, feature: Index) -> Value {
        let node_seed = match self {
            FeatureHasher::Mask { seed, .. } => murmur3_32(node as u32, *seed),
            FeatureHasher::Murmur { node_seeds, .. } => node_seeds[node],
        };
        if murmur3_32(feature, node_seed ^ SIGN_SALT) & 1 == 0 {
            1.
        } else {
            -1.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashes_are_deterministic_and_in_range() {
        for &kind in &[HasherKind::Mask, HasherKind::Murmur] {
            let hash_dim = if kind == HasherKind::Mask { 1024 } else { 1000 };
            let hasher = FeatureHasher::new(kind, 1, hash_dim, 20).unwrap();
            let again = FeatureHasher::new(kind, 1, hash_dim, 20).unwrap();
            for node in 0..20 {
                for feature in 0..100 {
                    let slot = hasher.index(node, feature);
                    assert!(slot < hash_dim);
                    assert_eq!(slot, again.index(node, feature));
                    let sign = hasher.sign(node, feature);
                    assert!(sign == 1. || sign == -1.);
                    assert_eq!(sign, again.sign(node, feature));
                }
            }
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = FeatureHasher::new(HasherKind::Murmur, 1, 1 << 20, 5).unwrap();
        let b = FeatureHasher::new(HasherKind::Murmur, 2, 1 << 20, 5).unwrap();
        let differs = (0..100).any(|f| a.index(3, f) != b.index(3, f));
        assert!(differs);
    }

    #[test]
    fn test_mask_requires_power_of_two() {
        assert!(FeatureHasher::new(HasherKind::Mask, 1, 1000, 5).is_err());
        assert!(FeatureHasher::new(HasherKind::Mask, 1, 1024, 5).is_ok());
        assert!(FeatureHasher::new(HasherKind::Murmur, 1, 1000, 5).is_ok());
        assert!(FeatureHasher::new(HasherKind::Mask, 1, 0, 5).is_err());
    }

    #[test]
    fn test_growth_preserves_existing_hashes() {
        let mut hasher = FeatureHasher::new(HasherKind::Murmur, 7, 4096, 3).unwrap();
        let before: Vec<(usize, Value)> = (0..3)
            .flat_map(|node| (0..50).map(move |f| (node, f)))
            .map(|(node, f)| (hasher.index(node, f), hasher.sign(node, f)))
            .collect();

        hasher.grow(10);

        let after: Vec<(usize, Value)> = (0..3)
            .flat_map(|node| (0..50).map(move |f| (node, f)))
            .map(|(node, f)| (hasher.index(node, f), hasher.sign(node, f)))
            .collect();
        assert_eq!(before, after);

        // New nodes are usable and re-derivable from the seed alone
        let fresh = FeatureHasher::new(HasherKind::Murmur, 7, 4096, 10).unwrap();
        for f in 0..50 {
            assert_eq!(fresh.index(9, f), hasher.index(9, f));
        }
    }
}
