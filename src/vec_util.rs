use crate::{Index, Value};
use std::ops::{Deref, DerefMut};

pub trait IndexValuePairs: Deref<Target = [(Index, Value)]> {
    fn is_valid_sparse_vec(&self, length: usize) -> bool {
        // If empty, always valid
        if self.is_empty() {
            return true;
        }
        // Check if:
        // - All indices are smaller than max index
        // - Pairs are sorted by indices
        // - There are no duplicate indices
        if self[0].0 as usize >= length {
            return false;
        }
        if self.len() > 1 {
            for ((i, _), (j, _)) in self.iter().skip(1).zip(self.iter()) {
                if *i as usize >= length || i <= j {
                    return false;
                }
            }
        }

        true
    }
}

impl<PairsT> IndexValuePairs for PairsT where PairsT: Deref<Target = [(Index, Value)]> {}

pub trait IndexValuePairsMut: DerefMut<Target = [(Index, Value)]> {
    fn sort_by_index(&mut self) {
        self.sort_unstable_by(|l, r| l.0.cmp(&r.0));
    }
}

impl<PairsT> IndexValuePairsMut for PairsT where PairsT: DerefMut<Target = [(Index, Value)]> {}
