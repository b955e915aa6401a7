use crate::{Index, IndexSet, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Online F-measure optimization (OFO) over per-label counters.
///
/// Each tracked label keeps a numerator `a` (true positives plus seed) and a
/// denominator `b` (exposures plus seed); `a / b` is both the label's tuned
/// decision threshold and its running F-measure estimate. Counters are
/// map-backed so new labels can be accommodated as an adaptive tree grows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct OfoTuner {
    a: HashMap<Index, u64>,
    b: HashMap<Index, u64>,
    a_seed: u64,
    b_seed: u64,
}

impl OfoTuner {
    pub fn new(a_seed: u64, b_seed: u64) -> Self {
        assert!(a_seed > 0 && a_seed <= b_seed, "OFO seeds must satisfy 0 < a <= b");
        Self {
            a: HashMap::new(),
            b: HashMap::new(),
            a_seed,
            b_seed,
        }
    }

    pub fn with_labels(labels: impl IntoIterator<Item = Index>, a_seed: u64, b_seed: u64) -> Self {
        let mut tuner = Self::new(a_seed, b_seed);
        for label in labels {
            tuner.accommodate(label);
        }
        tuner
    }

    /// Seed counters for a label that just got its leaf.
    pub fn accommodate(&mut self, label: Index) {
        self.a.entry(label).or_insert(self.a_seed);
        self.b.entry(label).or_insert(self.b_seed);
    }

    pub fn is_tracked(&self, label: Index) -> bool {
        self.a.contains_key(&label)
    }

    pub fn n_labels(&self) -> usize {
        self.a.len()
    }

    pub fn threshold(&self, label: Index) -> Option<Value> {
        match (self.a.get(&label), self.b.get(&label)) {
            (Some(&a), Some(&b)) => Some(a as Value / b as Value),
            _ => None,
        }
    }

    /// Current thresholds for every tracked label.
    pub fn thresholds(&self) -> HashMap<Index, Value> {
        self.a
            .iter()
            .map(|(&label, &a)| (label, a as Value / b_of(&self.b, label)))
            .collect()
    }

    /// Consume a batch of (predicted positives, true positives) pairs and
    /// return the new thresholds for the labels whose counters moved.
    pub fn fit(&mut self, batch: &[(IndexSet, IndexSet)]) -> HashMap<Index, Value> {
        let mut affected = IndexSet::new();
        for (predicted, truth) in batch {
            for &label in predicted {
                if let Some(b) = self.b.get_mut(&label) {
                    *b += 1;
                    affected.insert(label);
                }
            }
            for &label in truth {
                // Labels without a leaf yet are skipped; growth accommodates
                // them before they ever reach prediction
                if let Some(b) = self.b.get_mut(&label) {
                    *b += 1;
                    affected.insert(label);
                    if predicted.contains(&label) {
                        *self.a.get_mut(&label).expect("a/b tracked together") += 1;
                    }
                }
            }
        }

        affected
            .into_iter()
            .map(|label| {
                (
                    label,
                    *self.a.get(&label).expect("affected labels are tracked") as Value
                        / b_of(&self.b, label),
                )
            })
            .collect()
    }

    /// Running macro-averaged F-measure over all tracked labels.
    pub fn macro_f1(&self) -> Value {
        macro_f1_of(&self.a, &self.b)
    }

    /// Macro F-measure as it would be after fitting the given batch, without
    /// committing any counter changes. Used by ensemble callers to decide
    /// whether a candidate model is worth keeping.
    pub fn hypothetical_macro_f1(&self, batch: &[(IndexSet, IndexSet)]) -> Value {
        let mut trial = self.clone();
        trial.fit(batch);
        macro_f1_of(&trial.a, &trial.b)
    }

    #[cfg(test)]
    pub fn counters(&self, label: Index) -> Option<(u64, u64)> {
        match (self.a.get(&label), self.b.get(&label)) {
            (Some(&a), Some(&b)) => Some((a, b)),
            _ => None,
        }
    }
}

fn b_of(b: &HashMap<Index, u64>, label: Index) -> Value {
    *b.get(&label).expect("a/b tracked together") as Value
}

fn macro_f1_of(a: &HashMap<Index, u64>, b: &HashMap<Index, u64>) -> Value {
    if a.is_empty() {
        return 0.;
    }
    let sum: Value = a
        .iter()
        .map(|(&label, &num)| num as Value / b_of(b, label))
        .sum();
    2. * sum / a.len() as Value
}

/// Instance-wise F-measure between a predicted and a true label set; 0 when
/// both are empty rather than a division error.
pub(crate) fn instance_f1(predicted: &IndexSet, truth: &IndexSet) -> Value {
    let denominator = predicted.len() + truth.len();
    if denominator == 0 {
        return 0.;
    }
    let intersection = predicted.intersection(truth).count();
    2. * intersection as Value / denominator as Value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn set(labels: &[Index]) -> IndexSet {
        IndexSet::from_iter(labels.iter().cloned())
    }

    #[test]
    fn test_seeded_thresholds() {
        let tuner = OfoTuner::with_labels(0..4, 100, 200);
        assert_eq!(4, tuner.n_labels());
        for label in 0..4 {
            assert_eq!(Some(0.5), tuner.threshold(label));
        }
        assert!(tuner.threshold(4).is_none());
    }

    #[test]
    fn test_fit_updates_counters() {
        let mut tuner = OfoTuner::with_labels(0..3, 1, 20);

        // Label 0: predicted and true; label 1: predicted only;
        // label 2: true only; label 7: untracked, ignored
        let changed = tuner.fit(&[(set(&[0, 1]), set(&[0, 2, 7]))]);

        assert_eq!(Some((2, 22)), tuner.counters(0));
        assert_eq!(Some((1, 21)), tuner.counters(1));
        assert_eq!(Some((1, 21)), tuner.counters(2));
        assert_eq!(3, changed.len());
        assert_eq!(Some(&(2. / 22.)), changed.get(&0));
        assert!(!tuner.is_tracked(7));
    }

    #[test]
    fn test_counter_invariant_holds_under_adversarial_batches() {
        let mut tuner = OfoTuner::with_labels(0..5, 1, 20);
        let batches: Vec<(IndexSet, IndexSet)> = vec![
            (set(&[0, 1, 2]), set(&[])),
            (set(&[]), set(&[0, 1, 2, 3, 4])),
            (set(&[4]), set(&[4])),
            (set(&[0]), set(&[1])),
        ];
        tuner.fit(&batches);
        for label in 0..5 {
            let (a, b) = tuner.counters(label).unwrap();
            assert!(0 < a && a <= b, "label {}: a={} b={}", label, a, b);
        }
    }

    #[test]
    fn test_macro_f1() {
        let tuner = OfoTuner::new(1, 20);
        assert_eq!(0., tuner.macro_f1());

        let mut tuner = OfoTuner::with_labels(0..2, 1, 20);
        // Each label starts at 1/20; macro F = 2 * mean(a/b)
        assert!((tuner.macro_f1() - 2. * (1. / 20.)).abs() < 1e-12);

        let before = tuner.macro_f1();
        let batch = vec![(set(&[0]), set(&[0]))];
        let hypothetical = tuner.hypothetical_macro_f1(&batch);
        // The dry run must not commit anything
        assert_eq!(before, tuner.macro_f1());

        tuner.fit(&batch);
        assert!((tuner.macro_f1() - hypothetical).abs() < 1e-12);
    }

    #[test]
    fn test_instance_f1() {
        assert_eq!(0., instance_f1(&set(&[]), &set(&[])));
        assert_eq!(0., instance_f1(&set(&[1]), &set(&[2])));
        assert_eq!(1., instance_f1(&set(&[1, 2]), &set(&[1, 2])));
        assert!((instance_f1(&set(&[1]), &set(&[1, 2])) - 2. / 3.).abs() < 1e-12);
    }
}
