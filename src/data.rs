use crate::vec_util::*;
use crate::{Index, IndexSet, IndexValueVec, Value};
use itertools::Itertools;
use log::info;
use rayon::prelude::*;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;

/// A single multi-label example: a sparse feature vector plus the set of true labels.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub features: IndexValueVec,
    pub labels: IndexSet,
}

/// A training dataset loaded in memory.
#[derive(Clone)]
pub struct DataSet {
    pub n_features: usize,
    pub n_labels: usize,
    pub instances: Vec<Instance>,
}

/// Parse a line in a data file from the Extreme Classification Repository
///
/// The line should be in the following format:
/// label1,label2,...labelk ft1:ft1_val ft2:ft2_val ft3:ft3_val .. ftd:ftd_val
fn parse_xc_repo_data_line(line: &str, n_features: usize) -> Result<Instance> {
    let mut token_iter = line.split(' ');

    let mut labels = IndexSet::new();
    {
        let labels_str = token_iter.next().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Failed to find labels in line: \"{}\"", line),
            )
        })?;
        for label_str in labels_str.split(',') {
            if !label_str.is_empty() {
                labels.insert(label_str.parse::<Index>().map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse label {} in line \"{}\"", label_str, line),
                    )
                })?);
            }
        }
        labels.shrink_to_fit();
    }

    let mut features = Vec::new();
    {
        for feature_value_pair_str in token_iter {
            let mut feature_value_pair_iter = feature_value_pair_str.split(':');
            let feature = feature_value_pair_iter
                .next()
                .and_then(|s| s.parse::<Index>().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse feature {}", feature_value_pair_str),
                    )
                })?;
            let value = feature_value_pair_iter
                .next()
                .and_then(|s| s.parse::<Value>().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse feature value {}", feature_value_pair_str),
                    )
                })?;
            if feature_value_pair_iter.next().is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Failed to parse feature {}", feature_value_pair_str),
                ));
            }
            features.push((feature, value));
        }
        features.sort_by_index();
        if !features.is_valid_sparse_vec(n_features) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Feature vector is invalid in line {}", line),
            ));
        }
    }

    Ok(Instance { features, labels })
}

impl DataSet {
    /// Load a data file from the Extreme Classification Repository
    pub fn load_xc_repo_data_file(path: impl AsRef<Path>) -> Result<Self> {
        info!("Loading data from {}", path.as_ref().display());
        let start_t = time::precise_time_s();

        let file_content = fs::read_to_string(path)?;
        info!("Parsing data");
        let lines: Vec<&str> = file_content.par_lines().collect();
        let (n_examples, n_features, n_labels) = {
            let header = lines
                .first()
                .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Data file is empty"))?;
            let tokens = header.split_whitespace().collect_vec();
            if tokens.len() != 3 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "Expect header line with 3 space-separated tokens, found {} instead",
                        tokens.len()
                    ),
                ));
            }

            let n_examples = tokens[0].parse::<usize>().map_err(|_| {
                Error::new(ErrorKind::InvalidData, "Failed to parse number of examples")
            })?;
            let n_features = tokens[1].parse::<usize>().map_err(|_| {
                Error::new(ErrorKind::InvalidData, "Failed to parse number of features")
            })?;
            let n_labels = tokens[2].parse::<usize>().map_err(|_| {
                Error::new(ErrorKind::InvalidData, "Failed to parse number of labels")
            })?;

            (n_examples, n_features, n_labels)
        };

        let instances: Vec<Instance> = lines
            .into_par_iter()
            .skip(1)
            .map(|line| parse_xc_repo_data_line(line, n_features))
            .collect::<Result<_>>()?;

        if n_examples != instances.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Expected {} examples, but read {}", n_examples, instances.len()),
            ));
        }

        info!(
            "Loaded {} examples; it took {:.2}s",
            n_examples,
            time::precise_time_s() - start_t
        );
        Ok(Self {
            n_features,
            n_labels,
            instances,
        })
    }

    /// Count occurrences of each label in [0, n_labels); used for Huffman tree building.
    pub fn label_frequencies(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.n_labels];
        for instance in &self.instances {
            for &label in &instance.labels {
                if (label as usize) < counts.len() {
                    counts[label as usize] += 1;
                }
            }
        }
        counts
    }

    /// Distinct labels appearing in the dataset, in ascending order.
    pub fn distinct_labels(&self) -> Vec<Index> {
        self.instances
            .iter()
            .flat_map(|instance| instance.labels.iter().cloned())
            .unique()
            .sorted()
            .collect_vec()
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            dataset: self,
            position: 0,
        }
    }
}

/// Sequential read cursor over a dataset, resettable for multi-epoch training.
pub struct Cursor<'a> {
    dataset: &'a DataSet,
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn has_next(&self) -> bool {
        self.position < self.dataset.instances.len()
    }

    pub fn next_instance(&mut self) -> Option<&'a Instance> {
        let instance = self.dataset.instances.get(self.position);
        if instance.is_some() {
            self.position += 1;
        }
        instance
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn n_features(&self) -> usize {
        self.dataset.n_features
    }

    pub fn n_labels(&self) -> usize {
        self.dataset.n_labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_parse_xc_repo_data_line() {
        assert_eq!(
            Instance {
                features: vec![(21, 1.), (23, 2.), (24, 3.)],
                labels: IndexSet::from_iter(vec![11, 12]),
            },
            parse_xc_repo_data_line("11,12 21:1 23:2 24:3", 25).unwrap()
        );
        assert!(parse_xc_repo_data_line("11,12 21:1 21:2", 25).is_err());
        assert!(parse_xc_repo_data_line("11,12 26:1", 25).is_err());
    }

    #[test]
    fn test_load_rejects_empty_file() {
        let dir = std::env::temp_dir().join(format!("adaplt-data-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.txt");
        fs::write(&path, "").unwrap();
        assert!(DataSet::load_xc_repo_data_file(&path).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cursor() {
        let dataset = DataSet {
            n_features: 5,
            n_labels: 3,
            instances: vec![
                Instance {
                    features: vec![(0, 1.)],
                    labels: IndexSet::from_iter(vec![0]),
                },
                Instance {
                    features: vec![(1, 1.)],
                    labels: IndexSet::from_iter(vec![1, 2]),
                },
            ],
        };

        let mut cursor = dataset.cursor();
        assert!(cursor.has_next());
        assert_eq!(vec![(0, 1.)], cursor.next_instance().unwrap().features);
        assert_eq!(vec![(1, 1.)], cursor.next_instance().unwrap().features);
        assert!(!cursor.has_next());
        assert!(cursor.next_instance().is_none());
        cursor.reset();
        assert!(cursor.has_next());
    }

    #[test]
    fn test_label_frequencies() {
        let dataset = DataSet {
            n_features: 5,
            n_labels: 3,
            instances: vec![
                Instance {
                    features: vec![],
                    labels: IndexSet::from_iter(vec![0, 2]),
                },
                Instance {
                    features: vec![],
                    labels: IndexSet::from_iter(vec![2]),
                },
            ],
        };
        assert_eq!(vec![1, 0, 2], dataset.label_frequencies());
        assert_eq!(vec![0, 2], dataset.distinct_labels());
    }
}
