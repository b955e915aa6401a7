use super::ofo::instance_f1;
use super::Model;
use crate::util;
use crate::{DataSet, Index, Instance, Value};
use itertools::Itertools;
use log::info;
use rayon::prelude::*;
use std::sync::Mutex;

/// Predict top-k labels for every instance in parallel and report
/// precision@1..=k over the dataset.
pub fn test_all(
    model: &Model,
    dataset: &DataSet,
    k: usize,
) -> (Vec<Vec<(Index, Value)>>, Vec<Value>) {
    info!("Testing on {} examples", dataset.instances.len());
    let start_t = time::precise_time_s();

    let bar = Mutex::new(util::create_progress_bar(dataset.instances.len() as u64));
    let predictions: Vec<_> = dataset
        .instances
        .par_iter()
        .map(|instance| {
            let prediction = model.predict_top_k(&instance.features, k);
            bar.lock().unwrap().inc();
            prediction
        })
        .collect();
    bar.into_inner().unwrap().finish();

    let precisions = precision_at_k(k, &dataset.instances, &predictions);
    info!(
        "Precision@[1..={}]: {}",
        k,
        precisions.iter().map(|p| format!("{:.4}", p)).join(", ")
    );
    info!("Testing took {:.2}s", time::precise_time_s() - start_t);

    (predictions, precisions)
}

/// Average precision@k for each k in `1..=max_k`, treating ranks past the
/// end of a prediction as misses.
pub fn precision_at_k(
    max_k: usize,
    instances: &[Instance],
    predictions: &[Vec<(Index, Value)>],
) -> Vec<Value> {
    assert_eq!(instances.len(), predictions.len());
    let mut totals = vec![0.; max_k];
    for (instance, prediction) in instances.iter().zip(predictions) {
        let mut hits = 0usize;
        for k in 0..max_k {
            if let Some((label, _)) = prediction.get(k) {
                if instance.labels.contains(label) {
                    hits += 1;
                }
            }
            totals[k] += hits as Value / (k + 1) as Value;
        }
    }
    let n = instances.len().max(1) as Value;
    totals.into_iter().map(|total| total / n).collect()
}

/// Example-averaged F1 of the thresholded positive predictions.
pub fn example_f1(model: &Model, dataset: &DataSet) -> Value {
    if dataset.instances.is_empty() {
        return 0.;
    }
    let sum: Value = dataset
        .instances
        .par_iter()
        .map(|instance| {
            instance_f1(&model.predict_positive(&instance.features), &instance.labels)
        })
        .sum();
    sum / dataset.instances.len() as Value
}
