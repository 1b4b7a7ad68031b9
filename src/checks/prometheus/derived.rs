use super::store::MetricStore;
use super::types::{hash_labels, MetricType, Sample};
use crate::config::{DerivedMetric, Operation};
use crate::{debug, warn};

use std::collections::{HashMap, HashSet};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DerivedError {
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("could not look up type for {0}, does the metric exist?")]
    MissingSeries(String),
    #[error("types of {x} ({x_kind}) and {y} ({y_kind}) do not match")]
    TypeMismatch {
        x: String,
        x_kind: MetricType,
        y: String,
        y_kind: MetricType,
    },
    #[error("more than one sample with {key}={value}")]
    DuplicateKey { key: String, value: String },
    #[error("a sample is missing the {0} label")]
    MissingKey(String),
    #[error("sample labels are not all fixed with respect to {0}")]
    LabelMismatch(String),
}

/// Evaluate each derived metric against the store, adding the results to it.
/// A failing derived metric is logged and skipped.
pub fn compute(store: &mut MetricStore, derived: &[DerivedMetric]) {
    for metric in derived {
        let result = match &metric.operation {
            Operation::Divide { x, y } => divide(store, &metric.name, x, y),
            Operation::Sum { series, key } => sum(store, &metric.name, series, key),
            Operation::Counter { series } => counter(store, &metric.name, series),
            Operation::Unsupported(op) => Err(DerivedError::Unsupported(op.clone())),
        };

        match result {
            Ok(added) => debug!("derived metric {}: {added} samples", metric.name),
            Err(e) => warn!("skipping derived metric {}: {e}", metric.name),
        }
    }
}

/// Index samples by label set. A later sample with the same labels replaces
/// an earlier one but keeps its position.
fn index_by_labels(samples: &[Sample]) -> (Vec<u64>, HashMap<u64, &Sample>) {
    let mut order = Vec::new();
    let mut index = HashMap::new();

    for sample in samples {
        let hash = hash_labels(&sample.labels);
        if index.insert(hash, sample).is_none() {
            order.push(hash);
        }
    }

    (order, index)
}

/// Divide `x` by `y`, pairing samples with identical label sets.
pub fn divide(store: &mut MetricStore, name: &str, x: &str, y: &str) -> Result<usize, DerivedError> {
    let x_kind = store
        .get_type(x)
        .ok_or_else(|| DerivedError::MissingSeries(x.to_string()))?;
    let y_kind = store
        .get_type(y)
        .ok_or_else(|| DerivedError::MissingSeries(y.to_string()))?;

    if x_kind != y_kind {
        return Err(DerivedError::TypeMismatch {
            x: x.to_string(),
            x_kind,
            y: y.to_string(),
            y_kind,
        });
    }

    let (order, x_index) = index_by_labels(store.get_samples(x));
    let (_, y_index) = index_by_labels(store.get_samples(y));

    let mut quotients = Vec::new();

    for hash in order {
        let numerator = x_index[&hash];
        let denominator = match y_index.get(&hash) {
            Some(s) if s.labels == numerator.labels => s,
            _ => continue,
        };

        if denominator.value == 0.0 {
            warn!("{name}: {y} is zero for {:?}, skipping", numerator.labels);
            continue;
        }

        quotients.push(Sample {
            labels: numerator.labels.clone(),
            value: numerator.value / denominator.value,
        });
    }

    let mut added = 0;
    for sample in quotients {
        if store.add_sample(name, x_kind, sample.value, sample.labels) {
            added += 1;
        }
    }

    Ok(added)
}

/// Sum every sample of `series` into one, removing the `key` label. Samples
/// without labels are skipped.
pub fn sum(store: &mut MetricStore, name: &str, series: &str, key: &str) -> Result<usize, DerivedError> {
    let kind = match store.get_type(series) {
        Some(kind) => kind,
        None => return Ok(0),
    };

    let mut seen = HashSet::new();
    let mut common = None;
    let mut total = 0.0;

    for sample in store.get_samples(series) {
        if sample.labels.is_empty() {
            debug!("{name}: ignoring sample of {series} without labels");
            continue;
        }

        let mut labels = sample.labels.clone();
        let value = labels
            .remove(key)
            .ok_or_else(|| DerivedError::MissingKey(key.to_string()))?;

        if !seen.insert(value.clone()) {
            return Err(DerivedError::DuplicateKey {
                key: key.to_string(),
                value,
            });
        }

        match &common {
            Some(existing) if *existing != labels => {
                return Err(DerivedError::LabelMismatch(key.to_string()))
            }
            Some(_) => {}
            None => common = Some(labels),
        }

        total += sample.value;
    }

    // a series of unlabelled samples still yields a zero total
    let labels = common.unwrap_or_default();
    Ok(store.add_sample(name, kind, total, labels) as usize)
}

/// Copy `series` into a counter named `name`. When the names are the same the
/// series is reclassified in place instead.
pub fn counter(store: &mut MetricStore, name: &str, series: &str) -> Result<usize, DerivedError> {
    if name == series {
        store.set_type(series, MetricType::Counter);
        return Ok(0);
    }

    let samples = store.get_samples(series).to_vec();

    let mut added = 0;
    for sample in samples {
        if store.add_sample(name, MetricType::Counter, sample.value, sample.labels) {
            added += 1;
        }
    }

    Ok(added)
}
