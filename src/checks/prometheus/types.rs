use std::collections::HashMap;
use std::hash::{Hash, Hasher};

pub use exposition::MetricType;

/// Suffix marking a metric as a monotonic total
pub const TOTAL_SUFFIX: &str = "_total";

pub type Labels = HashMap<String, String>;

/// A single scraped or derived observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Labels,
    pub value: f64,
}

/// All samples sharing a metric name.
#[derive(Debug, Clone)]
pub struct Series {
    pub name: String,
    pub kind: MetricType,
    pub samples: Vec<Sample>,
}

/// A filtered sample ready to be handed to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMetric {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub kind: MetricType,
}

impl OutputMetric {
    /// Counters and anything named like a total are reported as rates.
    pub fn is_counter_like(&self) -> bool {
        self.kind == MetricType::Counter || self.name.ends_with(TOTAL_SUFFIX)
    }
}

/// Hash a label set deterministically by sorting keys.
pub fn hash_labels(labels: &Labels) -> u64 {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();

    // Sort keys for deterministic hashing
    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort_by_key(|(k, _)| *k);

    for (k, v) in pairs {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }

    hasher.finish()
}
