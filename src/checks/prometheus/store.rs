use super::types::{Labels, MetricType, OutputMetric, Sample, Series};
use crate::common::match_any;
use crate::trace;

use regex::Regex;

use std::collections::{HashMap, HashSet};

/// Samples gathered during one collection cycle, grouped into series by
/// metric name. Series keep the order in which they were first seen.
pub struct MetricStore {
    series: Vec<Series>,
    index: HashMap<String, usize>,
    whitelist: Option<Regex>,
    label_whitelist: Option<HashSet<String>>,
}

impl MetricStore {
    /// Creates an empty store. Metric names must match one of the
    /// `whitelist` patterns, anchored at the start, to be reported. When
    /// `label_whitelist` is non-empty only those labels are reported.
    pub fn new(whitelist: &[String], label_whitelist: &[String]) -> Result<Self, regex::Error> {
        let label_whitelist = if label_whitelist.is_empty() {
            None
        } else {
            Some(label_whitelist.iter().cloned().collect())
        };

        Ok(Self {
            series: Vec::new(),
            index: HashMap::new(),
            whitelist: match_any(whitelist)?,
            label_whitelist,
        })
    }

    /// Append a sample to the named series, creating it if needed. The series
    /// takes the type of the most recent sample. Returns false if the value
    /// was rejected.
    pub fn add_sample(&mut self, name: &str, kind: MetricType, value: f64, labels: Labels) -> bool {
        if value.is_nan() {
            trace!("rejected NaN sample for {name}");
            return false;
        }

        let idx = match self.index.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.series.len();
                self.index.insert(name.to_string(), idx);
                self.series.push(Series {
                    name: name.to_string(),
                    kind,
                    samples: Vec::new(),
                });
                idx
            }
        };

        let series = &mut self.series[idx];
        series.kind = kind;
        series.samples.push(Sample { labels, value });
        true
    }

    pub fn get_samples(&self, name: &str) -> &[Sample] {
        self.index
            .get(name)
            .map(|&idx| self.series[idx].samples.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_type(&self, name: &str) -> Option<MetricType> {
        self.index.get(name).map(|&idx| self.series[idx].kind)
    }

    /// Change the type of an existing series. Unknown names are ignored.
    pub fn set_type(&mut self, name: &str, kind: MetricType) {
        if let Some(&idx) = self.index.get(name) {
            self.series[idx].kind = kind;
        }
    }

    /// Every sample of every whitelisted series, with labels restricted to
    /// the label whitelist.
    pub fn get_metrics(&self) -> Vec<OutputMetric> {
        let mut metrics = Vec::new();

        for series in &self.series {
            if let Some(whitelist) = &self.whitelist {
                if !whitelist.is_match(&series.name) {
                    continue;
                }
            }

            for sample in &series.samples {
                let labels = match &self.label_whitelist {
                    Some(allowed) => sample
                        .labels
                        .iter()
                        .filter(|(k, _)| allowed.contains(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    None => sample.labels.clone(),
                };

                metrics.push(OutputMetric {
                    name: series.name.clone(),
                    value: sample.value,
                    labels,
                    kind: series.kind,
                });
            }
        }

        metrics
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
