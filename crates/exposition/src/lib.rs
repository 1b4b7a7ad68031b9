//! Prometheus text exposition, grouped into metric families.
//!
//! Line parsing is done by `prometheus-parse`. This crate regroups its
//! samples into families and flattens histograms and summaries back into the
//! samples they were written as:
//!
//! - counter, gauge, untyped: `<name>`
//! - summary: `<name>` with a `quantile` label, `<name>_count`, `<name>_sum`
//! - histogram: `<name>_bucket` with an `le` label, `<name>_count`, `<name>_sum`
//!
//! Counter families are normalized so the family name never carries the
//! `_total` suffix and every counter sample name does.
//!
//! A line that is neither a comment nor a sample with a numeric value fails
//! the whole document.

use prometheus_parse::{LineInfo, SampleType, Scrape, Value};

use std::collections::HashMap;
use std::fmt;

const TOTAL_SUFFIX: &str = "_total";
const BUCKET_SUFFIX: &str = "_bucket";
const SUFFIXES: [&str; 3] = [BUCKET_SUFFIX, "_count", "_sum"];

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read exposition text: {0}")]
    Read(#[from] std::io::Error),
    #[error("line {line}: malformed sample: {text}")]
    Malformed { line: usize, text: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricType,
    pub samples: Vec<Sample>,
}

/// Parse a complete exposition document into metric families, in the order
/// their first sample appears.
pub fn parse(text: &str) -> Result<Vec<MetricFamily>, ParseError> {
    validate(text)?;

    let grouped = grouped_types(text);
    let scrape = Scrape::parse(text.lines().map(|line| Ok(line.to_string())))?;

    let mut families = Families::new(&scrape.docs);

    // histograms and summaries are collected by the parser and come last, in
    // no particular order
    let (mut aggregated, plain): (Vec<_>, Vec<_>) = scrape
        .samples
        .into_iter()
        .partition(|s| matches!(s.value, Value::Histogram(_) | Value::Summary(_)));
    aggregated.sort_by_cached_key(|s| (s.metric.clone(), sorted(&s.labels)));

    for sample in plain.into_iter().chain(aggregated) {
        let labels: HashMap<String, String> = sample
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match sample.value {
            Value::Counter(value) => {
                let family = sample
                    .metric
                    .strip_suffix(TOTAL_SUFFIX)
                    .unwrap_or(&sample.metric);
                let name = format!("{family}{TOTAL_SUFFIX}");
                families.push(family, MetricType::Counter, name, labels, value);
            }
            Value::Gauge(value) => {
                let name = sample.metric.clone();
                families.push(&sample.metric, MetricType::Gauge, name, labels, value);
            }
            Value::Untyped(value) => {
                let name = sample.metric.clone();
                match grouped_base(&sample.metric, &grouped) {
                    Some((base, kind)) => families.push(base, kind, name, labels, value),
                    None => families.push(&sample.metric, MetricType::Untyped, name, labels, value),
                }
            }
            Value::Histogram(counts) => {
                let base = sample
                    .metric
                    .strip_suffix(BUCKET_SUFFIX)
                    .unwrap_or(&sample.metric);
                let name = format!("{base}{BUCKET_SUFFIX}");
                for count in counts {
                    let mut labels = labels.clone();
                    labels.insert("le".into(), bound(count.less_than));
                    let name = name.clone();
                    families.push(base, MetricType::Histogram, name, labels, count.count);
                }
            }
            Value::Summary(counts) => {
                for count in counts {
                    let mut labels = labels.clone();
                    labels.insert("quantile".into(), bound(count.quantile));
                    let name = sample.metric.clone();
                    families.push(&sample.metric, MetricType::Summary, name, labels, count.count);
                }
            }
        }
    }

    Ok(families.finish())
}

/// The parser drops lines it cannot read, so report them here instead.
fn validate(text: &str) -> Result<(), ParseError> {
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match LineInfo::parse(line) {
            LineInfo::Sample { value, .. } if value.parse::<f64>().is_ok() => {}
            _ => {
                return Err(ParseError::Malformed {
                    line: index + 1,
                    text: trimmed.to_string(),
                })
            }
        }
    }

    Ok(())
}

/// Names declared as histograms or summaries. Their `_bucket`, `_count` and
/// `_sum` samples belong to the declared family.
fn grouped_types(text: &str) -> HashMap<String, MetricType> {
    let mut grouped = HashMap::new();

    for line in text.lines() {
        if let LineInfo::Type {
            metric_name,
            sample_type,
            ..
        } = LineInfo::parse(line)
        {
            let kind = match sample_type {
                SampleType::Histogram => MetricType::Histogram,
                SampleType::Summary => MetricType::Summary,
                _ => continue,
            };
            let name = metric_name
                .strip_suffix(BUCKET_SUFFIX)
                .unwrap_or(&metric_name)
                .to_string();
            grouped.insert(name, kind);
        }
    }

    grouped
}

fn grouped_base<'a>(
    metric: &'a str,
    grouped: &HashMap<String, MetricType>,
) -> Option<(&'a str, MetricType)> {
    SUFFIXES.iter().find_map(|suffix| {
        let base = metric.strip_suffix(suffix)?;
        grouped.get(base).map(|kind| (base, *kind))
    })
}

fn bound(value: f64) -> String {
    if value == f64::INFINITY {
        "+Inf".to_string()
    } else {
        value.to_string()
    }
}

fn sorted(labels: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<_> = labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.sort();
    pairs
}

/// Families indexed by name, kept in first-seen order.
struct Families<'a> {
    docs: &'a HashMap<String, String>,
    index: HashMap<String, usize>,
    families: Vec<MetricFamily>,
}

impl<'a> Families<'a> {
    fn new(docs: &'a HashMap<String, String>) -> Self {
        Self {
            docs,
            index: HashMap::new(),
            families: Vec::new(),
        }
    }

    fn push(
        &mut self,
        family: &str,
        kind: MetricType,
        name: String,
        labels: HashMap<String, String>,
        value: f64,
    ) {
        let position = match self.index.get(family) {
            Some(position) => *position,
            None => {
                let help = self
                    .docs
                    .get(family)
                    .or_else(|| self.docs.get(&name))
                    .cloned()
                    .unwrap_or_default();
                self.families.push(MetricFamily {
                    name: family.to_string(),
                    help,
                    kind,
                    samples: Vec::new(),
                });
                self.index.insert(family.to_string(), self.families.len() - 1);
                self.families.len() - 1
            }
        };

        self.families[position]
            .samples
            .push(Sample { name, labels, value });
    }

    fn finish(self) -> Vec<MetricFamily> {
        self.families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_document() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n\n  \n").unwrap().is_empty());
        assert!(parse("# HELP lonely nothing here\n").unwrap().is_empty());
    }

    #[test]
    fn test_gauge_family() {
        let text = "# HELP mem_free Free memory\n\
                    # TYPE mem_free gauge\n\
                    mem_free{host=\"a\"} 12\n\
                    mem_free{host=\"b\"} 13.5 1395066363000\n";
        let families = parse(text).unwrap();
        assert_eq!(families.len(), 1);

        let family = &families[0];
        assert_eq!(family.name, "mem_free");
        assert_eq!(family.help, "Free memory");
        assert_eq!(family.kind, MetricType::Gauge);
        assert_eq!(family.samples.len(), 2);
        assert_eq!(family.samples[0].labels, labels(&[("host", "a")]));
        assert_eq!(family.samples[0].value, 12.0);
        assert_eq!(family.samples[1].value, 13.5);
    }

    #[test]
    fn test_counter_total_family_name_is_stripped() {
        let text = "# TYPE http_requests_total counter\n\
                    http_requests_total{code=\"200\"} 1027\n";
        let families = parse(text).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "http_requests");
        assert_eq!(families[0].kind, MetricType::Counter);
        assert_eq!(families[0].samples[0].name, "http_requests_total");
        assert_eq!(families[0].samples[0].value, 1027.0);
    }

    #[test]
    fn test_counter_samples_gain_total_suffix() {
        let text = "# TYPE ceph_osd_op counter\nceph_osd_op{osd=\"0\"} 5\n";
        let families = parse(text).unwrap();
        assert_eq!(families[0].name, "ceph_osd_op");
        assert_eq!(families[0].samples[0].name, "ceph_osd_op_total");
    }

    #[test]
    fn test_histogram_flattened() {
        let text = "# TYPE latency histogram\n\
                    latency_bucket{le=\"0.1\"} 1\n\
                    latency_bucket{le=\"+Inf\"} 3\n\
                    latency_sum 0.7\n\
                    latency_count 3\n";
        let families = parse(text).unwrap();
        assert_eq!(families.len(), 1);

        let family = &families[0];
        assert_eq!(family.name, "latency");
        assert_eq!(family.kind, MetricType::Histogram);
        assert_eq!(family.samples.len(), 4);

        let bucket = |le: &str| {
            family
                .samples
                .iter()
                .find(|s| s.name == "latency_bucket" && s.labels == labels(&[("le", le)]))
                .map(|s| s.value)
        };
        assert_eq!(bucket("0.1"), Some(1.0));
        assert_eq!(bucket("+Inf"), Some(3.0));

        let sum = family.samples.iter().find(|s| s.name == "latency_sum");
        assert_eq!(sum.map(|s| s.value), Some(0.7));
        assert!(family.samples.iter().any(|s| s.name == "latency_count"));
    }

    #[test]
    fn test_summary_flattened() {
        let text = "# TYPE rpc summary\n\
                    rpc{quantile=\"0.5\"} 4\n\
                    rpc_sum 10\n\
                    rpc_count 2\n";
        let families = parse(text).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].kind, MetricType::Summary);
        assert_eq!(families[0].samples.len(), 3);

        let quantile = families[0]
            .samples
            .iter()
            .find(|s| s.name == "rpc")
            .unwrap();
        assert_eq!(quantile.labels, labels(&[("quantile", "0.5")]));
        assert_eq!(quantile.value, 4.0);
    }

    #[test]
    fn test_untyped_samples_without_directives() {
        let families = parse("a 1\nb 2\na 3\n").unwrap();
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].name, "a");
        assert_eq!(families[0].kind, MetricType::Untyped);
        assert_eq!(families[0].samples.len(), 2);
        assert_eq!(families[1].samples[0].value, 2.0);
    }

    #[test]
    fn test_comments_ignored() {
        let families = parse("# just a comment\n#another\n# TYPE up gauge\nup 1\n").unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].kind, MetricType::Gauge);
        assert_eq!(families[0].samples[0].value, 1.0);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse("up 1\nbroken{a=\"b\" 1\n"),
            Err(ParseError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            parse("load one\n"),
            Err(ParseError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            parse("missing_value\n"),
            Err(ParseError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_special_values() {
        let families = parse("a NaN\nb +Inf\nc -Inf\n").unwrap();
        assert_eq!(families.len(), 3);
        assert!(families[0].samples[0].value.is_nan());
        assert_eq!(families[1].samples[0].value, f64::INFINITY);
        assert_eq!(families[2].samples[0].value, f64::NEG_INFINITY);
    }
}
