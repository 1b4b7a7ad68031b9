use super::*;

use crate::common::match_any;

use serde::de::{Deserializer, Error as _, MapAccess, Visitor};

use std::fmt;

fn enabled() -> bool {
    true
}

/// A scrape instance. There may be any number of these.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prometheus {
    // an instance without an endpoint is reported and skipped at startup
    #[serde(default)]
    metric_endpoint: String,

    #[serde(default)]
    remove_hostname: bool,

    #[serde(default)]
    default_dimensions: Dimensions,

    #[serde(default, deserialize_with = "derived_metrics")]
    derived_metrics: Vec<DerivedMetric>,

    #[serde(default)]
    whitelist: Vec<String>,

    #[serde(default)]
    label_whitelist: Vec<String>,

    #[serde(default = "enabled")]
    counters_to_rates: bool,

    #[serde(default)]
    timeout: Option<String>,
}

impl Prometheus {
    pub fn check(&self) -> Result<(), String> {
        if let Some(timeout) = &self.timeout {
            duration("prometheus.timeout", timeout)?;
        }

        match_any(&self.whitelist).map_err(|e| format!("invalid whitelist: {e}"))?;

        if self.label_whitelist.iter().any(|label| label.is_empty()) {
            return Err("label_whitelist entries must not be empty".into());
        }

        Ok(())
    }

    pub fn metric_endpoint(&self) -> &str {
        &self.metric_endpoint
    }

    pub fn remove_hostname(&self) -> bool {
        self.remove_hostname
    }

    pub fn default_dimensions(&self) -> &Dimensions {
        &self.default_dimensions
    }

    pub fn derived_metrics(&self) -> &[DerivedMetric] {
        &self.derived_metrics
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }

    pub fn label_whitelist(&self) -> &[String] {
        &self.label_whitelist
    }

    pub fn counters_to_rates(&self) -> bool {
        self.counters_to_rates
    }

    /// The instance timeout, if one was configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|t| duration("prometheus.timeout", t).ok())
    }
}

/// A metric computed from scraped series after they are loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct DerivedMetric {
    pub name: String,
    pub operation: Operation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// `x / y` for every pair of samples with identical labels
    Divide { x: String, y: String },
    /// Total of all samples of `series` once the `key` label is removed
    Sum { series: String, key: String },
    /// Copy `series` as a counter, or reclassify it when the names match
    Counter { series: String },
    Unsupported(String),
}

// Derived metrics may be written as a TOML table or as a YAML document held in
// a string, as older agent configurations do. Both end up as the same list.
#[derive(Deserialize)]
#[serde(untagged)]
enum DerivedMetricsSource {
    Text(String),
    Table(Declared),
}

/// Table entries in the order they are written, so a derived metric can use
/// any declared before it.
struct Declared(Vec<(String, RawDerivedMetric)>);

impl<'de> Deserialize<'de> for Declared {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DeclaredVisitor;

        impl<'de> Visitor<'de> for DeclaredVisitor {
            type Value = Declared;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of derived metrics")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Declared, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, RawDerivedMetric>()? {
                    entries.push(entry);
                }
                Ok(Declared(entries))
            }
        }

        deserializer.deserialize_map(DeclaredVisitor)
    }
}

#[derive(Deserialize)]
struct RawDerivedMetric {
    #[serde(alias = "opp")]
    op: String,
    x: Option<String>,
    y: Option<String>,
    series: Option<String>,
    key: Option<String>,
}

impl RawDerivedMetric {
    fn normalize(self, name: String) -> Result<DerivedMetric, String> {
        let required = |value: Option<String>, param: &str| {
            value.ok_or_else(|| format!("derived metric {name}: {} requires '{param}'", self.op))
        };

        let operation = match self.op.as_str() {
            "divide" => Operation::Divide {
                x: required(self.x.clone(), "x")?,
                y: required(self.y.clone(), "y")?,
            },
            "sum" => Operation::Sum {
                series: required(self.series.clone(), "series")?,
                key: required(self.key.clone(), "key")?,
            },
            "counter" => Operation::Counter {
                series: required(self.series.clone(), "series")?,
            },
            _ => Operation::Unsupported(self.op.clone()),
        };

        Ok(DerivedMetric { name, operation })
    }
}

fn derived_metrics<'de, D>(deserializer: D) -> Result<Vec<DerivedMetric>, D::Error>
where
    D: Deserializer<'de>,
{
    let Declared(entries) = match DerivedMetricsSource::deserialize(deserializer)? {
        DerivedMetricsSource::Text(text) if text.trim().is_empty() => Declared(Vec::new()),
        DerivedMetricsSource::Text(text) => serde_yaml::from_str(&text)
            .map_err(|e| D::Error::custom(format!("invalid derived_metrics: {e}")))?,
        DerivedMetricsSource::Table(table) => table,
    };

    entries
        .into_iter()
        .map(|(name, raw)| raw.normalize(name).map_err(D::Error::custom))
        .collect()
}
