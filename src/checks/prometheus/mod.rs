//! Scrapes a Prometheus text endpoint, derives additional metrics from the
//! scraped series and reports everything that passes the whitelists.

use super::*;
use crate::common::HOSTNAME;
use crate::trace;
use crate::config::{DerivedMetric, Prometheus as PrometheusConfig};

use exposition::MetricFamily;
use linkme::distributed_slice;
use reqwest::header::CONTENT_TYPE;

mod derived;
mod store;
mod types;

use store::MetricStore;
use types::{Labels, OutputMetric};

const NAME: &str = "prometheus";
const RATE_SUFFIX: &str = "_rate";
const CONTENT_TYPE_FAMILY: &str = "text/plain";

#[distributed_slice(CHECKS)]
fn init(config: Arc<Config>) -> CheckResult {
    let mut checks: Vec<Box<dyn Check>> = Vec::new();

    for instance in config.prometheus() {
        if instance.metric_endpoint().is_empty() {
            error!("metric_endpoint must be defined for each prometheus instance");
            continue;
        }

        checks.push(Box::new(Prometheus::new(&config, instance)?));
    }

    config.enabled(NAME, !checks.is_empty());

    Ok(checks)
}

struct Prometheus {
    client: reqwest::Client,
    endpoint: String,
    dimensions: Dimensions,
    derived_metrics: Vec<DerivedMetric>,
    whitelist: Vec<String>,
    label_whitelist: Vec<String>,
    counters_to_rates: bool,
}

impl Prometheus {
    fn new(config: &Config, instance: &PrometheusConfig) -> anyhow::Result<Self> {
        let timeout = instance
            .timeout()
            .unwrap_or_else(|| config.general().timeout());

        let client = reqwest::Client::builder()
            .http1_only()
            .timeout(timeout)
            .build()?;

        let mut dimensions = config.dimensions();
        if instance.remove_hostname() {
            dimensions.remove(HOSTNAME);
        }
        dimensions.extend(
            instance
                .default_dimensions()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Ok(Self {
            client,
            endpoint: instance.metric_endpoint().to_string(),
            dimensions,
            derived_metrics: instance.derived_metrics().to_vec(),
            whitelist: instance.whitelist().to_vec(),
            label_whitelist: instance.label_whitelist().to_vec(),
            counters_to_rates: instance.counters_to_rates(),
        })
    }

    async fn fetch(&self) -> Result<String, CheckError> {
        let fetch_error = |source| CheckError::Fetch {
            endpoint: self.endpoint.clone(),
            source,
        };

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(fetch_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::Status {
                endpoint: self.endpoint.clone(),
                status,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !content_type.contains(CONTENT_TYPE_FAMILY) {
            return Err(CheckError::ContentType {
                endpoint: self.endpoint.clone(),
                content_type,
            });
        }

        response.text().await.map_err(fetch_error)
    }

    /// Turn one scrape into measurements.
    fn process(&self, text: &str, sink: &mut dyn Sink) -> Result<(), CheckError> {
        let parse_error = |reason: String| CheckError::Parse {
            endpoint: self.endpoint.clone(),
            reason,
        };

        let families = exposition::parse(text).map_err(|e| parse_error(e.to_string()))?;

        let mut store = MetricStore::new(&self.whitelist, &self.label_whitelist)
            .map_err(|e| parse_error(format!("invalid whitelist: {e}")))?;

        load(&mut store, families);

        if store.is_empty() {
            debug!("no samples from {}", self.endpoint);
            return Ok(());
        }
        trace!("loaded {} series from {}", store.len(), self.endpoint);

        derived::compute(&mut store, &self.derived_metrics);

        for metric in store.get_metrics() {
            self.report(metric, sink);
        }

        Ok(())
    }

    /// Send a metric to the sink. Counter-like metrics go out as rates when
    /// `counters_to_rates` is set.
    fn report(&self, metric: OutputMetric, sink: &mut dyn Sink) {
        let rate = self.counters_to_rates && metric.is_counter_like();

        let mut dimensions = metric.labels;
        dimensions.extend(self.dimensions.iter().map(|(k, v)| (k.clone(), v.clone())));

        if rate {
            let name = format!("{}{RATE_SUFFIX}", metric.name);
            sink.rate(Measurement::new(name, metric.value, dimensions));
        } else {
            sink.gauge(Measurement::new(metric.name, metric.value, dimensions));
        }
    }
}

/// Load parsed families into the store. Non-finite values and labels with
/// empty values are dropped.
fn load(store: &mut MetricStore, families: Vec<MetricFamily>) {
    for family in families {
        for sample in family.samples {
            if !sample.value.is_finite() {
                trace!("skipping {} with non-finite value {}", sample.name, sample.value);
                continue;
            }

            let labels: Labels = sample
                .labels
                .into_iter()
                .filter(|(_, v)| !v.is_empty())
                .collect();

            store.add_sample(&sample.name, family.kind, sample.value, labels);
        }
    }
}

#[async_trait]
impl Check for Prometheus {
    fn name(&self) -> &str {
        NAME
    }

    async fn check(&self, sink: &mut dyn Sink) -> Result<(), CheckError> {
        let text = self.fetch().await?;
        self.process(&text, sink)
    }
}
