use crate::common::exec::CommandError;
use crate::common::Dimensions;
use crate::config::Config;
use crate::sink::{Measurement, Sink};
use crate::{debug, error, info, warn};

use async_trait::async_trait;
use linkme::distributed_slice;

use std::sync::Arc;
use std::time::Duration;

mod nvidia;
mod prometheus;
mod slurm;

#[distributed_slice]
pub static CHECKS: [fn(config: Arc<Config>) -> CheckResult] = [..];

/// A collector producing measurements once per invocation.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, sink: &mut dyn Sink) -> Result<(), CheckError>;
}

pub type CheckResult = anyhow::Result<Vec<Box<dyn Check>>>;

/// Failures that abort a single check's cycle.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("could not get metrics from {endpoint}: {source}")]
    Fetch {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("unsupported content type from {endpoint}: {content_type}")]
    ContentType {
        endpoint: String,
        content_type: String,
    },
    #[error("error parsing data from {endpoint}: {reason}")]
    Parse { endpoint: String, reason: String },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("nvml: {0}")]
    Nvml(String),
}

/// Initialize every enabled check and run those selected, in registration
/// order. An empty selection runs all of them. Failures are logged and do
/// not stop the remaining checks.
pub async fn run(config: Arc<Config>, selected: &[String], sink: &mut dyn Sink) -> usize {
    let mut checks: Vec<Box<dyn Check>> = Vec::new();

    for init in CHECKS {
        match init(config.clone()) {
            Ok(initialized) => checks.extend(initialized),
            Err(e) => error!("failed to initialize check: {e}"),
        }
    }

    let mut ran = 0;

    for check in checks
        .iter()
        .filter(|c| selected.is_empty() || selected.iter().any(|s| s == c.name()))
    {
        debug!("running check: {}", check.name());
        ran += 1;

        if let Err(e) = check.check(sink).await {
            error!("{} check failed: {e}", check.name());
        }
    }

    if ran == 0 {
        info!("no checks were run");
    }

    ran
}
