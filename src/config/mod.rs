use crate::common::{hostname, Dimensions, HOSTNAME};
use crate::debug;

use serde::de::{Deserializer, Error as _};
use serde::Deserialize;

use std::path::Path;
use std::time::Duration;

mod general;
mod log;
mod nvidia;
mod prometheus;
mod slurm;

pub use general::General;
pub use self::log::Log;
pub use nvidia::{Nvidia, NvidiaVgpu};
pub use prometheus::{DerivedMetric, Operation, Prometheus};
pub use slurm::Slurm;

fn timeout() -> String {
    "3s".into()
}

/// Parses a humantime duration, naming the offending option on failure.
fn duration(option: &str, value: &str) -> Result<Duration, String> {
    value
        .parse::<humantime::Duration>()
        .map(Into::into)
        .map_err(|e| format!("{option} couldn't be parsed: {e}"))
}

/// Whether a check runs. `"auto"` runs it only when the tooling it needs is
/// found on the host.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Enable {
    #[default]
    Off,
    On,
    Auto,
}

impl Enable {
    /// Collapse to a flag. `detect` is only called in auto mode.
    pub fn resolve(self, detect: impl FnOnce() -> bool) -> bool {
        match self {
            Self::Off => false,
            Self::On => true,
            Self::Auto => detect(),
        }
    }
}

impl<'de> Deserialize<'de> for Enable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Word(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(true) => Ok(Self::On),
            Raw::Flag(false) => Ok(Self::Off),
            Raw::Word(word) if word == "auto" => Ok(Self::Auto),
            Raw::Word(word) => Err(D::Error::custom(format!(
                "expected true, false or \"auto\", found \"{word}\""
            ))),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    log: Log,
    #[serde(default)]
    dimensions: Dimensions,
    #[serde(default)]
    prometheus: Vec<Prometheus>,
    #[serde(default)]
    nvidia: Nvidia,
    #[serde(default)]
    nvidia_vgpu: NvidiaVgpu,
    #[serde(default)]
    slurm: Slurm,
}

impl Config {
    pub fn load(path: &dyn AsRef<Path>) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("unable to open config file: {e}"))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| format!("failed to parse config file: {e}"))?;

        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<(), String> {
        self.general.check()?;

        for (index, instance) in self.prometheus.iter().enumerate() {
            instance
                .check()
                .map_err(|e| format!("prometheus instance {index}: {e}"))?;
        }

        self.nvidia.check()?;
        self.nvidia_vgpu.check()?;
        self.slurm.check()?;

        Ok(())
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn prometheus(&self) -> &[Prometheus] {
        &self.prometheus
    }

    pub fn nvidia(&self) -> &Nvidia {
        &self.nvidia
    }

    pub fn nvidia_vgpu(&self) -> &NvidiaVgpu {
        &self.nvidia_vgpu
    }

    pub fn slurm(&self) -> &Slurm {
        &self.slurm
    }

    /// Dimensions attached to every measurement: the agent hostname plus any
    /// configured in the `[dimensions]` table.
    pub fn dimensions(&self) -> Dimensions {
        let mut dimensions = Dimensions::new();
        dimensions.insert(HOSTNAME.to_string(), self.general.hostname());
        dimensions.extend(self.dimensions.clone());
        dimensions
    }

    pub fn enabled(&self, name: &str, enabled: bool) -> bool {
        if enabled {
            debug!("'{name}' check is enabled");
        } else {
            debug!("'{name}' check is not enabled");
        }

        enabled
    }
}
