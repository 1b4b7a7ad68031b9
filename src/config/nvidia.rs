use super::*;

use std::path::PathBuf;

fn enabled() -> bool {
    true
}

fn nvidia_smi() -> String {
    "nvidia-smi".into()
}

fn cache_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn refresh() -> String {
    "4h".into()
}

fn metadata() -> Vec<String> {
    vec!["scale_group".into()]
}

/// Physical GPU readings through NVML, optionally with vGPU utilisation.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Nvidia {
    #[serde(default)]
    enabled: Enable,

    #[serde(default = "enabled")]
    vgpu: bool,

    #[serde(default = "nvidia_smi")]
    nvidia_smi: String,

    #[serde(default)]
    timeout: Option<String>,
}

impl Default for Nvidia {
    fn default() -> Self {
        Self {
            enabled: Enable::Off,
            vgpu: enabled(),
            nvidia_smi: nvidia_smi(),
            timeout: None,
        }
    }
}

impl Nvidia {
    pub fn check(&self) -> Result<(), String> {
        if let Some(timeout) = &self.timeout {
            duration("nvidia.timeout", timeout)?;
        }

        if self.nvidia_smi.is_empty() {
            return Err("nvidia.nvidia_smi must not be empty".into());
        }

        Ok(())
    }

    pub fn enabled(&self) -> Enable {
        self.enabled
    }

    pub fn vgpu(&self) -> bool {
        self.vgpu
    }

    pub fn nvidia_smi(&self) -> &str {
        &self.nvidia_smi
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|t| duration("nvidia.timeout", t).ok())
    }
}

/// vGPU utilisation enriched with the identity of the instance using it.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvidiaVgpu {
    #[serde(default)]
    enabled: Enable,

    #[serde(default = "nvidia_smi")]
    nvidia_smi: String,

    #[serde(default = "cache_dir")]
    cache_dir: PathBuf,

    // maximum age of the instance cache before it is rebuilt
    #[serde(default = "refresh")]
    refresh: String,

    // instance metadata keys reported as dimensions
    #[serde(default = "metadata")]
    metadata: Vec<String>,

    // command printing a JSON object of instance uuid to identity
    #[serde(default)]
    instance_command: Vec<String>,

    #[serde(default)]
    timeout: Option<String>,
}

impl Default for NvidiaVgpu {
    fn default() -> Self {
        Self {
            enabled: Enable::Off,
            nvidia_smi: nvidia_smi(),
            cache_dir: cache_dir(),
            refresh: refresh(),
            metadata: metadata(),
            instance_command: Vec::new(),
            timeout: None,
        }
    }
}

impl NvidiaVgpu {
    pub fn check(&self) -> Result<(), String> {
        duration("nvidia_vgpu.refresh", &self.refresh)?;

        if let Some(timeout) = &self.timeout {
            duration("nvidia_vgpu.timeout", timeout)?;
        }

        if self.nvidia_smi.is_empty() {
            return Err("nvidia_vgpu.nvidia_smi must not be empty".into());
        }

        let unnamed = self.instance_command.first().is_some_and(|c| c.is_empty());
        if self.enabled != Enable::Off && unnamed {
            return Err("nvidia_vgpu.instance_command must name a program".into());
        }

        Ok(())
    }

    pub fn enabled(&self) -> Enable {
        self.enabled
    }

    pub fn nvidia_smi(&self) -> &str {
        &self.nvidia_smi
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn refresh(&self) -> Duration {
        duration("nvidia_vgpu.refresh", &self.refresh).unwrap_or(Duration::from_secs(4 * 3600))
    }

    pub fn metadata(&self) -> &[String] {
        &self.metadata
    }

    pub fn instance_command(&self) -> &[String] {
        &self.instance_command
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .as_deref()
            .and_then(|t| duration("nvidia_vgpu.timeout", t).ok())
    }
}
