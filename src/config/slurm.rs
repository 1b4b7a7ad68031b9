use super::*;

fn scontrol() -> String {
    "/usr/bin/scontrol".into()
}

fn timeout() -> String {
    "10s".into()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Slurm {
    #[serde(default)]
    enabled: Enable,

    #[serde(default = "scontrol")]
    scontrol: String,

    #[serde(default = "timeout")]
    timeout: String,
}

impl Default for Slurm {
    fn default() -> Self {
        Self {
            enabled: Enable::Off,
            scontrol: scontrol(),
            timeout: timeout(),
        }
    }
}

impl Slurm {
    pub fn check(&self) -> Result<(), String> {
        duration("slurm.timeout", &self.timeout)?;

        if self.scontrol.is_empty() {
            return Err("slurm.scontrol must not be empty".into());
        }

        Ok(())
    }

    pub fn enabled(&self) -> Enable {
        self.enabled
    }

    pub fn scontrol(&self) -> &str {
        &self.scontrol
    }

    pub fn timeout(&self) -> Duration {
        duration("slurm.timeout", &self.timeout).unwrap_or(Duration::from_secs(10))
    }
}
