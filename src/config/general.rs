use super::*;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    // overrides the system hostname reported in the `hostname` dimension
    #[serde(default)]
    hostname: Option<String>,

    // upper bound on a single scrape or subprocess invocation, unless a check
    // configures its own
    #[serde(default = "timeout")]
    timeout: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            hostname: None,
            timeout: timeout(),
        }
    }
}

impl General {
    pub fn check(&self) -> Result<(), String> {
        duration("general.timeout", &self.timeout)?;

        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err("general.hostname must not be empty".into());
            }
        }

        Ok(())
    }

    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(hostname)
    }

    pub fn timeout(&self) -> Duration {
        duration("general.timeout", &self.timeout).unwrap_or(Duration::from_secs(3))
    }
}
