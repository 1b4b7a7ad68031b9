//! GPU readings from NVML and vGPU utilisation from `nvidia-smi`.

use super::*;
use crate::common::{merge_dimensions, DEVICE};

mod cache;
mod smi;
mod vgpu;

#[cfg(target_os = "linux")]
mod nvml;

#[cfg(not(target_os = "linux"))]
mod nvml {
    pub fn detect() -> bool {
        false
    }

    pub fn devices() -> Result<Vec<super::DeviceRecord>, &'static str> {
        Err("NVML is only available on Linux")
    }
}

const NAME: &str = "nvidia";

const PREFIX: &str = "nvidia";
const VGPU_PREFIX: &str = "nvidia.vgpu";

#[distributed_slice(CHECKS)]
fn init(config: Arc<Config>) -> CheckResult {
    if !config.enabled(NAME, config.nvidia().enabled().resolve(nvml::detect)) {
        return Ok(Vec::new());
    }

    let timeout = config
        .nvidia()
        .timeout()
        .unwrap_or_else(|| config.general().timeout());

    Ok(vec![Box::new(Nvidia {
        dimensions: config.dimensions(),
        vgpu: config.nvidia().vgpu(),
        nvidia_smi: config.nvidia().nvidia_smi().to_string(),
        timeout,
    })])
}

/// Identity and readings for one physical or virtual GPU.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceRecord {
    pub device: String,
    pub dimensions: Dimensions,
    pub measurements: Vec<(&'static str, f64)>,
}

/// Report every measurement of every record as a gauge named
/// `<prefix>.<measurement>`.
fn emit(prefix: &str, records: &[DeviceRecord], dimensions: &Dimensions, sink: &mut dyn Sink) {
    for record in records {
        let mut dimensions = dimensions.clone();
        merge_dimensions(&mut dimensions, &record.dimensions);
        dimensions.insert(DEVICE.to_string(), record.device.clone());

        for (measurement, value) in &record.measurements {
            sink.gauge(Measurement::new(
                format!("{prefix}.{measurement}"),
                *value,
                dimensions.clone(),
            ));
        }

        debug!("collected info for {}", record.device);
    }
}

struct Nvidia {
    dimensions: Dimensions,
    vgpu: bool,
    nvidia_smi: String,
    timeout: Duration,
}

#[async_trait]
impl Check for Nvidia {
    fn name(&self) -> &str {
        NAME
    }

    async fn check(&self, sink: &mut dyn Sink) -> Result<(), CheckError> {
        let devices = tokio::task::spawn_blocking(nvml::devices)
            .await
            .map_err(|e| CheckError::Nvml(e.to_string()))?
            .map_err(|e| CheckError::Nvml(e.to_string()))?;

        emit(PREFIX, &devices, &self.dimensions, sink);

        if !self.vgpu {
            return Ok(());
        }

        // physical readings have already been reported
        match smi::query(&self.nvidia_smi, self.timeout).await {
            Ok(records) => {
                let devices: Vec<DeviceRecord> = records.iter().map(smi::device_record).collect();
                emit(VGPU_PREFIX, &devices, &self.dimensions, sink);
            }
            Err(e) => warn!("failed to query vGPUs: {e}"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Recorder;

    fn dims(pairs: &[(&str, &str)]) -> Dimensions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_emit() {
        let records = vec![DeviceRecord {
            device: "Tesla V100_0323".into(),
            dimensions: dims(&[("uuid", "GPU-1234"), ("bad", "a=b")]),
            measurements: vec![("temperature_deg_c", 41.0), ("power_watts", 61.5)],
        }];
        let mut recorder = Recorder::default();

        emit(PREFIX, &records, &dims(&[("hostname", "compute-0")]), &mut recorder);

        assert_eq!(
            recorder.gauge_names(),
            vec!["nvidia.temperature_deg_c", "nvidia.power_watts"]
        );
        assert_eq!(
            recorder.gauges[0].dimensions,
            dims(&[
                ("hostname", "compute-0"),
                ("uuid", "GPU-1234"),
                ("device", "Tesla V100_0323"),
            ])
        );
        assert_eq!(recorder.gauges[1].value, 61.5);
        assert!(recorder.rates.is_empty());
    }

    #[test]
    fn test_init_disabled() {
        let config: Config = toml::from_str("").unwrap();
        assert!(init(Arc::new(config)).unwrap().is_empty());

        let config: Config = toml::from_str("[nvidia]\nenabled = true").unwrap();
        let checks = init(Arc::new(config)).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name(), "nvidia");
    }
}
