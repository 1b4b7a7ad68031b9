use super::*;
use crate::common::HOSTNAME;
use crate::config::Enable;

use cache::{CommandSource, Instance, InstanceCache, InstanceSource};

use std::path::PathBuf;

const NAME: &str = "nvidia_vgpu";

const RESOURCE_ID: &str = "resource_id";
const TENANT_ID: &str = "tenant_id";

#[distributed_slice(CHECKS)]
fn init(config: Arc<Config>) -> CheckResult {
    let vgpu = config.nvidia_vgpu();

    // in auto mode a failed vGPU query at run time also means "not present"
    let enabled = vgpu.enabled().resolve(|| {
        let found = vgpu.cache_dir().is_dir();
        if !found {
            debug!("{} is not a directory", vgpu.cache_dir().display());
        }
        found
    });

    if !config.enabled(NAME, enabled) {
        return Ok(Vec::new());
    }

    let timeout = vgpu.timeout().unwrap_or_else(|| config.general().timeout());

    Ok(vec![Box::new(NvidiaVgpu {
        dimensions: config.dimensions(),
        nvidia_smi: vgpu.nvidia_smi().to_string(),
        cache_dir: vgpu.cache_dir().to_path_buf(),
        refresh: vgpu.refresh(),
        metadata: vgpu.metadata().to_vec(),
        source: CommandSource::new(vgpu.instance_command(), timeout),
        lookup_instances: !vgpu.instance_command().is_empty(),
        required: vgpu.enabled() == Enable::On,
        timeout,
    })])
}

/// vGPU utilisation, attributed to the instance each vGPU is attached to.
struct NvidiaVgpu {
    dimensions: Dimensions,
    nvidia_smi: String,
    cache_dir: PathBuf,
    refresh: Duration,
    metadata: Vec<String>,
    source: CommandSource,
    lookup_instances: bool,
    required: bool,
    timeout: Duration,
}

#[async_trait]
impl Check for NvidiaVgpu {
    fn name(&self) -> &str {
        NAME
    }

    async fn check(&self, sink: &mut dyn Sink) -> Result<(), CheckError> {
        let records = match smi::query(&self.nvidia_smi, self.timeout).await {
            Ok(records) => records,
            Err(e) if !self.required => {
                info!("no vGPU support detected: {e}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut devices: Vec<DeviceRecord> = records.iter().map(smi::device_record).collect();

        if self.lookup_instances && !devices.is_empty() {
            let mut cache = InstanceCache::open(&self.cache_dir, self.refresh, &self.source).await;
            identify(&mut devices, &records, &mut cache, &self.metadata).await;
        }

        emit(VGPU_PREFIX, &devices, &self.dimensions, sink);

        Ok(())
    }
}

/// Add the identity of the owning instance to each device whose VM UUID is
/// known to the cache.
async fn identify<S: InstanceSource>(
    devices: &mut [DeviceRecord],
    records: &[smi::Record],
    cache: &mut InstanceCache<'_, S>,
    metadata: &[String],
) {
    for (device, record) in devices.iter_mut().zip(records) {
        let uuid = match record.get(smi::VM_UUID) {
            Some(uuid) => uuid,
            None => continue,
        };

        match cache.lookup(uuid).await {
            Some(instance) => annotate(&mut device.dimensions, uuid, instance, metadata),
            None => debug!("no instance found for {uuid}"),
        }
    }
}

fn annotate(dimensions: &mut Dimensions, uuid: &str, instance: &Instance, metadata: &[String]) {
    dimensions.insert(RESOURCE_ID.to_string(), uuid.to_string());
    dimensions.insert(HOSTNAME.to_string(), instance.name.clone());

    if let Some(tenant_id) = &instance.tenant_id {
        dimensions.insert(TENANT_ID.to_string(), tenant_id.clone());
    }

    for key in metadata {
        if let Some(value) = instance.metadata.get(key) {
            dimensions.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Recorder;

    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;

    const OUTPUT: &str = "GPU 00000000:3B:00.0
    Active vGPUs                      : 1
    vGPU ID                           : 3251635087
        VM UUID                       : 5c0038dc-4129-4dc3-8b64-20d309565abb
        VM Name                       : instance-00002903
        vGPU Name                     : GRID V100D-8Q
        vGPU UUID                     : d2668621-addf-11eb-94cf-ca3b2a15ab98
        Utilization
            Gpu                       : 12 %
            Memory                    : 3 %
            Encoder                   : 0 %
            Decoder                   : 0 %
";

    fn listing() -> String {
        r#"{"5c0038dc-4129-4dc3-8b64-20d309565abb": {
            "name": "compute-0",
            "tenant_id": "7b6f0c1a",
            "metadata": {"scale_group": "gpu", "owner": "someone"}
        }}"#
        .replace('\n', " ")
    }

    fn check_for(dir: &std::path::Path, output: &str, instance_command: &[String]) -> NvidiaVgpu {
        // stands in for nvidia-smi, printing canned output
        let script = dir.join("nvidia-smi");
        std::fs::write(&script, format!("#!/bin/sh\ncat <<'END'\n{output}END\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        NvidiaVgpu {
            dimensions: [("hostname".to_string(), "hypervisor-0".to_string())]
                .into_iter()
                .collect(),
            nvidia_smi: script.to_string_lossy().into_owned(),
            cache_dir: dir.to_path_buf(),
            refresh: Duration::from_secs(3600),
            metadata: vec!["scale_group".into()],
            source: CommandSource::new(instance_command, Duration::from_secs(5)),
            lookup_instances: !instance_command.is_empty(),
            required: true,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_identified() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_for(dir.path(), OUTPUT, &["echo".to_string(), listing()]);
        let mut recorder = Recorder::default();

        check.check(&mut recorder).await.unwrap();

        assert_eq!(
            recorder.gauge_names(),
            vec![
                "nvidia.vgpu.utilisation_gpu_percent",
                "nvidia.vgpu.utilisation_memory_percent",
                "nvidia.vgpu.utilisation_encoder_percent",
                "nvidia.vgpu.utilisation_decoder_percent",
            ]
        );

        let dimensions = &recorder.gauges[0].dimensions;
        assert_eq!(dimensions["hostname"], "compute-0");
        assert_eq!(dimensions["resource_id"], "5c0038dc-4129-4dc3-8b64-20d309565abb");
        assert_eq!(dimensions["tenant_id"], "7b6f0c1a");
        assert_eq!(dimensions["scale_group"], "gpu");
        assert_eq!(dimensions["device"], "GRID V100D-8Q_3251635087");
        assert!(!dimensions.contains_key("owner"));
        assert_eq!(recorder.gauges[0].value, 12.0);

        assert!(dir.path().join(cache::CACHE_FILE).exists());
    }

    #[tokio::test]
    async fn test_without_instance_command() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_for(dir.path(), OUTPUT, &[]);
        let mut recorder = Recorder::default();

        check.check(&mut recorder).await.unwrap();

        let dimensions = &recorder.gauges[0].dimensions;
        assert_eq!(dimensions["hostname"], "hypervisor-0");
        assert_eq!(dimensions["vm_name"], "instance-00002903");
        assert!(!dimensions.contains_key("resource_id"));
        assert!(!dir.path().join(cache::CACHE_FILE).exists());
    }

    #[tokio::test]
    async fn test_nvidia_smi_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut check = check_for(dir.path(), OUTPUT, &[]);
        check.nvidia_smi = "/nonexistent/nvidia-smi".into();
        let mut recorder = Recorder::default();

        assert!(check.check(&mut recorder).await.is_err());
        assert!(recorder.gauges.is_empty());
    }

    #[tokio::test]
    async fn test_auto_without_vgpu_support() {
        let dir = tempfile::tempdir().unwrap();
        let mut check = check_for(dir.path(), OUTPUT, &[]);
        check.nvidia_smi = "/nonexistent/nvidia-smi".into();
        check.required = false;
        let mut recorder = Recorder::default();

        check.check(&mut recorder).await.unwrap();
        assert!(recorder.gauges.is_empty());
    }

    #[test]
    fn test_init_auto() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            "[nvidia_vgpu]\nenabled = \"auto\"\ncache_dir = \"{}\"\n",
            dir.path().display()
        );
        let config: Config = toml::from_str(&text).unwrap();
        let checks = init(Arc::new(config)).unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name(), "nvidia_vgpu");

        let config: Config = toml::from_str(
            "[nvidia_vgpu]\nenabled = \"auto\"\ncache_dir = \"/nonexistent/cache\"\n",
        )
        .unwrap();
        assert!(init(Arc::new(config)).unwrap().is_empty());
    }

    #[test]
    fn test_annotate() {
        let instance = Instance {
            name: "compute-1".into(),
            tenant_id: None,
            metadata: HashMap::new(),
        };
        let mut dimensions = Dimensions::new();

        annotate(&mut dimensions, "uuid-1", &instance, &["scale_group".to_string()]);

        assert_eq!(dimensions.len(), 2);
        assert_eq!(dimensions["resource_id"], "uuid-1");
        assert_eq!(dimensions["hostname"], "compute-1");
    }
}
