use super::DeviceRecord;
use crate::common::Dimensions;
use crate::{debug, info};

use nvml_wrapper::enum_wrappers::device::*;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::{Device, Nvml};

const MILLIWATTS_PER_WATT: f64 = 1000.0;

/// Treat an unsupported query as an absent reading.
fn supported<T>(query: &str, result: Result<T, NvmlError>) -> Result<Option<T>, NvmlError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(NvmlError::NotSupported) => {
            info!("not supported: {query}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// NVML loads and sees at least one GPU.
pub fn detect() -> bool {
    match Nvml::init().and_then(|nvml| nvml.device_count()) {
        Ok(count) => count > 0,
        Err(e) => {
            debug!("nvml unavailable: {e}");
            false
        }
    }
}

/// Identity and readings for every GPU visible to NVML.
pub fn devices() -> Result<Vec<DeviceRecord>, NvmlError> {
    let nvml = Nvml::init()?;

    let driver_version = supported("driver_version", nvml.sys_driver_version())?;

    let count = nvml.device_count()?;
    let mut records = Vec::with_capacity(count as usize);

    for index in 0..count {
        let device = nvml.device_by_index(index)?;
        records.push(record(&device, driver_version.as_deref())?);
    }

    Ok(records)
}

fn record(device: &Device, driver_version: Option<&str>) -> Result<DeviceRecord, NvmlError> {
    let mut dimensions = Dimensions::new();

    if let Some(version) = driver_version {
        dimensions.insert("driver_version".into(), version.into());
    }
    if let Some(uuid) = supported("uuid", device.uuid())? {
        dimensions.insert("uuid".into(), uuid);
    }
    if let Some(version) = supported("info_rom_image_version", device.info_rom_image_version())? {
        dimensions.insert("info_rom_image_version".into(), version);
    }
    if let Some(state) = supported("power_state", device.performance_state())? {
        dimensions.insert("power_state".into(), power_state(state));
    }
    if let Some(version) = supported("vbios_version", device.vbios_version())? {
        dimensions.insert("vbios_version".into(), version);
    }

    let mut measurements = Vec::new();

    if let Some(speed) = supported("fan_speed", device.fan_speed(0))? {
        measurements.push(("fan_speed_percent", speed as f64));
    }

    /*
     * memory
     */

    if let Some(memory) = supported("memory_info", device.memory_info())? {
        measurements.push(("memory_fb_total_bytes", memory.total as f64));
        measurements.push(("memory_fb_used_bytes", memory.used as f64));
        measurements.push((
            "memory_fb_free_bytes",
            memory.total.saturating_sub(memory.used) as f64,
        ));
    }

    if let Some(bar1) = supported("bar1_memory_info", device.bar1_memory_info())? {
        measurements.push(("memory_bar1_total_bytes", bar1.total as f64));
        measurements.push(("memory_bar1_used_bytes", bar1.used as f64));
        measurements.push((
            "memory_bar1_free_bytes",
            bar1.total.saturating_sub(bar1.used) as f64,
        ));
    }

    /*
     * utilization
     */

    if let Some(utilization) = supported("utilization_rates", device.utilization_rates())? {
        measurements.push(("utilisation_gpu_percent", utilization.gpu as f64));
        measurements.push(("utilisation_memory_percent", utilization.memory as f64));
    }

    /*
     * temperature
     */

    if let Some(t) = supported("temperature", device.temperature(TemperatureSensor::Gpu))? {
        measurements.push(("temperature_deg_c", t as f64));
    }

    if let Some(t) = supported(
        "temperature_shutdown",
        device.temperature_threshold(TemperatureThreshold::Shutdown),
    )? {
        measurements.push(("temperature_shutdown_deg_c", t as f64));
    }

    if let Some(t) = supported(
        "temperature_slowdown",
        device.temperature_threshold(TemperatureThreshold::Slowdown),
    )? {
        measurements.push(("temperature_slowdown_deg_c", t as f64));
    }

    /*
     * power
     */

    if let Some(mw) = supported("power_usage", device.power_usage())? {
        measurements.push(("power_watts", mw as f64 / MILLIWATTS_PER_WATT));
    }

    if let Some(mw) = supported("power_management_limit", device.power_management_limit())? {
        measurements.push(("power_limit_watts", mw as f64 / MILLIWATTS_PER_WATT));
    }

    /*
     * clocks
     */

    for (clock, current, max) in [
        (Clock::Graphics, "clock_freq_gpu_mhz", "clock_max_freq_gpu_mhz"),
        (Clock::SM, "clock_freq_sm_mhz", "clock_max_freq_sm_mhz"),
        (Clock::Memory, "clock_freq_memory_mhz", "clock_max_freq_memory_mhz"),
        (Clock::Video, "clock_freq_video_mhz", "clock_max_freq_video_mhz"),
    ] {
        if let Some(mhz) = supported(current, device.clock_info(clock.clone()))? {
            measurements.push((current, mhz as f64));
        }
        if let Some(mhz) = supported(max, device.max_clock_info(clock))? {
            measurements.push((max, mhz as f64));
        }
    }

    let name = supported("name", device.name())?.unwrap_or_else(|| "unknown".into());
    let serial = supported("serial", device.serial())?.unwrap_or_else(|| "unknown".into());

    Ok(DeviceRecord {
        device: format!("{name}_{serial}"),
        dimensions,
        measurements,
    })
}

fn power_state(state: PerformanceState) -> String {
    match state {
        PerformanceState::Unknown => "unknown".into(),
        state => format!("P{}", state.as_c()),
    }
}
