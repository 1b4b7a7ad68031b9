//! Parsing of `nvidia-smi vgpu -q` output.
//!
//! ```text
//! GPU 00000000:3B:00.0
//!     Active vGPUs                      : 1
//!     vGPU ID                           : 3251635087
//!         VM UUID                       : 5c0038dc-4129-4dc3-8b64-20d309565abb
//!         VM Name                       : instance-00002903
//!         vGPU Name                     : GRID V100D-8Q
//!         vGPU UUID                     : d2668621-addf-11eb-94cf-ca3b2a15ab98
//!         Utilization
//!             Gpu                       : 0 %
//!             Memory                    : 0 %
//! ```

use super::DeviceRecord;
use crate::common::exec::{self, CommandError};
use crate::common::Dimensions;

use std::collections::HashMap;
use std::time::Duration;

const ACTIVE_VGPUS: &str = "Active vGPUs";
const VGPU_ID: &str = "vGPU ID";
const VGPU_NAME: &str = "vGPU Name";
pub const VM_UUID: &str = "VM UUID";

/// Record keys reported as dimensions, with their dimension names
const DIMENSIONS: &[(&str, &str)] = &[
    (VGPU_ID, "id"),
    ("vGPU UUID", "vgpu_uuid"),
    (VM_UUID, "uuid"),
    ("VM Name", "vm_name"),
];

/// Record keys holding utilisation percentages, with their measurement names
const UTILISATION: &[(&str, &str)] = &[
    ("Gpu", "utilisation_gpu_percent"),
    ("Memory", "utilisation_memory_percent"),
    ("Encoder", "utilisation_encoder_percent"),
    ("Decoder", "utilisation_decoder_percent"),
];

/// The raw key/value pairs reported for one vGPU
pub type Record = HashMap<String, String>;

/// Run `nvidia-smi vgpu -q` and parse its output.
pub async fn query(nvidia_smi: &str, timeout: Duration) -> Result<Vec<Record>, CommandError> {
    let output = exec::output(nvidia_smi, &["vgpu", "-q"], timeout).await?;
    Ok(parse(&output))
}

/// Split the output into one record per `vGPU ID`. Lines that are not a
/// single `key : value` pair, and keys seen before the first vGPU, are
/// ignored.
pub fn parse(output: &str) -> Vec<Record> {
    let mut records: Vec<Record> = Vec::new();

    for line in output.lines() {
        let mut parts = line.split(':');
        let (key, value) = match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => (key.trim(), value.trim()),
            _ => continue,
        };

        if key == ACTIVE_VGPUS {
            continue;
        }

        if key == VGPU_ID {
            records.push(Record::new());
        }

        if let Some(record) = records.last_mut() {
            record.insert(key.to_string(), value.to_string());
        }
    }

    records
}

/// Parse readings such as `"12 %"`.
fn percent(value: &str) -> Option<f64> {
    value
        .replace('%', "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Convert a raw record into dimensions and utilisation readings.
pub fn device_record(record: &Record) -> DeviceRecord {
    let dimensions: Dimensions = DIMENSIONS
        .iter()
        .filter_map(|(key, name)| record.get(*key).map(|v| (name.to_string(), v.clone())))
        .collect();

    let measurements = UTILISATION
        .iter()
        .filter_map(|(key, name)| record.get(*key).and_then(|v| percent(v)).map(|v| (*name, v)))
        .collect();

    let field = |key: &str| record.get(key).map(String::as_str).unwrap_or("unknown");

    DeviceRecord {
        device: format!("{}_{}", field(VGPU_NAME), field(VGPU_ID)),
        dimensions,
        measurements,
    }
}
