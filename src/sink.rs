use crate::common::Dimensions;
use crate::error;

use serde::Serialize;

use std::collections::HashMap;
use std::io::Write;

/// A single reading handed to a [`Sink`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub dimensions: Dimensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_meta: Option<HashMap<String, String>>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64, dimensions: Dimensions) -> Self {
        Self {
            name: name.into(),
            value,
            dimensions,
            value_meta: None,
        }
    }

    pub fn with_value_meta(mut self, value_meta: HashMap<String, String>) -> Self {
        self.value_meta = Some(value_meta);
        self
    }
}

/// Destination for collected measurements.
///
/// Gauges are reported as-is. Rates carry a monotonic counter value and are
/// turned into a per-second rate by the consumer.
pub trait Sink: Send {
    fn gauge(&mut self, measurement: Measurement);

    fn rate(&mut self, measurement: Measurement);
}

#[derive(Serialize)]
struct Record<'a> {
    kind: &'static str,
    timestamp: i64,
    #[serde(flatten)]
    measurement: &'a Measurement,
}

/// Writes one JSON object per measurement, newline delimited.
pub struct JsonSink<W> {
    writer: W,
}

impl<W: Write + Send> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    fn write(&mut self, kind: &'static str, measurement: &Measurement) {
        let record = Record {
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            measurement,
        };

        let result = serde_json::to_writer(&mut self.writer, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());

        if let Err(e) = result {
            error!("failed to write {}: {e}", measurement.name);
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink for JsonSink<W> {
    fn gauge(&mut self, measurement: Measurement) {
        self.write("gauge", &measurement);
    }

    fn rate(&mut self, measurement: Measurement) {
        self.write("rate", &measurement);
    }
}

/// Keeps everything it is given, for inspection in tests.
#[cfg(test)]
#[derive(Default)]
pub struct Recorder {
    pub gauges: Vec<Measurement>,
    pub rates: Vec<Measurement>,
}

#[cfg(test)]
impl Recorder {
    pub fn gauge_names(&self) -> Vec<&str> {
        self.gauges.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn rate_names(&self) -> Vec<&str> {
        self.rates.iter().map(|m| m.name.as_str()).collect()
    }
}

#[cfg(test)]
impl Sink for Recorder {
    fn gauge(&mut self, measurement: Measurement) {
        self.gauges.push(measurement);
    }

    fn rate(&mut self, measurement: Measurement) {
        self.rates.push(measurement);
    }
}
