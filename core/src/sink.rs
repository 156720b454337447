/// Flat per-event records for external persistence
use crate::mesh::packet::{PositionFields, TelemetryFields};
use serde::Serialize;
use tracing::debug;

/// One row per telemetry merge, position merge or recorded message.
///
/// Column order matches the field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlatRecord {
    pub local_time: String,
    pub epoch: f64,
    pub event: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    pub battery: Option<f64>,
    pub voltage: Option<f64>,
    pub temp_c: Option<f64>,
    pub temp_f: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub text: Option<String>,
}

impl FlatRecord {
    pub fn new(event: &str, epoch: f64) -> Self {
        Self {
            local_time: crate::utils::time::local_time_string(epoch),
            epoch,
            event: event.to_string(),
            ..Default::default()
        }
    }

    pub fn with_link(mut self, from: Option<&str>, to: Option<&str>, rssi: Option<f64>, snr: Option<f64>) -> Self {
        self.from = from.map(str::to_string);
        self.to = to.map(str::to_string);
        self.rssi = rssi;
        self.snr = snr;
        self
    }

    pub fn with_telemetry(mut self, t: &TelemetryFields) -> Self {
        self.battery = t.battery_level;
        self.voltage = t.voltage;
        self.temp_c = t.temperature_c;
        self.temp_f = t.temperature_f();
        self.humidity = t.relative_humidity;
        self.pressure_hpa = t.pressure_hpa;
        self
    }

    pub fn with_position(mut self, p: &PositionFields) -> Self {
        self.lat = p.latitude;
        self.lon = p.longitude;
        self.alt = p.altitude;
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }
}

/// Receives every `FlatRecord`. Called outside the state lock.
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &FlatRecord);
}

/// Writes records to the debug log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn record(&self, record: &FlatRecord) {
        match serde_json::to_string(record) {
            Ok(line) => debug!(target: "meshdash::records", "{}", line),
            Err(e) => debug!("Failed to serialize record: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builders() {
        let r = FlatRecord::new("TELEMETRY_APP", 1_700_000_000.0)
            .with_link(Some("!1"), None, Some(-80.0), None)
            .with_telemetry(&TelemetryFields {
                temperature_c: Some(100.0),
                ..Default::default()
            });
        assert_eq!(r.event, "TELEMETRY_APP");
        assert_eq!(r.from.as_deref(), Some("!1"));
        assert_eq!(r.temp_f, Some(212.0));
        assert!(!r.local_time.is_empty());
        assert_eq!(r.text, None);
    }
}
