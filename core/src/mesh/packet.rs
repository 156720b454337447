use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Destination id of a packet addressed to every node.
pub const BROADCAST_ADDR: &str = "^all";

/// Numeric broadcast destination used by the radio firmware.
const BROADCAST_NUM: u64 = 0xFFFF_FFFF;

/// Application port a decoded packet was delivered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortNum {
    Text,
    Position,
    NodeInfo,
    Telemetry,
    Other(String),
}

impl PortNum {
    pub fn from_name(name: &str) -> Self {
        match name {
            "TEXT_MESSAGE_APP" => PortNum::Text,
            "POSITION_APP" => PortNum::Position,
            "NODEINFO_APP" => PortNum::NodeInfo,
            "TELEMETRY_APP" => PortNum::Telemetry,
            other => PortNum::Other(other.to_string()),
        }
    }

    pub fn from_number(num: u64) -> Self {
        match num {
            1 => PortNum::Text,
            3 => PortNum::Position,
            4 => PortNum::NodeInfo,
            67 => PortNum::Telemetry,
            other => PortNum::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PortNum::Text => "TEXT_MESSAGE_APP",
            PortNum::Position => "POSITION_APP",
            PortNum::NodeInfo => "NODEINFO_APP",
            PortNum::Telemetry => "TELEMETRY_APP",
            PortNum::Other(name) => name,
        }
    }
}

/// Portnum as it appears on the wire: symbolic name or enum number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortRepr {
    Name(String),
    Number(u64),
}

impl PortRepr {
    pub fn port(&self) -> PortNum {
        match self {
            PortRepr::Name(name) => PortNum::from_name(name),
            PortRepr::Number(num) => PortNum::from_number(*num),
        }
    }
}

/// Decoded packet as delivered by the transport.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPacket {
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    /// Numeric sender, used when `fromId` is missing
    pub from: Option<u64>,
    /// Numeric destination, used when `toId` is missing
    pub to: Option<u64>,
    pub decoded: Option<RawDecoded>,
}

impl RawPacket {
    pub fn sender(&self) -> Option<String> {
        node_id_or_num(self.from_id.as_deref(), self.from)
    }

    pub fn destination(&self) -> Option<String> {
        node_id_or_num(self.to_id.as_deref(), self.to)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDecoded {
    pub portnum: Option<PortRepr>,
    pub text: Option<String>,
    pub position: Option<RawPosition>,
    pub telemetry: Option<RawTelemetry>,
    pub user: Option<RawUser>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    #[serde(rename = "latitudeI")]
    pub latitude_i: Option<i64>,
    #[serde(rename = "longitudeI")]
    pub longitude_i: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTelemetry {
    pub device_metrics: Option<RawDeviceMetrics>,
    pub environment_metrics: Option<RawEnvironmentMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDeviceMetrics {
    pub battery_level: Option<f64>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvironmentMetrics {
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub barometric_pressure: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUser {
    pub id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
}

/// Latest telemetry of a node. Every field is independent; `None` means "not reported".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFields {
    pub battery_level: Option<f64>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<u64>,
    pub temperature_c: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

impl TelemetryFields {
    pub fn is_empty(&self) -> bool {
        *self == TelemetryFields::default()
    }

    /// Overwrite every field `update` carries; leave the rest untouched.
    pub fn merge_from(&mut self, update: &TelemetryFields) {
        merge_opt(&mut self.battery_level, update.battery_level);
        merge_opt(&mut self.voltage, update.voltage);
        merge_opt(&mut self.channel_utilization, update.channel_utilization);
        merge_opt(&mut self.air_util_tx, update.air_util_tx);
        merge_opt(&mut self.uptime_seconds, update.uptime_seconds);
        merge_opt(&mut self.temperature_c, update.temperature_c);
        merge_opt(&mut self.relative_humidity, update.relative_humidity);
        merge_opt(&mut self.pressure_hpa, update.pressure_hpa);
    }

    pub fn temperature_f(&self) -> Option<f64> {
        self.temperature_c.map(celsius_to_fahrenheit)
    }
}

/// Latest position of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionFields {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

impl PositionFields {
    pub fn merge_from(&mut self, update: &PositionFields) {
        merge_opt(&mut self.latitude, update.latitude);
        merge_opt(&mut self.longitude, update.longitude);
        merge_opt(&mut self.altitude, update.altitude);
    }
}

/// Transport-level facts about a packet, independent of its payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub packet_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub portnum: Option<String>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
}

impl Envelope {
    /// Read the envelope leniently; missing or mistyped fields are `None`.
    pub fn from_value(raw: &Value) -> Self {
        let decoded = raw.get("decoded");
        let packet_id = raw
            .get("id")
            .or_else(|| decoded.and_then(|d| d.get("id")))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let portnum = decoded
            .and_then(|d| d.get("portnum"))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => n.as_u64().map(|n| PortNum::from_number(n).as_str().to_string()),
                _ => None,
            });

        Self {
            packet_id,
            from: node_id_or_num(
                raw.get("fromId").and_then(Value::as_str),
                raw.get("from").and_then(Value::as_u64),
            ),
            to: node_id_or_num(
                raw.get("toId").and_then(Value::as_str),
                raw.get("to").and_then(Value::as_u64),
            ),
            portnum,
            rssi: raw.get("rxRssi").and_then(Value::as_f64),
            snr: raw.get("rxSnr").and_then(Value::as_f64),
        }
    }
}

/// Render a numeric node number the way the firmware names nodes (`!a0cb0f88`).
pub fn node_id_from_num(num: u64) -> String {
    if num == BROADCAST_NUM {
        BROADCAST_ADDR.to_string()
    } else {
        format!("!{:08x}", num)
    }
}

fn node_id_or_num(id: Option<&str>, num: Option<u64>) -> Option<String> {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => Some(id.to_string()),
        _ => num.map(node_id_from_num),
    }
}

/// Barometric pressure arrives in Pascals from some sensors and hPa from others.
pub fn pressure_to_hpa(p: f64) -> f64 {
    if p > 1100.0 {
        p / 100.0
    } else {
        p
    }
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

fn merge_opt<T: Copy>(slot: &mut Option<T>, update: Option<T>) {
    if update.is_some() {
        *slot = update;
    }
}
