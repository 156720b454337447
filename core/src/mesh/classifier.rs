/// Packet classification: raw decoded packet -> one of five tagged variants
use crate::mesh::packet::{
    pressure_to_hpa, PortNum, RawDecoded, RawPacket, RawTelemetry,
    TelemetryFields,
};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Result of classifying one packet. Never an error: anything that does not carry the
/// required fields of its port is `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Telemetry {
        node_id: String,
        fields: TelemetryFields,
    },
    Position {
        node_id: String,
        lat: Option<f64>,
        lon: Option<f64>,
        alt: Option<f64>,
    },
    NodeInfo {
        node_id: String,
        long_name: Option<String>,
        short_name: Option<String>,
    },
    Text {
        from: String,
        to: String,
        text: String,
    },
    Unknown {
        raw: Value,
    },
}

impl Classified {
    pub fn kind(&self) -> &'static str {
        match self {
            Classified::Telemetry { .. } => "telemetry",
            Classified::Position { .. } => "position",
            Classified::NodeInfo { .. } => "nodeinfo",
            Classified::Text { .. } => "text",
            Classified::Unknown { .. } => "unknown",
        }
    }
}

impl fmt::Display for Classified {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self.kind())
    }
}

/// Classify a decoded packet.
pub fn classify(raw: &Value) -> Classified {
    let unknown = || Classified::Unknown { raw: raw.clone() };

    let packet = match RawPacket::deserialize(raw) {
        Ok(p) => p,
        Err(_) => return unknown(),
    };
    let decoded = match packet.decoded.as_ref() {
        Some(d) => d,
        None => return unknown(),
    };
    let port = match decoded.portnum.as_ref() {
        Some(p) => p.port(),
        None => return unknown(),
    };

    let classified = match port {
        PortNum::Text => classify_text(&packet, decoded),
        PortNum::Position => classify_position(&packet, decoded),
        PortNum::Telemetry => classify_telemetry(&packet, decoded),
        PortNum::NodeInfo => classify_nodeinfo(&packet, decoded),
        PortNum::Other(_) => None,
    };
    classified.unwrap_or_else(unknown)
}

/// A node addressing itself has no conversation partner.
fn classify_text(packet: &RawPacket, decoded: &RawDecoded) -> Option<Classified> {
    let from = packet.sender()?;
    let to = packet.destination()?;
    if from == to {
        return None;
    }
    Some(Classified::Text {
        from,
        to,
        text: decoded.text.clone()?,
    })
}

fn classify_position(packet: &RawPacket, decoded: &RawDecoded) -> Option<Classified> {
    let node_id = packet.sender()?;
    let pos = decoded.position.as_ref()?;
    let lat = pos
        .latitude
        .or_else(|| pos.latitude_i.map(|v| v as f64 * 1e-7));
    let lon = pos
        .longitude
        .or_else(|| pos.longitude_i.map(|v| v as f64 * 1e-7));
    let alt = pos.altitude;
    if lat.is_none() && lon.is_none() && alt.is_none() {
        return None;
    }
    Some(Classified::Position {
        node_id,
        lat,
        lon,
        alt,
    })
}

fn classify_telemetry(packet: &RawPacket, decoded: &RawDecoded) -> Option<Classified> {
    let node_id = packet.sender()?;
    let fields = telemetry_fields(decoded.telemetry.as_ref()?);
    if fields.is_empty() {
        return None;
    }
    Some(Classified::Telemetry { node_id, fields })
}

fn telemetry_fields(t: &RawTelemetry) -> TelemetryFields {
    let mut fields = TelemetryFields::default();
    if let Some(dm) = &t.device_metrics {
        fields.battery_level = dm.battery_level;
        fields.voltage = dm.voltage;
        fields.channel_utilization = dm.channel_utilization;
        fields.air_util_tx = dm.air_util_tx;
        fields.uptime_seconds = dm.uptime_seconds;
    }
    if let Some(em) = &t.environment_metrics {
        fields.temperature_c = em.temperature;
        fields.relative_humidity = em.relative_humidity;
        fields.pressure_hpa = em.barometric_pressure.map(pressure_to_hpa);
    }
    fields
}

fn classify_nodeinfo(packet: &RawPacket, decoded: &RawDecoded) -> Option<Classified> {
    let user = decoded.user.as_ref()?;
    let node_id = packet.sender().or_else(|| non_empty(user.id.as_deref()))?;
    let long_name = non_empty(user.long_name.as_deref());
    let short_name = non_empty(user.short_name.as_deref());
    if long_name.is_none() && short_name.is_none() {
        return None;
    }
    Some(Classified::NodeInfo {
        node_id,
        long_name,
        short_name,
    })
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
