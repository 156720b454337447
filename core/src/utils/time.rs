/// Wall-clock helpers; the engine works in floating epoch seconds
use chrono::{DateTime, Local, TimeZone, Utc};

pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// RFC3339 in UTC; empty for out-of-range input
pub fn rfc3339(epoch: f64) -> String {
    to_utc(epoch).map(|t| t.to_rfc3339()).unwrap_or_default()
}

/// `YYYY-MM-DD HH:MM:SS` in the local timezone
pub fn local_time_string(epoch: f64) -> String {
    to_utc(epoch)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn to_utc(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() {
        return None;
    }
    let micros = (epoch * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros).single()
}
