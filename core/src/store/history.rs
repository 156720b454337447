/// Bounded, debounced time series per (node, metric)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Battery,
    Voltage,
    Temperature,
    Humidity,
    Pressure,
    Rssi,
    Snr,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Battery => "battery",
            Metric::Voltage => "voltage",
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::Rssi => "rssi",
            Metric::Snr => "snr",
        }
    }

    pub fn all() -> [Metric; 7] {
        [
            Metric::Battery,
            Metric::Voltage,
            Metric::Temperature,
            Metric::Humidity,
            Metric::Pressure,
            Metric::Rssi,
            Metric::Snr,
        ]
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::all()
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub t: f64,
    pub value: f64,
}

/// Per-node history, keyed by metric
pub type NodeHistory = BTreeMap<Metric, Vec<HistoryPoint>>;

pub struct HistorySampler {
    maxlen: usize,
    sample_secs: f64,
    series: HashMap<(String, Metric), VecDeque<HistoryPoint>>,
}

impl HistorySampler {
    /// `maxlen` is clamped to at least one point.
    pub fn new(maxlen: usize, sample_secs: f64) -> Self {
        Self {
            maxlen: maxlen.max(1),
            sample_secs,
            series: HashMap::new(),
        }
    }

    /// Append a point unless the series recorded one less than `sample_secs` ago.
    /// Returns whether the point was kept.
    pub fn record_sample(&mut self, node_id: &str, metric: Metric, value: f64, timestamp: f64) -> bool {
        if !value.is_finite() || !timestamp.is_finite() {
            return false;
        }

        let maxlen = self.maxlen;
        let series = self
            .series
            .entry((node_id.to_string(), metric))
            .or_insert_with(|| VecDeque::with_capacity(maxlen.min(64)));

        if let Some(last) = series.back() {
            if timestamp - last.t < self.sample_secs {
                return false;
            }
        }

        if series.len() == maxlen {
            series.pop_front();
        }
        series.push_back(HistoryPoint { t: timestamp, value });
        true
    }

    /// Oldest first
    pub fn get_history(&self, node_id: &str, metric: Metric) -> Vec<HistoryPoint> {
        self.series
            .get(&(node_id.to_string(), metric))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every series, optionally cut down to its newest `limit` points.
    pub fn snapshot(&self, limit: Option<usize>) -> BTreeMap<String, NodeHistory> {
        let mut out: BTreeMap<String, NodeHistory> = BTreeMap::new();
        for ((node_id, metric), points) in &self.series {
            let skip = limit.map(|n| points.len().saturating_sub(n)).unwrap_or(0);
            out.entry(node_id.clone())
                .or_default()
                .insert(*metric, points.iter().skip(skip).copied().collect());
        }
        out
    }
}
