/// Configuration management
use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 8080;
const DEFAULT_HISTORY_MAXLEN: usize = 300;
const DEFAULT_HISTORY_SAMPLE_SECS: f64 = 2.0;
const DEFAULT_MAX_MSGS_PER_CONV: usize = 2000;

/// Engine and process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Packet bridge address (`host:port`)
    pub bridge_addr: String,

    /// Address the JSON API listens on
    pub api_addr: SocketAddr,

    /// Capacity of every (node, metric) history series
    pub history_maxlen: usize,

    /// Minimum spacing between two recorded points of the same series
    pub history_sample_secs: f64,

    /// Capacity of every conversation thread
    pub max_msgs_per_conv: usize,

    /// Window in which an echoed copy of our own message is ignored
    pub recent_send_suppress_secs: f64,

    /// Number of packet ids remembered for de-duplication
    pub dedup_capacity: usize,

    /// Default for requesting an ACK on outbound text
    pub want_ack: bool,

    /// Bridge connect timeout
    pub connect_timeout: Duration,

    /// Upper bound of the reconnect backoff
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_addr: "127.0.0.1:4403".to_string(),
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            history_maxlen: DEFAULT_HISTORY_MAXLEN,
            history_sample_secs: DEFAULT_HISTORY_SAMPLE_SECS,
            max_msgs_per_conv: DEFAULT_MAX_MSGS_PER_CONV,
            recent_send_suppress_secs: 5.0,
            dedup_capacity: 10_000,
            want_ack: true,
            connect_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create config from command line arguments, then apply environment overrides
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::parse_args(args)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn parse_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(MeshError::Config(format!(
                "Usage: {} <bridge-host:port> [--api-port <port>] [--history-maxlen <n>] [--sample-secs <secs>] [--max-msgs <n>] [--no-ack]",
                args.first().map(String::as_str).unwrap_or("meshdash")
            )));
        }

        let mut config = Self {
            bridge_addr: args[1].clone(),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--api-port" => {
                    let port: u16 = parse_flag(args, i, "--api-port")?;
                    config.api_addr = SocketAddr::from(([127, 0, 0, 1], port));
                    i += 2;
                }
                "--history-maxlen" => {
                    config.history_maxlen = parse_flag(args, i, "--history-maxlen")?;
                    i += 2;
                }
                "--sample-secs" => {
                    config.history_sample_secs = parse_flag(args, i, "--sample-secs")?;
                    i += 2;
                }
                "--max-msgs" => {
                    config.max_msgs_per_conv = parse_flag(args, i, "--max-msgs")?;
                    i += 2;
                }
                "--no-ack" => {
                    config.want_ack = false;
                    i += 1;
                }
                other => {
                    return Err(MeshError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        Ok(config)
    }

    /// Apply `HISTORY_MAXLEN`, `HISTORY_SAMPLE_SECS`, `MAX_MSGS_PER_CONV` and
    /// `MESHDASH_API_PORT` from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HISTORY_MAXLEN") {
            self.history_maxlen = parse_env("HISTORY_MAXLEN", &v)?;
        }
        if let Some(v) = lookup("HISTORY_SAMPLE_SECS") {
            self.history_sample_secs = parse_env("HISTORY_SAMPLE_SECS", &v)?;
        }
        if let Some(v) = lookup("MAX_MSGS_PER_CONV") {
            self.max_msgs_per_conv = parse_env("MAX_MSGS_PER_CONV", &v)?;
        }
        // A malformed port is ignored.
        if let Some(p) = lookup("MESHDASH_API_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.api_addr = SocketAddr::from(([127, 0, 0, 1], p));
        }
        Ok(())
    }

    /// Reject values the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.history_maxlen == 0 {
            return Err(MeshError::Config("HISTORY_MAXLEN must be at least 1".to_string()));
        }
        if !self.history_sample_secs.is_finite() || self.history_sample_secs < 0.0 {
            return Err(MeshError::Config(
                "HISTORY_SAMPLE_SECS must be a finite, non-negative number".to_string(),
            ));
        }
        if self.max_msgs_per_conv == 0 {
            return Err(MeshError::Config("MAX_MSGS_PER_CONV must be at least 1".to_string()));
        }
        if self.bridge_addr.trim().is_empty() {
            return Err(MeshError::Config("bridge address must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_flag<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| MeshError::Config(format!("{} requires a value", flag)))?;
    raw.parse::<T>()
        .map_err(|_| MeshError::Config(format!("{} got an invalid value: {}", flag, raw)))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| MeshError::Config(format!("{} has an invalid value: {}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_match_dashboard_limits() {
        let config = Config::default();
        assert_eq!(config.history_maxlen, 300);
        assert_eq!(config.history_sample_secs, 2.0);
        assert_eq!(config.max_msgs_per_conv, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::parse_args(&args(&[
            "meshdash",
            "192.168.0.91:4403",
            "--api-port",
            "9090",
            "--history-maxlen",
            "3",
            "--sample-secs",
            "0.5",
            "--no-ack",
        ]))
        .unwrap();
        assert_eq!(config.bridge_addr, "192.168.0.91:4403");
        assert_eq!(config.api_addr.port(), 9090);
        assert_eq!(config.history_maxlen, 3);
        assert_eq!(config.history_sample_secs, 0.5);
        assert!(!config.want_ack);
    }

    #[test]
    fn test_missing_bridge_is_usage_error() {
        let err = Config::parse_args(&args(&["meshdash"])).unwrap_err();
        assert!(err.to_string().contains("Usage"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HISTORY_MAXLEN", "10"),
            ("HISTORY_SAMPLE_SECS", "4.5"),
            ("MAX_MSGS_PER_CONV", "50"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.history_maxlen, 10);
        assert_eq!(config.history_sample_secs, 4.5);
        assert_eq!(config.max_msgs_per_conv, 50);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_env(|k| (k == "HISTORY_MAXLEN").then(|| "lots".to_string()))
            .is_err());

        config.history_maxlen = 0;
        assert!(config.validate().is_err());

        let config = Config {
            history_sample_secs: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
