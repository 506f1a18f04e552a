use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_SESSION_TTL;

/// Server settings, read from `ENROLLD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Operator password for the Postgres startup handshake.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub session_ttl: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "enrolld".into(),
            max_connections: 256,
            compact_threshold: 1000,
            session_ttl: Duration::from_secs(30 * 60),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparseable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_var(&lookup, "ENROLLD_PORT").unwrap_or(defaults.port),
            bind: lookup("ENROLLD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("ENROLLD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("ENROLLD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "ENROLLD_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "ENROLLD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            session_ttl: parse_var(&lookup, "ENROLLD_SESSION_TTL_SECS")
                .map(|secs| Duration::from_secs(secs).min(MAX_SESSION_TTL))
                .unwrap_or(defaults.session_ttl),
            metrics_port: parse_var(&lookup, "ENROLLD_METRICS_PORT"),
            tls_cert: lookup("ENROLLD_TLS_CERT"),
            tls_key: lookup("ENROLLD_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.session_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("ENROLLD_PORT", "6000"),
            ("ENROLLD_BIND", "127.0.0.1"),
            ("ENROLLD_DATA_DIR", "/var/lib/enrolld"),
            ("ENROLLD_MAX_CONNECTIONS", "8"),
            ("ENROLLD_COMPACT_THRESHOLD", "50"),
            ("ENROLLD_SESSION_TTL_SECS", "5"),
            ("ENROLLD_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/enrolld"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.session_ttl, Duration::from_secs(5));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn session_ttl_is_clamped() {
        let config = from_pairs(&[("ENROLLD_SESSION_TTL_SECS", "18446744073709551615")]);
        assert_eq!(config.session_ttl, MAX_SESSION_TTL);
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let config = from_pairs(&[("ENROLLD_PORT", "http"), ("ENROLLD_METRICS_PORT", "")]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.metrics_port, None);
    }
}
