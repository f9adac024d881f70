//! Configuration: the recognized options and their startup validation.
//!
//! Loading is deliberately thin (a JSON file into serde derives); all the
//! interesting behavior is in [`Config::validate`], which refuses to start
//! the process on anything out of range.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::metrics::Aggregate;

/// Which role this process plays in the topology.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Edge aggregator: ingests raw samples, emits local-scope results,
    /// forwards global-scope sketches.
    Local,
    /// Cluster aggregator: ingests merged sketches over the forward RPC and
    /// is the sole emitter of cluster-wide results.
    Global,
    /// Stateless request-level router between locals and globals.
    Proxy,
}

/// One downstream sink.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Unique name; `sinkonly:` filters match against it.
    pub name: String,
    pub kind: SinkKind,
    /// Prefix prepended to every line the console sink writes.
    #[serde(default)]
    pub prefix: String,
}

/// Bundled sink implementations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Writes flushed records to stdout.
    Console,
    /// Accepts and discards everything.
    Blackhole,
    /// Buffers records in memory; used by tests and debugging sessions.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,

    /// Flush period in seconds. Ticks are aligned to wall-clock multiples.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Worker shard count.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Parallel ingest tasks per UDP listener.
    #[serde(default = "default_num_readers")]
    pub num_readers: usize,

    /// Quantiles emitted per histogram, each in `[0, 1]`.
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,

    /// Aggregates emitted per histogram.
    #[serde(default = "default_aggregates")]
    pub aggregates: Vec<Aggregate>,

    /// Receive buffer size per ingest reader.
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,

    /// Line-dialect listener (UDP and TCP on the same port).
    #[serde(default)]
    pub statsd_listen_address: Option<SocketAddr>,

    /// Length-prefixed binary listener (TCP).
    #[serde(default)]
    pub binary_listen_address: Option<SocketAddr>,

    /// Where a local node ships its partials when no discovery backend
    /// drives the ring.
    #[serde(default)]
    pub grpc_forward_address: Option<String>,

    /// Forward RPC listen address (global and proxy modes).
    #[serde(default)]
    pub grpc_address: Option<SocketAddr>,

    /// Ring refresh period; floor of one second.
    #[serde(default = "default_refresh_secs")]
    pub membership_refresh_interval_secs: u64,

    /// Service name handed to the discovery backend.
    #[serde(default = "default_service_name")]
    pub membership_service_name: String,

    /// Fixed upstream membership for static topologies.
    #[serde(default)]
    pub static_members: Vec<String>,

    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_num_workers() -> usize {
    4
}

fn default_num_readers() -> usize {
    1
}

fn default_percentiles() -> Vec<f64> {
    vec![0.5, 0.75, 0.99]
}

fn default_aggregates() -> Vec<Aggregate> {
    vec![Aggregate::Min, Aggregate::Max, Aggregate::Count]
}

fn default_read_buffer_bytes() -> usize {
    65_536
}

fn default_refresh_secs() -> u64 {
    10
}

fn default_service_name() -> String {
    "samovar-global".to_string()
}

impl Config {
    /// Parses a config from its JSON rendering.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the document does not match the
    /// recognized options.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::new(err.to_string()))
    }

    /// Reads and parses a JSON config file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on unreadable or unparsable input.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| ConfigError::new(format!("{}: {err}", path.as_ref().display())))?;
        Self::from_json(&raw)
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn membership_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.membership_refresh_interval_secs)
    }

    /// Checks every recognized option; the process refuses to start on the
    /// first violation.
    ///
    /// # Errors
    /// Returns [`ConfigError`] describing the offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::new("interval_secs must be positive"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::new("num_workers must be positive"));
        }
        if self.num_readers == 0 {
            return Err(ConfigError::new("num_readers must be positive"));
        }
        if self.read_buffer_bytes == 0 {
            return Err(ConfigError::new("read_buffer_bytes must be positive"));
        }
        for &p in &self.percentiles {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::new(format!(
                    "percentile {p} outside [0, 1]"
                )));
            }
        }
        if self.membership_refresh_interval_secs == 0 {
            return Err(ConfigError::new(
                "membership_refresh_interval_secs must be at least 1",
            ));
        }
        match self.mode {
            Mode::Local => {
                if self.grpc_forward_address.is_none() && self.static_members.is_empty() {
                    return Err(ConfigError::new(
                        "local mode needs grpc_forward_address or static_members",
                    ));
                }
            }
            Mode::Global | Mode::Proxy => {
                if self.grpc_address.is_none() {
                    return Err(ConfigError::new(
                        "global and proxy modes need grpc_address",
                    ));
                }
                if self.mode == Mode::Proxy && self.static_members.is_empty() {
                    // A proxy without a backend and without static members
                    // would route every stream to nowhere.
                    return Err(ConfigError::new(
                        "proxy mode needs static_members (or an external discovery backend)",
                    ));
                }
            }
        }
        let mut names: Vec<&str> = self.sinks.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.sinks.len() {
            return Err(ConfigError::new("sink names must be unique"));
        }
        Ok(())
    }

    /// The upstream membership this node starts from before any discovery
    /// refresh: the explicit forward address when present, otherwise the
    /// static member list.
    #[must_use]
    pub fn initial_members(&self) -> Vec<String> {
        self.grpc_forward_address
            .clone()
            .map_or_else(|| self.static_members.clone(), |addr| vec![addr])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::from_json(
            r#"{
                "mode": "local",
                "statsd_listen_address": "127.0.0.1:8126",
                "grpc_forward_address": "127.0.0.1:8128",
                "sinks": [{"name": "console", "kind": "console"}]
            }"#,
        )
        .expect("valid config")
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.interval_secs, 10);
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.percentiles, vec![0.5, 0.75, 0.99]);
        assert_eq!(
            config.aggregates,
            vec![Aggregate::Min, Aggregate::Max, Aggregate::Count]
        );
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_unknown_options_are_refused() {
        let err = Config::from_json(r#"{"mode": "local", "no_such_option": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_percentile_range_is_enforced() {
        let mut config = base();
        config.percentiles = vec![0.5, 1.5];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_is_refused() {
        let mut config = base();
        config.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refresh_floor_is_enforced() {
        let mut config = base();
        config.membership_refresh_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_mode_needs_an_upstream() {
        let mut config = base();
        config.grpc_forward_address = None;
        config.static_members = vec![];
        assert!(config.validate().is_err());
        config.static_members = vec!["127.0.0.1:8128".to_string()];
        config.validate().expect("static members suffice");
    }

    #[test]
    fn test_global_mode_needs_grpc_address() {
        let config = Config::from_json(r#"{"mode": "global"}"#).expect("parses");
        assert!(config.validate().is_err());
        let config =
            Config::from_json(r#"{"mode": "global", "grpc_address": "127.0.0.1:8128"}"#)
                .expect("parses");
        config.validate().expect("valid");
    }

    #[test]
    fn test_duplicate_sink_names_are_refused() {
        let mut config = base();
        config.sinks.push(SinkConfig {
            name: "console".to_string(),
            kind: SinkKind::Blackhole,
            prefix: String::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_members_prefers_forward_address() {
        let mut config = base();
        config.static_members = vec!["a:1".to_string()];
        assert_eq!(config.initial_members(), vec!["127.0.0.1:8128".to_string()]);
        config.grpc_forward_address = None;
        assert_eq!(config.initial_members(), vec!["a:1".to_string()]);
    }
}
