//! # samovar
//!
//! A distributed two-tier metric aggregation pipeline.
//!
//! Edge (`local`) nodes ingest high-volume samples over the line and
//! binary dialects, aggregate them into mergeable per-family sketches for
//! one flush interval, and at the interval boundary either emit results to
//! their sinks or ship the partial sketches upstream. A consistent-hash
//! ring pins every metric name to one `global` node, which merges the
//! partials from the whole cluster and is the sole emitter of cluster-wide
//! percentiles, extrema, and cardinalities. A stateless `proxy` can sit in
//! between to fan streams out across the global tier.
//!
//! ## Topology
//!
//! ```text
//! apps ──udp/tcp──▶ local ──grpc──▶ proxy ──grpc──▶ global ──▶ sinks
//!                     │                                 ▲
//!                     └────────────── sinks             └── ring(membership)
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use samovar::{Config, HashRing, PipelineStats, Server};
//!
//! # async fn run() -> Result<(), samovar::PipelineError> {
//! let config = Config::from_file("samovar.json")?;
//! config.validate()?;
//!
//! let ring = Arc::new(HashRing::default());
//! ring.set_members(config.initial_members());
//! let sinks = samovar::sink::build_sinks(&config.sinks)?;
//! let server = Arc::new(Server::new(
//!     &config,
//!     sinks,
//!     ring,
//!     Arc::new(PipelineStats::default()),
//! ));
//! let flush = samovar::server::spawn_flush_loop(server.clone());
//! # drop(flush);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod discovery;
mod error;
pub mod forward;
pub mod ingest;
pub mod metrics;
pub mod proxy;
pub mod ring;
pub mod rpc;
pub mod server;
pub mod sink;
pub mod sketch;
pub mod stats;
pub mod worker;

pub use config::{Config, Mode, SinkConfig, SinkKind};
pub use discovery::{Discovery, StaticDiscovery};
pub use error::{ConfigError, ParseError, PipelineError, SinkError, SketchError};
pub use metrics::{
    Aggregate, InterMetric, InterMetricKind, MetricKey, MetricKind, Sample, SampleValue, Scope,
};
pub use ring::HashRing;
pub use server::{ForwardService, Server};
pub use sink::{MemorySink, Sink};
pub use sketch::Sketch;
pub use stats::PipelineStats;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
