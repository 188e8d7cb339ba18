//! Smart parking pipeline: per-camera stall occupancy, carpark rollups and
//! MJPEG previews.
//!
//! The crate is split into focused modules:
//! - `config`: camera config file and CLI settings.
//! - `geometry`: stall boxes loaded from Pascal VOC annotations.
//! - `matcher` / `smoother`: detection-to-stall matching and the temporal mode filter.
//! - `worker`: one capture → detect → publish loop per camera.
//! - `aggregator` / `sink`: the Site → Level → Row tree and its time-series output.
//! - `state` / `server` / `mosaic`: frame hand-off and the Actix Web endpoints.
//! - `pipeline`: startup checks, thread wiring and shutdown.
//! - `telemetry` / `watchdog`: tracing, Prometheus and stream starvation limits.

pub mod aggregator;
pub mod annotation;
pub mod config;
pub mod geometry;
pub mod matcher;
pub mod mosaic;
pub mod pipeline;
pub mod record;
pub mod server;
pub mod sink;
pub mod smoother;
pub mod state;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

pub use aggregator::{CarparkTree, spawn_aggregator};
pub use config::{CarparkConfig, ConfigError, ServeArgs, ServerConfig};
/// Launch the pipeline with a ready-made configuration.
pub use pipeline::{DetectorFactory, SourceFactory, run};
pub use record::{Rollup, RowAddress, RowOccupancy, RowRecord};
pub use sink::{InfluxSink, LogSink, MemorySink, MetricsSink};
