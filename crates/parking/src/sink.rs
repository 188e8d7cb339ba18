//! Metrics sinks receiving the carpark tree after every merge.
//!
//! The tree is flattened into three measurement groups before it leaves the
//! process: `detail` (one point per row), `summary_level` and `summary_site`.

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{aggregator::CarparkTree, config::InfluxOptions, record::Rollup};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metrics store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics store responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Destination for the merged carpark tree.
pub trait MetricsSink: Send {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    fn write(&mut self, tree: &CarparkTree) -> Result<(), SinkError>;
}

/// One time-series point with integer fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub measurement: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub fields: Vec<(String, i64)>,
}

impl Point {
    fn with_rollup(measurement: &'static str, tags: Vec<(&'static str, String)>, rollup: Rollup) -> Self {
        let mut point = Self {
            measurement,
            tags,
            fields: Vec::with_capacity(3),
        };
        point.push_rollup(rollup);
        point
    }

    fn push_rollup(&mut self, rollup: Rollup) {
        self.fields.push(("Total".into(), i64::from(rollup.total)));
        self.fields.push(("Occupied".into(), i64::from(rollup.occupied)));
        self.fields.push(("Unoccupied".into(), i64::from(rollup.unoccupied)));
    }

    pub fn field(&self, name: &str) -> Option<i64> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Render as one line of InfluxDB line protocol with a millisecond timestamp.
    pub fn to_line(&self, timestamp_ms: i64) -> String {
        let mut line = escape(self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={value}i", escape(key, &[',', '=', ' '])))
            .collect();
        let _ = write!(line, " {} {timestamp_ms}", fields.join(","));
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '\\' || special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Flatten the tree into `detail`, `summary_level` and `summary_site` points.
pub fn tree_points(tree: &CarparkTree) -> Vec<Point> {
    let mut detail = Vec::new();
    let mut levels = Vec::new();
    let mut sites = Vec::new();

    for (site_name, site) in &tree.sites {
        for (level_name, level) in &site.levels {
            for (row_name, row) in &level.rows {
                let mut point = Point {
                    measurement: "detail",
                    tags: vec![
                        ("Site", site_name.clone()),
                        ("Level", level_name.clone()),
                        ("Row", row_name.clone()),
                    ],
                    fields: row
                        .stalls
                        .iter()
                        .map(|(stall, state)| (format!("C{stall}"), i64::from(*state)))
                        .collect(),
                };
                point.push_rollup(row.summary);
                detail.push(point);
            }
            levels.push(Point::with_rollup(
                "summary_level",
                vec![("Site", site_name.clone()), ("Level", level_name.clone())],
                level.summary,
            ));
        }
        sites.push(Point::with_rollup(
            "summary_site",
            vec![("Site", site_name.clone())],
            site.summary,
        ));
    }

    detail.extend(levels);
    detail.extend(sites);
    detail
}

/// Writes points to an InfluxDB 1.x HTTP endpoint.
pub struct InfluxSink {
    client: reqwest::blocking::Client,
    options: InfluxOptions,
    database_ready: bool,
    last_write: Option<Instant>,
}

impl InfluxSink {
    pub fn new(options: InfluxOptions) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            options,
            database_ready: false,
            last_write: None,
        })
    }

    fn ensure_database(&mut self) -> Result<(), SinkError> {
        if self.database_ready {
            return Ok(());
        }
        let statement = format!("CREATE DATABASE \"{}\"", self.options.database);
        let response = self
            .client
            .post(format!("{}/query", self.options.url))
            .basic_auth(&self.options.username, Some(&self.options.password))
            .query(&[("q", statement.as_str())])
            .send()?;
        check_status(response)?;
        info!(database = %self.options.database, "InfluxDB database ready");
        self.database_ready = true;
        Ok(())
    }

    fn due(&self, now: Instant) -> bool {
        match self.last_write {
            Some(last) => now.duration_since(last) >= self.options.min_interval,
            None => true,
        }
    }
}

impl MetricsSink for InfluxSink {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn write(&mut self, tree: &CarparkTree) -> Result<(), SinkError> {
        let now = Instant::now();
        if !self.due(now) {
            return Ok(());
        }
        // Failed attempts also start the interval.
        self.last_write = Some(now);
        self.ensure_database()?;

        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let body = tree_points(tree)
            .iter()
            .map(|point| point.to_line(timestamp_ms))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self
            .client
            .post(format!("{}/write", self.options.url))
            .basic_auth(&self.options.username, Some(&self.options.password))
            .query(&[("db", self.options.database.as_str()), ("precision", "ms")])
            .body(body)
            .send()?;
        check_status(response)
    }
}

fn check_status(response: reqwest::blocking::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().unwrap_or_default();
    Err(SinkError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Logs the flattened points at debug level. Used when no metrics store is configured.
#[derive(Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn write(&mut self, tree: &CarparkTree) -> Result<(), SinkError> {
        for point in tree_points(tree) {
            debug!(
                measurement = point.measurement,
                tags = ?point.tags,
                fields = ?point.fields,
                "occupancy point"
            );
        }
        Ok(())
    }
}

/// Keeps a copy of every tree it receives.
#[derive(Clone, Default)]
pub struct MemorySink {
    snapshots: Arc<Mutex<Vec<CarparkTree>>>,
}

impl MemorySink {
    pub fn snapshots(&self) -> Vec<CarparkTree> {
        match self.snapshots.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl MetricsSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&mut self, tree: &CarparkTree) -> Result<(), SinkError> {
        if let Ok(mut guard) = self.snapshots.lock() {
            guard.push(tree.clone());
        }
        Ok(())
    }
}
