//! Configuration for the parking server.
//!
//! Two inputs are handled here: the camera config JSON describing every
//! camera row, and the CLI arguments of the `serve` subcommand. Both are
//! validated up front so a bad entry stops the process before any worker runs.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use clap::Args;
use serde::Deserialize;
use thiserror::Error;
use video_ingest::{SourceKind, has_video_extension, parse_device_index};

use crate::{matcher::MatchThresholds, record::RowAddress};

/// Inference devices a camera entry may request.
pub const COMPATIBLE_DEVICES: [&str; 6] = ["CPU", "GPU", "GPU.0", "GPU.1", "HDDL", "MYRIAD"];

/// Analytics categories; at least one must appear in a camera's `analytics` field.
pub const ANALYTICS_CATEGORIES: [&str; 3] = ["pedestrian", "vehicle", "bike"];

/// Accepted frame rate range for capture and streaming.
pub const MIN_FPS: f32 = 0.01;
pub const MAX_FPS: f32 = 1000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", path.display())]
    Missing { path: PathBuf },
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file lists no cameras")]
    Empty,
    #[error(
        "camera #{camera}: invalid `address` value `{value}`; expected three alphanumeric parts `site_level_row`"
    )]
    Address { camera: usize, value: String },
    #[error(
        "camera #{camera}: invalid `analytics` value `{value}`; use any of `pedestrian`, `vehicle`, `bike` separated by spaces"
    )]
    Analytics { camera: usize, value: String },
    #[error("camera #{camera}: invalid `device` value `{value}`; possible devices are {}", COMPATIBLE_DEVICES.join(" "))]
    Device { camera: usize, value: String },
    #[error("camera #{camera}: `path` value `{value}` {reason}")]
    SourcePath {
        camera: usize,
        value: String,
        reason: &'static str,
    },
    #[error("camera #{camera}: `bboxes` value `{}` {reason}", value.display())]
    Geometry {
        camera: usize,
        value: PathBuf,
        reason: &'static str,
    },
}

/// One entry of the `cameras` array.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    /// `site_level_row` identifier of the row this camera watches.
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Space separated analytics categories.
    pub analytics: String,
    /// Inference device, e.g. `CPU`, `GPU.0`, or `MULTI:GPU.0,CPU`.
    pub device: String,
    /// Source URI or file path.
    pub path: String,
    /// Pascal VOC annotation holding the stall boxes.
    pub bboxes: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    cameras: Vec<CameraConfig>,
}

/// Validated camera config.
#[derive(Debug, Clone)]
pub struct CarparkConfig {
    pub cameras: Vec<CameraConfig>,
    /// Union of the devices requested across cameras, sorted.
    pub devices: Vec<String>,
}

impl CarparkConfig {
    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> std::result::Result<Self, ConfigError> {
        let file: CameraConfigFile =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        if file.cameras.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut devices = BTreeSet::new();
        for (index, camera) in file.cameras.iter().enumerate() {
            devices.extend(camera.validate(index)?);
        }

        Ok(Self {
            cameras: file.cameras,
            devices: devices.into_iter().collect(),
        })
    }
}

impl CameraConfig {
    /// Parsed `site_level_row` address. Valid for any camera that passed validation.
    pub fn row_address(&self) -> Option<RowAddress> {
        RowAddress::parse(&self.address)
    }

    /// Check every field and return the devices this camera needs.
    fn validate(&self, camera: usize) -> std::result::Result<Vec<String>, ConfigError> {
        if self.row_address().is_none() {
            return Err(ConfigError::Address {
                camera,
                value: self.address.clone(),
            });
        }

        let compact: String = self.analytics.split_whitespace().collect();
        let mentions_category = ANALYTICS_CATEGORIES
            .iter()
            .any(|category| self.analytics.contains(category));
        if !mentions_category || !compact.chars().all(char::is_alphanumeric) {
            return Err(ConfigError::Analytics {
                camera,
                value: self.analytics.clone(),
            });
        }

        let devices = requested_devices(&self.device).ok_or_else(|| ConfigError::Device {
            camera,
            value: self.device.clone(),
        })?;

        self.validate_source(camera)?;

        if self.bboxes.to_string_lossy().contains("://") {
            return Err(ConfigError::Geometry {
                camera,
                value: self.bboxes.clone(),
                reason: "must be a local file",
            });
        }
        if !self.bboxes.is_file() {
            return Err(ConfigError::Geometry {
                camera,
                value: self.bboxes.clone(),
                reason: "does not exist",
            });
        }

        Ok(devices)
    }

    fn validate_source(&self, camera: usize) -> std::result::Result<(), ConfigError> {
        let error = |reason| ConfigError::SourcePath {
            camera,
            value: self.path.clone(),
            reason,
        };

        let kind = SourceKind::from_uri(&self.path);
        if self.path.contains("://") {
            return match kind {
                Some(SourceKind::Rtsp | SourceKind::Udp) => Ok(()),
                _ => Err(error("uses an unsupported stream scheme")),
            };
        }
        if parse_device_index(&self.path).is_some() && !self.path.starts_with('/') {
            return Ok(());
        }
        if !Path::new(&self.path).exists() {
            return Err(error("does not exist"));
        }
        if !self.path.contains("/dev/video") && !has_video_extension(&self.path) {
            return Err(error("is not a valid video file"));
        }
        Ok(())
    }
}

/// Expand a device string into its members, or `None` when any member is unsupported.
fn requested_devices(device: &str) -> Option<Vec<String>> {
    if COMPATIBLE_DEVICES.contains(&device) {
        return Some(vec![device.to_string()]);
    }
    let list = device.strip_prefix("MULTI:")?;
    let members: Vec<String> = list.split(',').map(|d| d.trim().to_string()).collect();
    if members.is_empty()
        || members
            .iter()
            .any(|member| !COMPATIBLE_DEVICES.contains(&member.as_str()))
    {
        return None;
    }
    Some(members)
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Connection details for the InfluxDB 1.x metrics store.
pub struct InfluxOptions {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Minimum spacing between writes; snapshots arriving sooner are skipped.
    pub min_interval: Duration,
}

#[derive(Clone, Debug)]
/// Runtime settings shared by every stage of the server.
pub struct ServerConfig {
    pub config_path: PathBuf,
    pub model_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub broadcast_width: i32,
    pub broadcast_height: i32,
    pub capture_fps: f32,
    pub stream_fps: f32,
    pub jpeg_quality: u8,
    pub confidence_threshold: f32,
    pub thresholds: MatchThresholds,
    pub smoothing_window: usize,
    pub aggregation_queue: usize,
    pub influx: Option<InfluxOptions>,
    pub telemetry: TelemetryOptions,
}

impl ServerConfig {
    pub fn broadcast_size(&self) -> (i32, i32) {
        (self.broadcast_width, self.broadcast_height)
    }

    pub fn capture_interval(&self) -> Duration {
        frame_interval(self.capture_fps)
    }

    pub fn stream_interval(&self) -> Duration {
        frame_interval(self.stream_fps)
    }
}

/// Period of one frame at `fps`, clamped to `[1 / MAX_FPS, 1 / MIN_FPS]`.
/// Rates that give no representable period use the longest one.
pub fn frame_interval(fps: f32) -> Duration {
    const SHORTEST: Duration = Duration::from_millis(1);
    const LONGEST: Duration = Duration::from_secs(100);
    Duration::try_from_secs_f64(1.0 / f64::from(fps))
        .map_or(LONGEST, |interval| interval.clamp(SHORTEST, LONGEST))
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Camera config JSON.
    #[arg(short = 'c', long = "config", default_value = "./configs/camera_config.json")]
    pub config_path: PathBuf,
    /// TorchScript vehicle detector.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Address the preview server binds to.
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    /// Width every frame is letterboxed to.
    #[arg(long = "broadcast-width", default_value_t = 1920)]
    pub broadcast_width: i32,
    /// Height every frame is letterboxed to.
    #[arg(long = "broadcast-height", default_value_t = 1080)]
    pub broadcast_height: i32,
    /// Target iterations per second for each camera worker.
    #[arg(long = "capture-fps", default_value_t = 20.0)]
    pub capture_fps: f32,
    /// Frame rate cap of the MJPEG streams.
    #[arg(long = "stream-fps", default_value_t = 30.0)]
    pub stream_fps: f32,
    /// JPEG quality used by the stream encoder (1-100).
    #[arg(long = "jpeg-quality", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Minimum detector score for a vehicle box.
    #[arg(long = "confidence", default_value_t = 0.6)]
    pub confidence: f32,
    /// Maximum centroid distance in pixels between a vehicle and its stall.
    #[arg(long = "distance-threshold", default_value_t = 50.0)]
    pub distance_threshold: f32,
    /// Minimum IoU between a vehicle and its nearest stall.
    #[arg(long = "iou-threshold", default_value_t = 0.5)]
    pub iou_threshold: f32,
    /// Number of frames in the majority-vote window.
    #[arg(long = "window", default_value_t = 30)]
    pub window: usize,
    /// Capacity of the queue feeding the aggregator.
    #[arg(long = "aggregation-queue", default_value_t = 256)]
    pub aggregation_queue: usize,
    /// InfluxDB base URL; occupancy is only logged when omitted.
    #[arg(long = "influx-url", value_name = "URL")]
    pub influx_url: Option<String>,
    #[arg(long = "influx-db", default_value = "carpark_data")]
    pub influx_db: String,
    #[arg(long = "influx-user", default_value = "admin")]
    pub influx_user: String,
    #[arg(long = "influx-password", default_value = "admin")]
    pub influx_password: String,
    /// Minimum milliseconds between InfluxDB writes.
    #[arg(long = "influx-interval-ms", default_value_t = 1000)]
    pub influx_interval_ms: u64,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        if args.broadcast_width <= 0 || args.broadcast_height <= 0 {
            bail!("Broadcast width and height must be positive integers");
        }
        if !(MIN_FPS..=MAX_FPS).contains(&args.capture_fps) {
            bail!("--capture-fps must be between {MIN_FPS} and {MAX_FPS}");
        }
        if !(MIN_FPS..=MAX_FPS).contains(&args.stream_fps) {
            bail!("--stream-fps must be between {MIN_FPS} and {MAX_FPS}");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if !(args.confidence > 0.0 && args.confidence <= 1.0) {
            bail!("--confidence must be in (0, 1]");
        }
        if args.distance_threshold < 0.0 {
            bail!("--distance-threshold must not be negative");
        }
        if !(args.iou_threshold > 0.0 && args.iou_threshold <= 1.0) {
            bail!("--iou-threshold must be in (0, 1]");
        }
        if args.window == 0 {
            bail!("--window must be at least 1");
        }
        if args.aggregation_queue == 0 {
            bail!("--aggregation-queue must be at least 1");
        }

        let influx = args.influx_url.map(|url| InfluxOptions {
            url: url.trim_end_matches('/').to_string(),
            database: args.influx_db,
            username: args.influx_user,
            password: args.influx_password,
            min_interval: Duration::from_millis(args.influx_interval_ms),
        });

        Ok(Self {
            config_path: args.config_path,
            model_path: args.model_path,
            host: args.host,
            port: args.port,
            broadcast_width: args.broadcast_width,
            broadcast_height: args.broadcast_height,
            capture_fps: args.capture_fps,
            stream_fps: args.stream_fps,
            jpeg_quality: args.jpeg_quality,
            confidence_threshold: args.confidence,
            thresholds: MatchThresholds {
                distance: args.distance_threshold,
                iou: args.iou_threshold,
            },
            smoothing_window: args.window,
            aggregation_queue: args.aggregation_queue,
            influx,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    struct Fixture {
        dir: TempDir,
        video: PathBuf,
        bboxes: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let video = dir.path().join("lot.mp4");
            let bboxes = dir.path().join("lot.xml");
            fs::write(&video, b"").unwrap();
            fs::write(&bboxes, b"<annotation/>").unwrap();
            Self { dir, video, bboxes }
        }

        fn camera(&self, address: &str, device: &str) -> serde_json::Value {
            serde_json::json!({
                "address": address,
                "latitude": 1.35,
                "longitude": 103.8,
                "analytics": "vehicle",
                "device": device,
                "path": self.video,
                "bboxes": self.bboxes,
            })
        }

        fn config(&self, cameras: Vec<serde_json::Value>) -> String {
            serde_json::json!({ "cameras": cameras }).to_string()
        }
    }

    #[test]
    fn accepts_valid_config_and_collects_devices() {
        let fx = Fixture::new();
        let raw = fx.config(vec![
            fx.camera("SiteA_L1_R1", "CPU"),
            fx.camera("SiteA_L1_R2", "MULTI:GPU.0,CPU"),
        ]);
        let config = CarparkConfig::from_json(&raw).unwrap();
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.devices, vec!["CPU".to_string(), "GPU.0".to_string()]);
        assert_eq!(config.cameras[1].row_address().unwrap().row, "R2");
        drop(fx.dir);
    }

    #[test]
    fn rejects_empty_camera_list() {
        assert!(matches!(
            CarparkConfig::from_json(r#"{"cameras": []}"#),
            Err(ConfigError::Empty)
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let fx = Fixture::new();
        let mut camera = fx.camera("SiteA_L1_R1", "CPU");
        camera["colour"] = serde_json::json!("red");
        let err = CarparkConfig::from_json(&fx.config(vec![camera])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn rejects_bad_address() {
        let fx = Fixture::new();
        let err = CarparkConfig::from_json(&fx.config(vec![fx.camera("SiteA-L1", "CPU")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Address { camera: 0, .. }));
    }

    #[test]
    fn rejects_bad_device() {
        let fx = Fixture::new();
        for device in ["TPU", "MULTI:GPU.0,TPU", "MULTI:"] {
            let err = CarparkConfig::from_json(&fx.config(vec![fx.camera("A_B_C", device)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::Device { .. }),
                "{device} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_bad_analytics() {
        let fx = Fixture::new();
        let mut camera = fx.camera("A_B_C", "CPU");
        camera["analytics"] = serde_json::json!("faces");
        let err = CarparkConfig::from_json(&fx.config(vec![camera])).unwrap_err();
        assert!(matches!(err, ConfigError::Analytics { .. }));
    }

    #[test]
    fn rejects_missing_sources() {
        let fx = Fixture::new();
        let mut camera = fx.camera("A_B_C", "CPU");
        camera["path"] = serde_json::json!(fx.dir.path().join("missing.mp4"));
        let err = CarparkConfig::from_json(&fx.config(vec![camera])).unwrap_err();
        assert!(matches!(err, ConfigError::SourcePath { reason: "does not exist", .. }));

        let notes = fx.dir.path().join("notes.txt");
        fs::write(&notes, b"").unwrap();
        let mut camera = fx.camera("A_B_C", "CPU");
        camera["path"] = serde_json::json!(notes);
        let err = CarparkConfig::from_json(&fx.config(vec![camera])).unwrap_err();
        assert!(matches!(err, ConfigError::SourcePath { .. }));

        let mut camera = fx.camera("A_B_C", "CPU");
        camera["bboxes"] = serde_json::json!(fx.dir.path().join("missing.xml"));
        let err = CarparkConfig::from_json(&fx.config(vec![camera])).unwrap_err();
        assert!(matches!(err, ConfigError::Geometry { .. }));
    }

    #[test]
    fn accepts_stream_and_index_sources() {
        let fx = Fixture::new();
        let mut rtsp = fx.camera("A_B_C", "CPU");
        rtsp["path"] = serde_json::json!("rtsp://10.0.0.2/stream");
        let mut index = fx.camera("A_B_D", "CPU");
        index["path"] = serde_json::json!("0");
        assert!(CarparkConfig::from_json(&fx.config(vec![rtsp, index])).is_ok());

        let mut http = fx.camera("A_B_C", "CPU");
        http["path"] = serde_json::json!("http://10.0.0.2/stream");
        assert!(CarparkConfig::from_json(&fx.config(vec![http])).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = CarparkConfig::load(Path::new("/nonexistent/camera.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn load_reads_file() {
        let fx = Fixture::new();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(fx.config(vec![fx.camera("A_B_C", "GPU")]).as_bytes())
            .unwrap();
        let config = CarparkConfig::load(file.path()).unwrap();
        assert_eq!(config.devices, vec!["GPU".to_string()]);
    }

    fn serve_args() -> ServeArgs {
        ServeArgs {
            config_path: PathBuf::from("camera.json"),
            model_path: None,
            host: "127.0.0.1".into(),
            port: 8000,
            broadcast_width: 1920,
            broadcast_height: 1080,
            capture_fps: 20.0,
            stream_fps: 30.0,
            jpeg_quality: 85,
            confidence: 0.6,
            distance_threshold: 50.0,
            iou_threshold: 0.5,
            window: 30,
            aggregation_queue: 16,
            influx_url: Some("http://influxdb:8086/".into()),
            influx_db: "carpark_data".into(),
            influx_user: "admin".into(),
            influx_password: "admin".into(),
            influx_interval_ms: 1000,
            chrome_trace: None,
        }
    }

    #[test]
    fn serve_args_convert() {
        let config = ServerConfig::try_from(serve_args()).unwrap();
        assert_eq!(config.broadcast_size(), (1920, 1080));
        assert_eq!(config.influx.as_ref().unwrap().url, "http://influxdb:8086");
        assert_eq!(config.capture_interval(), Duration::from_millis(50));
        assert_eq!(config.stream_interval(), Duration::from_nanos(33_333_333));
        assert_eq!(config.confidence_threshold, 0.6);
    }

    #[test]
    fn frame_rates_outside_range_are_rejected() {
        for fps in [1e-20, 0.0, -1.0, f32::NAN, f32::INFINITY, 5000.0] {
            let mut args = serve_args();
            args.capture_fps = fps;
            assert!(ServerConfig::try_from(args).is_err(), "capture {fps}");

            let mut args = serve_args();
            args.stream_fps = fps;
            assert!(ServerConfig::try_from(args).is_err(), "stream {fps}");
        }
    }

    #[test]
    fn frame_interval_is_clamped() {
        assert_eq!(frame_interval(1e-20), Duration::from_secs(100));
        assert_eq!(frame_interval(f32::NAN), Duration::from_secs(100));
        assert_eq!(frame_interval(1e9), Duration::from_millis(1));
        assert_eq!(frame_interval(4.0), Duration::from_millis(250));
    }

    #[test]
    fn serve_args_reject_bad_values() {
        let mut args = serve_args();
        args.window = 0;
        assert!(ServerConfig::try_from(args).is_err());

        let mut args = serve_args();
        args.iou_threshold = 1.5;
        assert!(ServerConfig::try_from(args).is_err());

        let mut args = serve_args();
        args.jpeg_quality = 0;
        assert!(ServerConfig::try_from(args).is_err());

        let mut args = serve_args();
        args.confidence = 0.0;
        assert!(ServerConfig::try_from(args).is_err());
    }
}
