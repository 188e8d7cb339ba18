//! Pipeline supervisor wiring camera workers, the aggregator and the
//! streaming server together.
//!
//! Startup is all-or-nothing: every device, stall annotation and camera
//! source is checked before the first worker thread is spawned.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use ml_core::VehicleDetector;
use tracing::{debug, info, warn};
use video_ingest::FrameSource;

use crate::{
    aggregator::{CarparkTree, spawn_aggregator},
    config::{CarparkConfig, ServerConfig},
    geometry::StallGeometry,
    server::{StreamOptions, StreamingServer, spawn_server},
    sink::{InfluxSink, LogSink, MetricsSink},
    state::ServerState,
    worker::{CameraWorker, WorkerHandle, WorkerSettings},
};

/// Opens frame sources from the `path` of a camera entry.
pub trait SourceFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;
}

/// Creates detectors and reports which devices can host them.
pub trait DetectorFactory {
    fn available_devices(&self) -> Vec<String>;

    fn create(&self, device: &str) -> Result<Box<dyn VehicleDetector>>;
}

/// A camera that passed every startup check, ready to become a worker.
pub struct PreparedCamera {
    pub settings: WorkerSettings,
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn VehicleDetector>,
}

/// Check devices, load stall geometry, probe every source and build detectors.
/// Any failure aborts before a single worker exists.
pub fn prepare_cameras(
    config: &ServerConfig,
    carpark: &CarparkConfig,
    sources: &dyn SourceFactory,
    detectors: &dyn DetectorFactory,
) -> Result<Vec<PreparedCamera>> {
    let available = detectors.available_devices();
    for device in &carpark.devices {
        if !available.contains(device) {
            bail!("Device not found - `{device}`. All available devices - {available:?}");
        }
    }
    debug!(?available, requested = ?carpark.devices, "Inference devices verified");

    let mut prepared = Vec::with_capacity(carpark.cameras.len());
    for (camera, entry) in carpark.cameras.iter().enumerate() {
        let Some(address) = entry.row_address() else {
            bail!("camera #{camera}: invalid address `{}`", entry.address);
        };

        let geometry = StallGeometry::load(&entry.bboxes, config.broadcast_size())
            .with_context(|| format!("camera #{camera} ({address})"))?;
        if geometry.is_empty() {
            warn!(camera, %address, "Stall annotation lists no stalls");
        }

        let mut source = sources
            .open(&entry.path)
            .with_context(|| format!("Unable to open source - `{}`", entry.path))?;
        match source.read() {
            Ok(Some(_)) => {}
            Ok(None) => bail!("Unable to open source - `{}`: no frame available", entry.path),
            Err(err) => {
                return Err(err).with_context(|| format!("Unable to open source - `{}`", entry.path));
            }
        }
        if source.kind().is_finite() {
            source
                .rewind()
                .with_context(|| format!("Unable to rewind source - `{}`", entry.path))?;
        }

        let detector = detectors
            .create(&entry.device)
            .with_context(|| format!("camera #{camera}: failed to create detector on {}", entry.device))?;

        info!(
            camera,
            %address,
            stalls = geometry.len(),
            source = %entry.path,
            device = %entry.device,
            "Camera ready"
        );
        prepared.push(PreparedCamera {
            settings: WorkerSettings {
                camera,
                address,
                stalls: geometry.stalls,
                thresholds: config.thresholds,
                smoothing_window: config.smoothing_window,
                broadcast: config.broadcast_size(),
                interval: config.capture_interval(),
            },
            source,
            detector,
        });
    }
    Ok(prepared)
}

/// InfluxDB when a URL is configured, otherwise debug logging.
pub fn build_sink(config: &ServerConfig) -> Result<Box<dyn MetricsSink>> {
    match config.influx.clone() {
        Some(options) => {
            info!(url = %options.url, database = %options.database, "Writing occupancy to InfluxDB");
            Ok(Box::new(InfluxSink::new(options).context("Failed to build InfluxDB client")?))
        }
        None => {
            info!("No InfluxDB URL configured; occupancy points are logged only");
            Ok(Box::new(LogSink))
        }
    }
}

/// Handles of a started pipeline.
pub struct RunningPipeline {
    workers: Vec<WorkerHandle>,
    aggregator: Option<thread::JoinHandle<CarparkTree>>,
    server: Option<StreamingServer>,
}

impl RunningPipeline {
    /// Stop the server, stop and join every worker, then drain the aggregator.
    /// Returns the final carpark tree.
    pub fn shutdown(mut self) -> CarparkTree {
        if let Some(server) = self.server.take() {
            server.stop();
        }
        for worker in &self.workers {
            worker.request_stop();
        }
        for worker in self.workers.drain(..) {
            debug!(camera = worker.camera(), "Joining camera worker");
            worker.join();
        }
        // Workers held the only senders; the aggregator sees the queue close.
        match self.aggregator.take().map(thread::JoinHandle::join) {
            Some(Ok(tree)) => tree,
            Some(Err(_)) => {
                warn!("Aggregator thread panicked");
                CarparkTree::new()
            }
            None => CarparkTree::new(),
        }
    }
}

/// Start the aggregator, one worker per camera, and the streaming server.
pub fn start(
    config: &ServerConfig,
    cameras: Vec<PreparedCamera>,
    sink: Box<dyn MetricsSink>,
) -> Result<RunningPipeline> {
    let addresses = cameras
        .iter()
        .map(|camera| camera.settings.address.to_string())
        .collect();
    let state = Arc::new(ServerState::new(addresses));

    let (record_tx, record_rx) = crossbeam_channel::bounded(config.aggregation_queue);
    let aggregator = spawn_aggregator(record_rx, sink)?;

    let mut running = RunningPipeline {
        workers: Vec::with_capacity(cameras.len()),
        aggregator: Some(aggregator),
        server: None,
    };

    for camera in cameras {
        let worker = CameraWorker::new(
            camera.settings,
            camera.source,
            camera.detector,
            record_tx.clone(),
            state.clone(),
        );
        match worker.spawn() {
            Ok(handle) => running.workers.push(handle),
            Err(err) => {
                drop(record_tx);
                running.shutdown();
                return Err(err);
            }
        }
    }
    drop(record_tx);

    match spawn_server(
        state,
        StreamOptions::from(config),
        (config.host.clone(), config.port),
    ) {
        Ok(server) => running.server = Some(server),
        Err(err) => {
            running.shutdown();
            return Err(err.context("Failed to start streaming server"));
        }
    }

    Ok(running)
}

/// Load the camera config, start everything and block until Ctrl+C.
pub fn run(
    config: ServerConfig,
    sources: &dyn SourceFactory,
    detectors: &dyn DetectorFactory,
) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let pipeline_span = tracing::info_span!(
        "parking.pipeline",
        config = %config.config_path.display(),
        host = %config.host,
        port = config.port,
        width = config.broadcast_width,
        height = config.broadcast_height
    );
    let _pipeline_guard = pipeline_span.enter();

    let carpark = CarparkConfig::load(&config.config_path)?;
    info!(
        cameras = carpark.cameras.len(),
        devices = ?carpark.devices,
        "Camera config loaded from {}",
        config.config_path.display()
    );

    let cameras = prepare_cameras(&config, &carpark, sources, detectors)?;
    let sink = build_sink(&config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let running = start(&config, cameras, sink)?;
    info!(
        "Streams available at http://{}:{}/camera/<id> and /camera/all; press Ctrl+C to stop",
        config.host, config.port
    );

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Stopping smart parking pipeline");
    let tree = running.shutdown();
    let summary = tree.carpark_summary();
    info!(
        total = summary.total,
        occupied = summary.occupied,
        unoccupied = summary.unoccupied,
        "Pipeline stopped"
    );
    debug!(tree = %tree.to_json(), "Final carpark state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        sync::atomic::AtomicUsize,
    };

    use anyhow::anyhow;
    use ml_core::BBox;
    use video_ingest::{CaptureError, Frame, SourceKind};

    use super::*;
    use crate::{
        config::{CameraConfig, TelemetryOptions},
        matcher::MatchThresholds,
        sink::MemorySink,
    };

    const VOC: &str = "<annotation><size><width>64</width><height>32</height></size>\
        <object><bndbox><xmin>0</xmin><ymin>0</ymin><xmax>31</xmax><ymax>31</ymax></bndbox></object>\
        <object><bndbox><xmin>32</xmin><ymin>0</ymin><xmax>63</xmax><ymax>31</ymax></bndbox></object>\
        </annotation>";

    struct LoopingSource {
        kind: SourceKind,
        empty: bool,
    }

    impl FrameSource for LoopingSource {
        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.empty {
                return Ok(None);
            }
            Ok(Some(Frame::from_bgr(vec![0; 64 * 32 * 3], 64, 32, 0)?))
        }

        fn rewind(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn kind(&self) -> SourceKind {
            self.kind
        }
    }

    #[derive(Default)]
    struct FakeSources {
        opened: AtomicUsize,
    }

    impl SourceFactory for FakeSources {
        fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if uri.contains("broken") {
                return Err(anyhow!("cannot open {uri}"));
            }
            Ok(Box::new(LoopingSource {
                kind: SourceKind::File,
                empty: uri.contains("empty"),
            }))
        }
    }

    /// Always sees a car in the left stall.
    struct FakeDetector;

    impl VehicleDetector for FakeDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<BBox>> {
            Ok(vec![BBox::new(0.0, 0.0, 31.0, 31.0)])
        }
    }

    struct FakeDetectors {
        devices: Vec<String>,
        created: AtomicUsize,
    }

    impl FakeDetectors {
        fn new(devices: &[&str]) -> Self {
            Self {
                devices: devices.iter().map(|d| d.to_string()).collect(),
                created: AtomicUsize::new(0),
            }
        }
    }

    impl DetectorFactory for FakeDetectors {
        fn available_devices(&self) -> Vec<String> {
            self.devices.clone()
        }

        fn create(&self, _device: &str) -> Result<Box<dyn VehicleDetector>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDetector))
        }
    }

    fn server_config() -> ServerConfig {
        ServerConfig {
            config_path: PathBuf::from("camera.json"),
            model_path: None,
            host: "127.0.0.1".into(),
            port: 0,
            broadcast_width: 64,
            broadcast_height: 32,
            capture_fps: 200.0,
            stream_fps: 30.0,
            jpeg_quality: 80,
            confidence_threshold: 0.6,
            thresholds: MatchThresholds::default(),
            smoothing_window: 30,
            aggregation_queue: 8,
            influx: None,
            telemetry: TelemetryOptions::default(),
        }
    }

    fn carpark(dir: &tempfile::TempDir, cameras: &[(&str, &str, &str)]) -> CarparkConfig {
        let bboxes = dir.path().join("stalls.xml");
        fs::write(&bboxes, VOC).unwrap();
        let cameras = cameras
            .iter()
            .map(|(address, device, path)| CameraConfig {
                address: address.to_string(),
                latitude: 0.0,
                longitude: 0.0,
                analytics: "vehicle".into(),
                device: device.to_string(),
                path: path.to_string(),
                bboxes: bboxes.clone(),
            })
            .collect();
        CarparkConfig {
            cameras,
            devices: vec!["CPU".into(), "GPU.1".into()],
        }
    }

    #[test]
    fn unavailable_device_fails_before_any_camera_is_touched() {
        let dir = tempfile::tempdir().unwrap();
        let carpark = carpark(&dir, &[("A_1_R1", "CPU", "a.mp4"), ("A_1_R2", "GPU.1", "b.mp4")]);
        let sources = FakeSources::default();
        let detectors = FakeDetectors::new(&["CPU"]);

        let err = match prepare_cameras(&server_config(), &carpark, &sources, &detectors) {
            Ok(_) => panic!("startup should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("GPU.1"));
        assert_eq!(sources.opened.load(Ordering::SeqCst), 0);
        assert_eq!(detectors.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unreadable_source_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let detectors = FakeDetectors::new(&["CPU", "GPU.1"]);

        let carpark_broken = carpark(&dir, &[("A_1_R1", "CPU", "a.mp4"), ("A_1_R2", "CPU", "broken.mp4")]);
        let result = prepare_cameras(&server_config(), &carpark_broken, &FakeSources::default(), &detectors);
        assert!(result.is_err());

        let carpark_empty = carpark(&dir, &[("A_1_R1", "CPU", "empty.mp4")]);
        let result = prepare_cameras(&server_config(), &carpark_empty, &FakeSources::default(), &detectors);
        assert!(result.is_err());
    }

    #[test]
    fn prepares_every_camera_with_scaled_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let carpark = carpark(&dir, &[("A_1_R1", "CPU", "a.mp4"), ("A_2_R1", "GPU.1", "b.mp4")]);
        let detectors = FakeDetectors::new(&["CPU", "GPU.1"]);
        let prepared =
            prepare_cameras(&server_config(), &carpark, &FakeSources::default(), &detectors).unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[1].settings.camera, 1);
        assert_eq!(prepared[1].settings.address.level, "2");
        assert_eq!(prepared[0].settings.stalls.len(), 2);
        assert_eq!(detectors.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn end_to_end_occupancy_reaches_sink() {
        let dir = tempfile::tempdir().unwrap();
        let carpark = carpark(&dir, &[("A_1_R1", "CPU", "a.mp4"), ("A_2_R1", "CPU", "b.mp4")]);
        let config = server_config();
        let prepared = prepare_cameras(
            &config,
            &carpark,
            &FakeSources::default(),
            &FakeDetectors::new(&["CPU", "GPU.1"]),
        )
        .unwrap();

        let sink = MemorySink::default();
        let running = start(&config, prepared, Box::new(sink.clone())).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while sink.snapshots().len() < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let tree = running.shutdown();

        assert!(sink.snapshots().len() >= 10);
        let summary = tree.carpark_summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.occupied, 2);
        assert_eq!(tree.row("A", "1", "R1").unwrap().stalls.get(&1), Some(&1));
        assert_eq!(tree.row("A", "2", "R1").unwrap().stalls.get(&2), Some(&0));
    }

    #[test]
    fn sink_defaults_to_logging() {
        assert_eq!(build_sink(&server_config()).unwrap().name(), "log");
    }
}
