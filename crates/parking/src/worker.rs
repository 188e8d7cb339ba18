//! Per-camera capture, detection, matching and smoothing loop.
//!
//! Each camera runs on its own OS thread. Every iteration reads one frame,
//! letterboxes it to the broadcast size, detects vehicles, matches them to
//! stalls, votes over the smoothing window, pushes a row record to the
//! aggregator and, when someone is watching, publishes an annotated frame.
//! Errors inside an iteration are logged and the loop moves on; only a stop
//! request ends it.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use ml_core::{BBox, VehicleDetector};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{FrameSource, letterbox};

use crate::{
    annotation,
    matcher::{MatchThresholds, match_occupancy, occupancy_vector},
    record::{RowAddress, RowRecord},
    smoother::TemporalSmoother,
    state::ServerState,
    telemetry,
};

/// Iteration latencies kept for the FPS overlay.
const LATENCY_HISTORY: usize = 200;

/// The aggregator hung up; the worker has nowhere to send records.
#[derive(Debug, Error)]
#[error("aggregation queue closed")]
pub struct QueueClosed;

/// Everything a worker needs besides its source and detector.
pub struct WorkerSettings {
    pub camera: usize,
    pub address: RowAddress,
    pub stalls: Vec<BBox>,
    pub thresholds: MatchThresholds,
    pub smoothing_window: usize,
    pub broadcast: (i32, i32),
    pub interval: Duration,
}

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Processed {
        raw: Vec<u8>,
        smoothed: Vec<u8>,
        published: bool,
    },
    /// A finite source ran out and was seeked back to its first frame.
    Rewound,
    /// A live source had nothing this tick.
    NoFrame,
}

pub struct CameraWorker {
    settings: WorkerSettings,
    source: Box<dyn FrameSource>,
    detector: Box<dyn VehicleDetector>,
    smoother: TemporalSmoother,
    records: Sender<RowRecord>,
    state: Arc<ServerState>,
    latencies: VecDeque<Duration>,
    camera_label: String,
}

impl CameraWorker {
    pub fn new(
        settings: WorkerSettings,
        source: Box<dyn FrameSource>,
        detector: Box<dyn VehicleDetector>,
        records: Sender<RowRecord>,
        state: Arc<ServerState>,
    ) -> Self {
        let smoother = TemporalSmoother::new(settings.smoothing_window);
        let camera_label = settings.camera.to_string();
        Self {
            settings,
            source,
            detector,
            smoother,
            records,
            state,
            latencies: VecDeque::with_capacity(LATENCY_HISTORY),
            camera_label,
        }
    }

    /// Run one iteration. `started` marks the beginning of the iteration,
    /// including any pacing sleep, and feeds the latency overlay.
    pub fn step(&mut self, started: Instant) -> Result<StepOutcome> {
        let camera = self.settings.camera;

        let finite = self.source.kind().is_finite();
        let frame = match self.source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) if finite => return self.rewind_source(),
            Err(err) if finite => {
                debug!("Read failed on file source, rewinding: {err}");
                return self.rewind_source();
            }
            Ok(None) => return Ok(StepOutcome::NoFrame),
            Err(err) => return Err(err).context("capture read failed"),
        };

        let frame = if frame.size() != self.settings.broadcast {
            letterbox(&frame, self.settings.broadcast)
        } else {
            frame
        };

        let detect_start = Instant::now();
        let detections = self.detector.detect(&frame).context("vehicle detection failed")?;
        record_stage("detect", detect_start);

        let match_start = Instant::now();
        let occupied = match_occupancy(&detections, &self.settings.stalls, self.settings.thresholds);
        let raw = occupancy_vector(&occupied, self.settings.stalls.len());
        let smoothed = self.smoother.push(raw.clone());
        record_stage("match", match_start);

        let record = RowRecord::new(self.settings.address.clone(), &smoothed);
        metrics::gauge!("parking_stalls_occupied", "camera" => self.camera_label.clone())
            .set(f64::from(record.row.summary.occupied));
        self.records
            .send(record)
            .map_err(|_| QueueClosed)?;

        let latency = started.elapsed();
        let fps = self.push_latency(latency);
        metrics::gauge!("parking_worker_fps", "camera" => self.camera_label.clone()).set(f64::from(fps));

        let mut published = false;
        if self.state.is_running(camera) {
            let annotate_start = Instant::now();
            let mut image = frame.to_rgb_image();
            annotation::draw_stalls(&mut image, &self.settings.stalls, &occupied, &self.settings.address);
            annotation::draw_statistics(&mut image, &self.settings.address, fps, latency);
            published = self.state.publish(camera, image);
            record_stage("annotate", annotate_start);
        }

        Ok(StepOutcome::Processed {
            raw,
            smoothed,
            published,
        })
    }

    fn rewind_source(&mut self) -> Result<StepOutcome> {
        self.source.rewind().context("failed to rewind file source")?;
        metrics::counter!("parking_capture_rewinds_total", "camera" => self.camera_label.clone())
            .increment(1);
        Ok(StepOutcome::Rewound)
    }

    /// Record an iteration latency and return `1000 / mean(ms)` over the history.
    fn push_latency(&mut self, latency: Duration) -> f32 {
        if self.latencies.len() == LATENCY_HISTORY {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
        let total_ms: f64 = self.latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        let mean_ms = total_ms / self.latencies.len() as f64;
        if mean_ms <= 0.0 {
            0.0
        } else {
            (1000.0 / mean_ms) as f32
        }
    }

    /// Loop until `stop` is set, pacing iterations by the configured interval.
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        let span = tracing::info_span!(
            "camera.worker",
            camera = self.settings.camera,
            address = %self.settings.address
        );
        let _guard = span.enter();
        info!(
            stalls = self.settings.stalls.len(),
            kind = ?self.source.kind(),
            "Camera worker started"
        );

        let mut iterations: u64 = 0;
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            thread::sleep(self.settings.interval);
            match self.step(started) {
                Ok(StepOutcome::Processed { smoothed, .. }) => {
                    iterations = iterations.wrapping_add(1);
                    if iterations % 100 == 0 {
                        let occupied = smoothed.iter().filter(|v| **v != 0).count();
                        debug!(iterations, occupied, "Worker heartbeat");
                    }
                }
                Ok(StepOutcome::Rewound) => debug!("Source rewound to first frame"),
                Ok(StepOutcome::NoFrame) => {}
                Err(err) => {
                    metrics::counter!("parking_frame_errors_total", "camera" => self.camera_label.clone())
                        .increment(1);
                    error!("Frame processing error: {err:#}");
                    if err.is::<QueueClosed>() {
                        warn!("Aggregator gone; stopping worker");
                        break;
                    }
                }
            }
        }
        info!("Camera worker stopped");
    }

    pub fn spawn(self) -> Result<WorkerHandle> {
        let camera = self.settings.camera;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = telemetry::spawn_thread(format!("parking-camera-{camera}"), move || {
            self.run(thread_stop)
        })
        .with_context(|| format!("Failed to spawn worker thread for camera {camera}"))?;
        Ok(WorkerHandle {
            camera,
            stop,
            handle,
        })
    }
}

fn record_stage(stage: &'static str, start: Instant) {
    metrics::histogram!("parking_stage_latency_seconds", "stage" => stage)
        .record(start.elapsed().as_secs_f64());
}

/// Owner side of a running worker thread.
pub struct WorkerHandle {
    camera: usize,
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn camera(&self) -> usize {
        self.camera
    }

    /// Ask the worker to exit after its current iteration.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!(camera = self.camera, "Camera worker panicked");
        }
    }
}
