//! Actix Web server multiplexing camera frames into MJPEG streams.
//!
//! The server runs on a dedicated thread so the worker threads never touch
//! the Actix runtime. `/camera/{id}` streams one camera and `/camera/all`
//! streams a grid of every camera. Attaching a stream marks its cameras as
//! running; the mark is released when the stream ends or the client leaves.

use std::{sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use futures_util::Stream;
use image::RgbImage;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::{
    annotation::encode_jpeg,
    config::ServerConfig,
    mosaic::Mosaic,
    state::{ServerState, ViewerGuard},
    telemetry,
    watchdog::{FrameWatchdog, STREAM_MAX_EMPTY_POLLS, STREAM_POLL_INTERVAL_MS},
};

pub const STATUS_TEXT: &str = "Smart Parking APP";

#[derive(Clone, Debug)]
/// Pacing and encoding knobs shared by every stream.
pub struct StreamOptions {
    /// Minimum spacing between parts sent to one client.
    pub frame_interval: Duration,
    pub poll_interval: Duration,
    pub max_empty_polls: u32,
    pub jpeg_quality: u8,
    pub broadcast: (i32, i32),
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_secs_f32(1.0 / 30.0),
            poll_interval: Duration::from_millis(STREAM_POLL_INTERVAL_MS),
            max_empty_polls: STREAM_MAX_EMPTY_POLLS,
            jpeg_quality: 85,
            broadcast: (1920, 1080),
        }
    }
}

impl From<&ServerConfig> for StreamOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            frame_interval: config.stream_interval(),
            jpeg_quality: config.jpeg_quality,
            broadcast: config.broadcast_size(),
            ..Self::default()
        }
    }
}

impl StreamOptions {
    fn watchdog(&self) -> FrameWatchdog {
        FrameWatchdog::new(self.max_empty_polls, self.poll_interval)
    }
}

/// Shared state backing HTTP handlers.
pub struct AppState {
    pub cameras: Arc<ServerState>,
    pub options: StreamOptions,
}

/// Register every route. `/camera/all` must precede `/camera/{id}`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/metrics", web::get().to(metrics_route))
        .route("/camera/all", web::get().to(all_cameras_handler))
        .route("/camera/{id}", web::get().to(camera_handler));
}

#[derive(Default)]
/// Handle for the streaming server thread.
pub struct StreamingServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StreamingServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the server thread, returning once the listener is bound.
pub fn spawn_server(
    cameras: Arc<ServerState>,
    options: StreamOptions,
    bind: (String, u16),
) -> Result<StreamingServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
    let data = web::Data::new(AppState { cameras, options });
    let bind_label = format!("{}:{}", bind.0, bind.1);

    let handle = telemetry::spawn_thread("parking-http", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
                .bind((bind.0.as_str(), bind.1))
            {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return Err(err);
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn streaming server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("Streaming server listening on http://{bind_label}");
            Ok(StreamingServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(anyhow!("failed to bind {bind_label}: {err}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("streaming server thread exited before binding {bind_label}"))
        }
    }
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(STATUS_TEXT)
}

async fn metrics_route() -> HttpResponse {
    let body = telemetry::prometheus_handle()
        .map(|handle| handle.render())
        .unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}

async fn camera_handler(path: web::Path<String>, state: web::Data<AppState>) -> HttpResponse {
    let Ok(camera) = path.parse::<usize>() else {
        return HttpResponse::NotFound().body("The URL does not exist");
    };
    let Some(guard) = state.cameras.attach(camera) else {
        return HttpResponse::NotFound().body("The URL does not exist");
    };
    info!(
        camera,
        address = state.cameras.address(camera).unwrap_or_default(),
        viewers = state.cameras.viewers(camera),
        "Stream client attached"
    );
    mjpeg_response(camera_stream(
        guard,
        state.cameras.clone(),
        state.options.clone(),
    ))
}

async fn all_cameras_handler(state: web::Data<AppState>) -> HttpResponse {
    let guards: Vec<ViewerGuard> = (0..state.cameras.camera_count())
        .filter_map(|camera| state.cameras.attach(camera))
        .collect();
    mjpeg_response(mosaic_stream(
        guards,
        state.cameras.clone(),
        state.options.clone(),
    ))
}

fn mjpeg_response<S>(stream: S) -> HttpResponse
where
    S: Stream<Item = Result<Bytes, actix_web::Error>> + 'static,
{
    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

fn mjpeg_part(jpeg: &[u8], seq: u64) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 96);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(format!("X-Sequence: {seq}\r\n").as_bytes());
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    payload.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

async fn encode_off_thread(image: Arc<RgbImage>, quality: u8) -> Option<Vec<u8>> {
    match web::block(move || encode_jpeg(&image, quality)).await {
        Ok(Ok(jpeg)) => Some(jpeg),
        Ok(Err(err)) => {
            warn!("Dropping frame: {err}");
            None
        }
        Err(err) => {
            warn!("JPEG encoder unavailable: {err}");
            None
        }
    }
}

/// MJPEG parts for one camera. Holds `guard` until the stream ends, which
/// happens when the client disconnects or the watchdog budget runs out.
pub fn camera_stream(
    guard: ViewerGuard,
    cameras: Arc<ServerState>,
    options: StreamOptions,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    stream! {
        let guard = guard;
        let camera = guard.camera();
        let mut watchdog = options.watchdog();
        let mut seen = 0u64;
        loop {
            match cameras.latest_since(camera, seen) {
                Some(frame) => {
                    watchdog.feed();
                    seen = frame.seq;
                    if let Some(jpeg) = encode_off_thread(frame.image, options.jpeg_quality).await {
                        yield Ok::<Bytes, actix_web::Error>(mjpeg_part(&jpeg, seen));
                    }
                    actix_web::rt::time::sleep(options.frame_interval).await;
                }
                None => {
                    if !watchdog.starve() {
                        tracing::info_span!("stream", camera).in_scope(|| {
                            error!("Unable to receive frames from the pipeline; closing stream");
                        });
                        break;
                    }
                    actix_web::rt::time::sleep(watchdog.poll_interval()).await;
                }
            }
        }
        drop(guard);
    }
}

/// MJPEG parts for the grid of every attached camera.
pub fn mosaic_stream(
    guards: Vec<ViewerGuard>,
    cameras: Arc<ServerState>,
    options: StreamOptions,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    stream! {
        let guards = guards;
        let mut mosaic = Mosaic::new(cameras.camera_count(), options.broadcast);
        let mut seen = vec![0u64; cameras.camera_count()];
        let mut watchdog = options.watchdog();
        let mut parts = 0u64;
        loop {
            let mut updated = false;
            for guard in &guards {
                let camera = guard.camera();
                if let Some(frame) = cameras.latest_since(camera, seen[camera]) {
                    seen[camera] = frame.seq;
                    mosaic.update(camera, &frame.image);
                    updated = true;
                }
            }

            if updated {
                watchdog.feed();
                parts += 1;
                let canvas = Arc::new(mosaic.canvas().clone());
                if let Some(jpeg) = encode_off_thread(canvas, options.jpeg_quality).await {
                    yield Ok::<Bytes, actix_web::Error>(mjpeg_part(&jpeg, parts));
                }
                actix_web::rt::time::sleep(options.frame_interval).await;
            } else {
                if !watchdog.starve() {
                    tracing::info_span!("stream", camera = "all").in_scope(|| {
                        error!("Unable to receive frames from the pipeline; closing stream");
                    });
                    break;
                }
                actix_web::rt::time::sleep(watchdog.poll_interval()).await;
            }
        }
        drop(guards);
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{App, http::StatusCode, test};
    use futures_util::StreamExt;

    use super::*;

    fn quick_options() -> StreamOptions {
        StreamOptions {
            frame_interval: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            max_empty_polls: 3,
            jpeg_quality: 80,
            broadcast: (32, 16),
        }
    }

    fn cameras(n: usize) -> Arc<ServerState> {
        Arc::new(ServerState::new((0..n).map(|i| format!("A_1_R{i}")).collect()))
    }

    fn data(cameras: Arc<ServerState>) -> web::Data<AppState> {
        web::Data::new(AppState {
            cameras,
            options: quick_options(),
        })
    }

    #[actix_web::test]
    async fn index_reports_status() {
        let app = test::init_service(App::new().app_data(data(cameras(1))).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, Bytes::from_static(STATUS_TEXT.as_bytes()));
    }

    #[actix_web::test]
    async fn unknown_camera_is_not_found() {
        let app = test::init_service(App::new().app_data(data(cameras(2))).configure(routes)).await;
        for uri in ["/camera/2", "/camera/-1", "/camera/front"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[actix_web::test]
    async fn starved_stream_ends_and_releases_camera() {
        let cameras = cameras(1);
        let guard = cameras.attach(0).unwrap();
        assert!(cameras.is_running(0));

        let mut parts = Box::pin(camera_stream(guard, cameras.clone(), quick_options()));
        assert!(parts.next().await.is_none());
        assert!(!cameras.is_running(0));
    }

    #[actix_web::test]
    async fn stream_yields_published_frames() {
        let cameras = cameras(1);
        let guard = cameras.attach(0).unwrap();
        cameras.publish(0, RgbImage::new(32, 16));

        let mut parts = Box::pin(camera_stream(guard, cameras.clone(), quick_options()));
        let part = parts.next().await.unwrap().unwrap();
        assert!(part.starts_with(b"--frame\r\nX-Sequence: 1\r\nContent-Type: image/jpeg\r\n"));
        assert!(cameras.is_running(0));

        drop(parts);
        assert!(!cameras.is_running(0));
        assert!(cameras.latest_since(0, 0).is_none());
    }

    #[actix_web::test]
    async fn camera_route_streams_multipart_until_starved() {
        let cameras = cameras(1);
        let app =
            test::init_service(App::new().app_data(data(cameras.clone())).configure(routes)).await;
        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/camera/0").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert!(cameras.is_running(0));
        assert!(test::read_body(resp).await.is_empty());
        assert!(!cameras.is_running(0));
    }

    #[actix_web::test]
    async fn mosaic_combines_cameras() {
        let cameras = cameras(3);
        let guards: Vec<ViewerGuard> = (0..3).filter_map(|c| cameras.attach(c)).collect();
        cameras.publish(0, RgbImage::new(32, 16));
        cameras.publish(2, RgbImage::new(32, 16));

        let mut parts = Box::pin(mosaic_stream(guards, cameras.clone(), quick_options()));
        let part = parts.next().await.unwrap().unwrap();
        assert!(part.starts_with(b"--frame\r\n"));
        // Nothing new afterwards: the watchdog closes the grid stream.
        assert!(parts.next().await.is_none());
        assert!((0..3).all(|c| !cameras.is_running(c)));
    }
}
