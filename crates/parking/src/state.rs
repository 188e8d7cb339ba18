//! Per-camera frame hand-off shared between workers and the streaming server.
//!
//! A single mutex guards every camera's viewer count and latest annotated
//! frame. Workers only publish while a viewer is attached, and publishing
//! always overwrites, so a slow client never holds up detection.

use std::sync::{Arc, Mutex, MutexGuard};

use image::RgbImage;

#[derive(Clone)]
/// One annotated frame ready for streaming.
pub struct PublishedFrame {
    /// Monotonic per-camera sequence number, starting at 1.
    pub seq: u64,
    pub image: Arc<RgbImage>,
}

#[derive(Default)]
struct CameraFeed {
    viewers: usize,
    latest: Option<PublishedFrame>,
    next_seq: u64,
}

/// Shared state owned by the pipeline and handed to workers and HTTP handlers.
pub struct ServerState {
    feeds: Mutex<Vec<CameraFeed>>,
    addresses: Vec<String>,
}

impl ServerState {
    pub fn new(addresses: Vec<String>) -> Self {
        let feeds = addresses.iter().map(|_| CameraFeed::default()).collect();
        Self {
            feeds: Mutex::new(feeds),
            addresses,
        }
    }

    pub fn camera_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn address(&self, camera: usize) -> Option<&str> {
        self.addresses.get(camera).map(String::as_str)
    }

    fn feeds(&self) -> MutexGuard<'_, Vec<CameraFeed>> {
        // A poisoned lock still holds consistent frames; keep serving.
        self.feeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True while at least one stream is consuming this camera.
    pub fn is_running(&self, camera: usize) -> bool {
        self.feeds()
            .get(camera)
            .map(|feed| feed.viewers > 0)
            .unwrap_or(false)
    }

    pub fn viewers(&self, camera: usize) -> usize {
        self.feeds().get(camera).map(|feed| feed.viewers).unwrap_or(0)
    }

    /// Register a viewer for `camera`. Returns `None` for unknown ids.
    pub fn attach(self: &Arc<Self>, camera: usize) -> Option<ViewerGuard> {
        {
            let mut feeds = self.feeds();
            let feed = feeds.get_mut(camera)?;
            feed.viewers += 1;
            metrics::gauge!("parking_stream_clients", "camera" => camera.to_string())
                .set(feed.viewers as f64);
        }
        Some(ViewerGuard {
            state: Arc::clone(self),
            camera,
        })
    }

    fn detach(&self, camera: usize) {
        let mut feeds = self.feeds();
        if let Some(feed) = feeds.get_mut(camera) {
            feed.viewers = feed.viewers.saturating_sub(1);
            if feed.viewers == 0 {
                feed.latest = None;
            }
            metrics::gauge!("parking_stream_clients", "camera" => camera.to_string())
                .set(feed.viewers as f64);
        }
    }

    /// Replace the camera's latest frame when someone is watching.
    /// Returns whether the frame was kept.
    pub fn publish(&self, camera: usize, image: RgbImage) -> bool {
        let mut feeds = self.feeds();
        let Some(feed) = feeds.get_mut(camera) else {
            return false;
        };
        if feed.viewers == 0 {
            return false;
        }
        feed.next_seq += 1;
        feed.latest = Some(PublishedFrame {
            seq: feed.next_seq,
            image: Arc::new(image),
        });
        true
    }

    /// Latest frame newer than `seen`, if any.
    pub fn latest_since(&self, camera: usize, seen: u64) -> Option<PublishedFrame> {
        self.feeds()
            .get(camera)
            .and_then(|feed| feed.latest.as_ref())
            .filter(|frame| frame.seq > seen)
            .cloned()
    }
}

/// Keeps a camera marked as running; dropping it clears the camera's frame
/// once the last viewer leaves.
pub struct ViewerGuard {
    state: Arc<ServerState>,
    camera: usize,
}

impl ViewerGuard {
    pub fn camera(&self) -> usize {
        self.camera
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.state.detach(self.camera);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(n: usize) -> Arc<ServerState> {
        Arc::new(ServerState::new(
            (0..n).map(|i| format!("A_1_{i}")).collect(),
        ))
    }

    #[test]
    fn publish_requires_a_viewer() {
        let state = state(1);
        assert!(!state.publish(0, RgbImage::new(2, 2)));
        assert!(state.latest_since(0, 0).is_none());

        let _viewer = state.attach(0).unwrap();
        assert!(state.is_running(0));
        assert!(state.publish(0, RgbImage::new(2, 2)));
        assert_eq!(state.latest_since(0, 0).unwrap().seq, 1);
    }

    #[test]
    fn latest_wins() {
        let state = state(1);
        let _viewer = state.attach(0).unwrap();
        for _ in 0..10 {
            state.publish(0, RgbImage::new(1, 1));
        }
        let frame = state.latest_since(0, 0).unwrap();
        assert_eq!(frame.seq, 10);
        assert!(state.latest_since(0, 10).is_none());
    }

    #[test]
    fn last_viewer_leaving_clears_frame() {
        let state = state(2);
        let first = state.attach(1).unwrap();
        let second = state.attach(1).unwrap();
        state.publish(1, RgbImage::new(1, 1));
        assert_eq!(state.viewers(1), 2);

        drop(first);
        assert!(state.is_running(1));
        assert!(state.latest_since(1, 0).is_some());

        drop(second);
        assert!(!state.is_running(1));
        assert!(state.latest_since(1, 0).is_none());
    }

    #[test]
    fn unknown_camera() {
        let state = state(1);
        assert!(state.attach(3).is_none());
        assert!(!state.publish(3, RgbImage::new(1, 1)));
        assert!(!state.is_running(3));
        assert_eq!(state.address(0), Some("A_1_0"));
        assert_eq!(state.address(1), None);
    }
}
