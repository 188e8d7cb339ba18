//! OpenCV-backed frame source.

use chrono::Utc;
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};

use crate::{
    source::{FrameSource, SourceKind, parse_device_index},
    types::{CaptureError, Frame},
};

/// Camera, stream, or file opened through `cv::VideoCapture`.
pub struct OpenCvSource {
    uri: String,
    kind: SourceKind,
    cap: VideoCapture,
    frame: Mat,
}

impl OpenCvSource {
    /// Open `uri`, classifying it first so unsupported inputs fail before OpenCV sees them.
    pub fn open(uri: &str) -> Result<Self, CaptureError> {
        let kind = SourceKind::from_uri(uri).ok_or_else(|| CaptureError::Unsupported {
            uri: uri.to_string(),
        })?;
        let mut cap = open_video_capture(uri)?;
        if kind == SourceKind::Device {
            configure_camera(&mut cap, 30.0);
        }
        Ok(Self {
            uri: uri.to_string(),
            kind,
            cap,
            frame: Mat::default(),
        })
    }
}

impl FrameSource for OpenCvSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Frame::from_bgr(data, size.width, size.height, Utc::now().timestamp_millis()).map(Some)
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        match self.cap.set(videoio::CAP_PROP_POS_FRAMES, 0.0) {
            Ok(true) => Ok(()),
            _ => Err(CaptureError::Rewind {
                uri: self.uri.clone(),
            }),
        }
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            if let Ok(cap) = VideoCapture::new(index, backend) {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
        }
    }

    if let Ok(cap) = VideoCapture::from_file(uri, videoio::CAP_ANY) {
        if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
            return Ok(cap);
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Prefer MJPG from UVC devices and request a steady frame rate.
fn configure_camera(cap: &mut VideoCapture, fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
