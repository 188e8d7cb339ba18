//! Source classification and the pull-based capture interface used by camera workers.

use std::path::Path;

use crate::types::{CaptureError, Frame};

/// Video container extensions accepted as looping file sources.
pub const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "mov", "avi", "wmv", "mkv", "webm", "flv"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Pre-recorded video; replayed from the start when it runs out.
    File,
    /// Local V4L device, either `/dev/videoN` or a bare index.
    Device,
    /// Real-time streaming protocol feed.
    Rtsp,
    /// UDP socket carrying an encoded stream.
    Udp,
}

impl SourceKind {
    /// Infer the transport kind from a URI, returning `None` for unsupported inputs.
    pub fn from_uri(uri: &str) -> Option<Self> {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            return Some(SourceKind::Rtsp);
        }
        if uri.starts_with("udp://") {
            return Some(SourceKind::Udp);
        }
        if parse_device_index(uri).is_some() || uri.starts_with("/dev/video") {
            return Some(SourceKind::Device);
        }
        if has_video_extension(uri) {
            return Some(SourceKind::File);
        }
        None
    }

    /// Finite sources loop; live sources never run out.
    pub fn is_finite(self) -> bool {
        matches!(self, SourceKind::File)
    }
}

/// Parse a `/dev/videoX` style URI or bare index and return the device number.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return (0..100).contains(&index).then_some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

/// Returns true when the path ends in one of [`VIDEO_EXTENSIONS`].
pub fn has_video_extension(uri: &str) -> bool {
    Path::new(uri)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Pull-based frame producer owned by a single camera worker.
pub trait FrameSource: Send {
    /// Read the next frame. `Ok(None)` means no frame is available right now
    /// (end of file for finite sources, a dropped read for live ones).
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Seek back to the first frame. Only meaningful for finite sources.
    fn rewind(&mut self) -> Result<(), CaptureError>;

    fn kind(&self) -> SourceKind;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read()
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        (**self).rewind()
    }

    fn kind(&self) -> SourceKind {
        (**self).kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_uris() {
        assert_eq!(SourceKind::from_uri("rtsp://cam/1"), Some(SourceKind::Rtsp));
        assert_eq!(SourceKind::from_uri("udp://0.0.0.0:5000"), Some(SourceKind::Udp));
        assert_eq!(SourceKind::from_uri("0"), Some(SourceKind::Device));
        assert_eq!(SourceKind::from_uri("/dev/video2"), Some(SourceKind::Device));
        assert_eq!(SourceKind::from_uri("videos/lot.MP4"), Some(SourceKind::File));
        assert_eq!(SourceKind::from_uri("notes.txt"), None);
        assert_eq!(SourceKind::from_uri("http://example/stream"), None);
    }

    #[test]
    fn device_index_bounds() {
        assert_eq!(parse_device_index("/dev/video10"), Some(10));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("250"), None);
    }

    #[test]
    fn only_files_are_finite() {
        assert!(SourceKind::File.is_finite());
        assert!(!SourceKind::Rtsp.is_finite());
        assert!(!SourceKind::Device.is_finite());
    }
}
