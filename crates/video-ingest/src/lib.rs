//! Frame capture primitives shared by the camera workers.

#[cfg(feature = "opencv")]
mod camera;
mod letterbox;
mod source;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpenCvSource;
pub use letterbox::{LETTERBOX_FILL, letterbox};
pub use source::{
    FrameSource, SourceKind, VIDEO_EXTENSIONS, has_video_extension, parse_device_index,
};
pub use types::{CaptureError, Frame, FrameFormat};
