use anyhow::Error;
use image::RgbImage;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl Frame {
    /// Wrap a packed BGR buffer, checking that it matches the stated dimensions.
    pub fn from_bgr(
        data: Vec<u8>,
        width: i32,
        height: i32,
        timestamp_ms: i64,
    ) -> Result<Self, CaptureError> {
        let expected = (width.max(0) as usize) * (height.max(0) as usize) * 3;
        if width <= 0 || height <= 0 || data.len() != expected {
            return Err(CaptureError::Geometry {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        })
    }

    pub fn size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    /// Convert the BGR payload into an RGB image for drawing and encoding.
    pub fn to_rgb_image(&self) -> RgbImage {
        let mut rgb = Vec::with_capacity(self.data.len());
        for chunk in self.data.chunks_exact(3) {
            rgb.push(chunk[2]);
            rgb.push(chunk[1]);
            rgb.push(chunk[0]);
        }
        RgbImage::from_raw(self.width as u32, self.height as u32, rgb)
            .unwrap_or_else(|| RgbImage::new(self.width.max(1) as u32, self.height.max(1) as u32))
    }

    /// Build a BGR frame from an RGB image.
    pub fn from_rgb_image(image: &RgbImage, timestamp_ms: i64) -> Self {
        let mut data = Vec::with_capacity(image.as_raw().len());
        for chunk in image.as_raw().chunks_exact(3) {
            data.push(chunk[2]);
            data.push(chunk[1]);
            data.push(chunk[0]);
        }
        Self {
            data,
            width: image.width() as i32,
            height: image.height() as i32,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to rewind video source {uri:?}")]
    Rewind { uri: String },
    #[error("frame buffer of {len} bytes does not match {width}x{height} BGR")]
    Geometry { width: i32, height: i32, len: usize },
    #[error("unsupported source {uri:?}")]
    Unsupported { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}
