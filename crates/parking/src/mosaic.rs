//! Row-major grid combining every camera into one image for `/camera/all`.

use image::{RgbImage, imageops};

pub const MOSAIC_COLUMNS: u32 = 2;

/// Canvas of half-resolution tiles. A tile keeps its last frame until the
/// camera delivers a new one.
pub struct Mosaic {
    canvas: RgbImage,
    tile: (u32, u32),
    cameras: usize,
}

impl Mosaic {
    pub fn new(cameras: usize, broadcast: (i32, i32)) -> Self {
        let tile = (
            (broadcast.0.max(2) / 2) as u32,
            (broadcast.1.max(2) / 2) as u32,
        );
        let rows = (cameras as u32).div_ceil(MOSAIC_COLUMNS).max(1);
        Self {
            canvas: RgbImage::new(tile.0 * MOSAIC_COLUMNS, tile.1 * rows),
            tile,
            cameras,
        }
    }

    /// Top-left corner of the camera's tile.
    pub fn origin(&self, camera: usize) -> (u32, u32) {
        let camera = camera as u32;
        (
            (camera % MOSAIC_COLUMNS) * self.tile.0,
            (camera / MOSAIC_COLUMNS) * self.tile.1,
        )
    }

    /// Draw `frame` into the camera's tile, resizing when needed.
    pub fn update(&mut self, camera: usize, frame: &RgbImage) {
        if camera >= self.cameras {
            return;
        }
        let (x, y) = self.origin(camera);
        if frame.dimensions() == self.tile {
            imageops::replace(&mut self.canvas, frame, i64::from(x), i64::from(y));
        } else {
            let resized =
                imageops::resize(frame, self.tile.0, self.tile.1, imageops::FilterType::Triangle);
            imageops::replace(&mut self.canvas, &resized, i64::from(x), i64::from(y));
        }
    }

    pub fn canvas(&self) -> &RgbImage {
        &self.canvas
    }
}
