//! Aspect-preserving resize onto a fixed broadcast canvas.

use image::{Rgb, RgbImage, imageops::FilterType};

use crate::types::Frame;

/// Grey level used for the padding bars.
pub const LETTERBOX_FILL: u8 = 128;

/// Resize `frame` to fit inside `target` (width, height) without distorting it,
/// centring the result on a grey canvas. Frames already at the target size are
/// returned unchanged.
pub fn letterbox(frame: &Frame, target: (i32, i32)) -> Frame {
    let (target_w, target_h) = target;
    if frame.size() == target || target_w <= 0 || target_h <= 0 {
        return frame.clone();
    }

    let src_w = frame.width.max(1) as f64;
    let src_h = frame.height.max(1) as f64;
    let scale = (target_w as f64 / src_w).min(target_h as f64 / src_h);
    let new_w = ((src_w * scale) as u32).clamp(1, target_w as u32);
    let new_h = ((src_h * scale) as u32).clamp(1, target_h as u32);
    let pad_x = (target_w as u32 - new_w) / 2;
    let pad_y = (target_h as u32 - new_h) / 2;

    let resized = image::imageops::resize(&frame.to_rgb_image(), new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(
        target_w as u32,
        target_h as u32,
        Rgb([LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL]),
    );
    image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    Frame::from_rgb_image(&canvas, frame.timestamp_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: i32, height: i32, value: u8) -> Frame {
        Frame::from_bgr(vec![value; (width * height * 3) as usize], width, height, 7).unwrap()
    }

    #[test]
    fn matching_size_is_untouched() {
        let frame = solid(16, 9, 200);
        let out = letterbox(&frame, (16, 9));
        assert_eq!(out.size(), (16, 9));
        assert_eq!(out.data, frame.data);
    }

    #[test]
    fn square_input_is_pillarboxed() {
        let frame = solid(10, 10, 255);
        let out = letterbox(&frame, (40, 20));
        assert_eq!(out.size(), (40, 20));
        assert_eq!(out.timestamp_ms, 7);

        let image = out.to_rgb_image();
        // Scaled to 20x20, centred with 10px bars either side.
        assert_eq!(image.get_pixel(0, 10).0, [LETTERBOX_FILL; 3]);
        assert_eq!(image.get_pixel(39, 10).0, [LETTERBOX_FILL; 3]);
        assert_eq!(image.get_pixel(20, 10).0, [255; 3]);
    }
}
