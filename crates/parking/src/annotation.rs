use std::{collections::BTreeSet, time::Duration};

use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use ml_core::BBox;

use crate::record::RowAddress;

pub const OCCUPIED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const VACANT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const PANEL_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const STALL_THICKNESS: i32 = 3;

/// Pixel scale applied to the 5x7 glyphs.
fn text_scale(image: &RgbImage) -> i32 {
    (image.width() as i32 / 640).max(1)
}

/// Outline every stall, red when this frame's detections cover it, and label it.
pub fn draw_stalls(
    image: &mut RgbImage,
    stalls: &[BBox],
    occupied: &BTreeSet<usize>,
    address: &RowAddress,
) {
    let scale = text_scale(image);
    for (idx, stall) in stalls.iter().enumerate() {
        let color = if occupied.contains(&idx) {
            OCCUPIED_COLOR
        } else {
            VACANT_COLOR
        };
        let [left, top, right, bottom] = stall.to_pixels();
        draw_rectangle(image, left, top, right, bottom, color, STALL_THICKNESS);
        draw_label(
            image,
            left + STALL_THICKNESS + 2,
            top + STALL_THICKNESS + 2,
            &address.stall_label(idx),
            color,
            scale,
        );
    }
}

/// Address plus stream FPS and latency in the top-left corner.
pub fn draw_statistics(image: &mut RgbImage, address: &RowAddress, fps: f32, latency: Duration) {
    let scale = text_scale(image);
    let lines = [
        address.to_string(),
        format!("STREAM FPS: {fps:.1}"),
        format!("STREAM LATENCY: {:.3}S", latency.as_secs_f32()),
    ];
    let line_height = 10 * scale;
    let widest = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as i32;
    fill_rect(
        image,
        0,
        0,
        widest * 6 * scale + 8,
        line_height * lines.len() as i32 + 6,
        PANEL_COLOR,
    );
    for (row, line) in lines.iter().enumerate() {
        draw_label(image, 4, 4 + row as i32 * line_height, line, TEXT_COLOR, scale);
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

pub fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
    thickness: i32,
) {
    for t in 0..thickness.max(1) {
        fill_rect(image, left + t, top + t, right - t, top + t, color);
        fill_rect(image, left + t, bottom - t, right - t, bottom - t, color);
        fill_rect(image, left + t, top + t, left + t, bottom - t, color);
        fill_rect(image, right - t, top + t, right - t, bottom - t, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 || right < left || bottom < top {
        return;
    }
    if right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col * scale;
                        let py = y + row as i32 * scale;
                        fill_rect(image, px, py, px + scale - 1, py + scale - 1, color);
                    }
                }
            }
        }
        x += 6 * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalls_colored_by_occupancy() {
        let mut image = RgbImage::new(640, 360);
        let stalls = [
            BBox::new(10.0, 10.0, 100.0, 100.0),
            BBox::new(200.0, 10.0, 300.0, 100.0),
        ];
        let occupied: BTreeSet<usize> = [1].into_iter().collect();
        let address = RowAddress::parse("A_1_R1").unwrap();
        draw_stalls(&mut image, &stalls, &occupied, &address);

        assert_eq!(*image.get_pixel(10, 50), VACANT_COLOR);
        assert_eq!(*image.get_pixel(12, 50), VACANT_COLOR);
        assert_eq!(*image.get_pixel(200, 50), OCCUPIED_COLOR);
        assert_eq!(*image.get_pixel(300, 100), OCCUPIED_COLOR);
        // Interior stays untouched.
        assert_eq!(*image.get_pixel(250, 80), Rgb([0, 0, 0]));
    }

    #[test]
    fn boxes_outside_the_frame_are_clipped() {
        let mut image = RgbImage::new(32, 32);
        draw_rectangle(&mut image, -10, -10, 100, 100, OCCUPIED_COLOR, 3);
        draw_rectangle(&mut image, 50, 50, 60, 60, OCCUPIED_COLOR, 3);
        assert_eq!(*image.get_pixel(16, 16), Rgb([0, 0, 0]));
    }

    #[test]
    fn statistics_panel_renders_text() {
        let mut image = RgbImage::new(640, 360);
        let address = RowAddress::parse("A_1_R1").unwrap();
        draw_statistics(&mut image, &address, 19.7, Duration::from_millis(51));
        let lit = image.pixels().filter(|p| **p == TEXT_COLOR).count();
        assert!(lit > 0);
    }

    #[test]
    fn encodes_jpeg() {
        let image = RgbImage::from_pixel(16, 8, Rgb([10, 20, 30]));
        let jpeg = encode_jpeg(&image, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
