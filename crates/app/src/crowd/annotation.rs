//! CPU annotation: person boxes, count overlay, frame footer and banners.
//!
//! Drawing uses a built-in 5x7 bitmap font so the binary needs no font
//! assets. Every routine clips to the image bounds.

use image::{Rgb, RgbImage};
use ml_core::Detection;
use video_ingest::{Frame, FrameFormat};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const PANEL_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;

/// Convert a BGR8 frame into an RGB raster. `None` when the buffer does not
/// match the declared dimensions.
pub(crate) fn frame_to_rgb(frame: &Frame) -> Option<RgbImage> {
    if !matches!(frame.format, FrameFormat::Bgr8) {
        return None;
    }
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    RgbImage::from_raw(frame.width, frame.height, rgb)
}

/// Inverse of [`frame_to_rgb`], used when writing annotated video.
pub(crate) fn rgb_to_bgr(image: &RgbImage) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(image.as_raw().len());
    for chunk in image.as_raw().chunks_exact(3) {
        bgr.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    bgr
}

pub(crate) fn draw_detections(image: &mut RgbImage, persons: &[Detection]) {
    let (width, height) = image.dimensions();
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;

    for det in persons {
        let left = det.bbox[0].clamp(0.0, max_x).round() as i32;
        let top = det.bbox[1].clamp(0.0, max_y).round() as i32;
        let right = det.bbox[2].clamp(0.0, max_x).round() as i32;
        let bottom = det.bbox[3].clamp(0.0, max_y).round() as i32;
        draw_rectangle(image, left, top, right, bottom, BOX_COLOR);
        // Second pass one pixel inside for a 2px outline.
        if right - left > 2 && bottom - top > 2 {
            draw_rectangle(image, left + 1, top + 1, right - 1, bottom - 1, BOX_COLOR);
        }
    }

    for det in persons {
        let left = det.bbox[0].clamp(0.0, max_x).round() as i32;
        let top = det.bbox[1].clamp(0.0, max_y).round() as i32;
        let text = format!("{} {:.0}%", det.label, det.confidence * 100.0);
        let label_y = (top - 10).max(0);
        let text_width = text_width(&text);
        fill_rect(image, left, label_y, left + text_width, label_y + 8, PANEL_COLOR);
        draw_label(image, left + 1, label_y + 1, &text, BOX_COLOR);
    }
}

/// `PEOPLE: n` and `MAX: m` panel in the top-left corner.
pub(crate) fn draw_counts(image: &mut RgbImage, current: u64, max: u64) {
    let lines = [format!("PEOPLE: {current}"), format!("MAX: {max}")];
    let panel_width = lines.iter().map(|l| text_width(l)).max().unwrap_or(0) + 6;
    let panel_height = lines.len() as i32 * (GLYPH_HEIGHT + 4) + 4;
    fill_rect(image, 2, 2, 2 + panel_width, 2 + panel_height, PANEL_COLOR);
    for (row, line) in lines.iter().enumerate() {
        let y = 6 + row as i32 * (GLYPH_HEIGHT + 4);
        draw_label(image, 5, y, line, TEXT_COLOR);
    }
}

pub(crate) fn draw_footer(image: &mut RgbImage, frame_number: u64, fps: f32) {
    let (width, height) = image.dimensions();
    let info = format!("FRAME {frame_number:06}  FPS {fps:4.1}");
    let info_width = text_width(&info).min(width as i32);
    let info_x = (width as i32 - info_width - 4).max(0);
    let info_y = (height as i32 - 12).max(0);
    fill_rect(image, info_x, info_y, info_x + info_width + 4, info_y + 8, PANEL_COLOR);
    draw_label(image, info_x + 2, info_y, &info, TEXT_COLOR);
}

/// Centred single-line banner, scaled up for readability.
pub(crate) fn draw_banner(image: &mut RgbImage, text: &str, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    let scale = ((width as i32 / (text_width(text).max(1) * 2)).clamp(1, 4)) as u32;
    let banner_width = text_width(text) * scale as i32;
    let x = ((width as i32 - banner_width) / 2).max(0);
    let y = ((height as i32 - GLYPH_HEIGHT * scale as i32) / 2).max(0);
    draw_scaled_label(image, x, y, text, color, scale);
}

fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
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

fn draw_label(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    draw_scaled_label(image, x, y, text, color, 1);
}

fn draw_scaled_label(
    image: &mut RgbImage,
    mut x: i32,
    y: i32,
    text: &str,
    color: Rgb<u8>,
    scale: u32,
) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let scale = scale.max(1) as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 0 {
                        continue;
                    }
                    for sy in 0..scale {
                        for sx in 0..scale {
                            let px = x + col * scale + sx;
                            let py = y + row as i32 * scale + sy;
                            if (0..width).contains(&px) && (0..height).contains(&py) {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
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
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
