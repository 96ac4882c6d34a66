//! JPEG encoding for published artifacts.

use std::time::Instant;

use actix_web::web::Bytes;
use image::{ImageError, Rgb, RgbImage, codecs::jpeg::JpegEncoder};

use crate::crowd::annotation;

/// Encode an RGB raster at the given quality (clamped to `1..=100`).
pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, ImageError> {
    let started = Instant::now();
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    metrics::histogram!("crowd_stage_latency_seconds", "stage" => "encoding")
        .record(started.elapsed().as_secs_f64());
    Ok(Bytes::from(buffer))
}

/// White raster with a centred caption, used for idle and end-of-stream
/// frames.
pub(crate) fn caption_frame(width: u32, height: u32, caption: &str) -> RgbImage {
    let mut image = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([255, 255, 255]));
    annotation::draw_banner(&mut image, caption, Rgb([60, 60, 60]));
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_caption_decodes_to_configured_size() {
        let jpeg = encode_jpeg(&caption_frame(320, 240, "STREAM IDLE"), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
    }

    #[test]
    fn quality_is_clamped() {
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        assert!(encode_jpeg(&image, 0).is_ok());
        assert!(encode_jpeg(&image, 255).is_ok());
    }
}
