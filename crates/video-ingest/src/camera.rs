//! OpenCV-backed capture, enabled with the `opencv` feature.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{
    source::{FrameSource, SourceKind, parse_device_index},
    types::{CaptureError, Frame, FrameFormat},
};

pub struct OpenCvSource {
    cap: VideoCapture,
    kind: SourceKind,
    target_size: (u32, u32),
    frame: Mat,
    scratch: Mat,
}

impl OpenCvSource {
    pub fn open(uri: &str, kind: SourceKind, target_size: (u32, u32)) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(uri)?;
        if kind == SourceKind::Device {
            configure_camera(&mut cap, target_size, 30.0);
        }
        Ok(Self {
            cap,
            kind,
            target_size,
            frame: Mat::default(),
            scratch: Mat::default(),
        })
    }
}

impl FrameSource for OpenCvSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        let size = self.frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed || size.width <= 0 {
            return Err(if self.kind.is_finite() {
                CaptureError::EndOfStream
            } else {
                CaptureError::Read(std::io::Error::other("camera returned an empty frame"))
            });
        }

        let (target_w, target_h) = (self.target_size.0 as i32, self.target_size.1 as i32);
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: self.target_size.0,
            height: self.target_size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => warn!("failed to open device #{index} with backend {backend}: {err}"),
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) => {
            if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                return Ok(cap);
            }
        }
        Err(err) => warn!("failed to open {uri}: {err}"),
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply capture resolution, frame rate and preferred pixel format.
fn configure_camera(cap: &mut VideoCapture, target_size: (u32, u32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
