use anyhow::Error;
use thiserror::Error;

/// Raw BGR8 frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Uniformly filled frame, used for placeholders and tests.
    pub fn filled(width: u32, height: u32, value: u8, timestamp_ms: i64) -> Self {
        Self {
            data: vec![value; Self::byte_len(width, height)],
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Bgr8,
        }
    }

    /// Number of bytes a BGR8 frame of the given size occupies.
    pub fn byte_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * 3
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to launch ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("video source reached end of stream")]
    EndOfStream,
    #[error("failed to read frame: {0}")]
    Read(#[source] std::io::Error),
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// True when the source has nothing more to deliver, as opposed to a
    /// device or transport failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, CaptureError::EndOfStream)
    }
}
