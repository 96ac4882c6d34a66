//! Source classification and the traits the pipeline acquires frames through.

use tracing::debug;

use crate::{
    ffmpeg::FfmpegSource,
    types::{CaptureError, Frame},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L devices addressed by index or `/dev/videoN`.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// Pre-recorded video files.
    File,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if parse_device_index(uri).is_some() || uri.starts_with("/dev/video") {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }

    /// Finite sources end the session when exhausted; live sources retry.
    pub fn is_finite(self) -> bool {
        matches!(self, SourceKind::File)
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Device => "device",
            SourceKind::Rtsp => "rtsp",
            SourceKind::File => "file",
        }
    }
}

/// An opened acquisition resource. Reads block until a frame is available.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Opens (and reopens) a [`FrameSource`].
pub trait SourceFactory: Send {
    fn kind(&self) -> SourceKind;

    /// Human readable identifier for logs.
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureBackend {
    Ffmpeg,
    #[cfg(feature = "opencv")]
    OpenCv,
}

/// Factory for sources addressed by URI, device index or file path.
pub struct UriSourceFactory {
    uri: String,
    kind: SourceKind,
    target_size: (u32, u32),
    backend: CaptureBackend,
    realtime: bool,
}

impl UriSourceFactory {
    pub fn new(uri: impl Into<String>, target_size: (u32, u32)) -> Self {
        let uri = uri.into();
        let kind = SourceKind::from_uri(&uri);
        Self {
            uri,
            kind,
            target_size,
            backend: CaptureBackend::Ffmpeg,
            realtime: false,
        }
    }

    pub fn with_backend(mut self, backend: CaptureBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Pace file playback at its native frame rate instead of decoding as
    /// fast as the consumer reads.
    pub fn with_realtime_playback(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl SourceFactory for UriSourceFactory {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.uri, self.kind.label())
    }

    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError> {
        debug!(uri = %self.uri, kind = self.kind.label(), backend = ?self.backend, "opening source");
        match self.backend {
            CaptureBackend::Ffmpeg => {
                let source =
                    FfmpegSource::spawn(&self.uri, self.kind, self.target_size, self.realtime)?;
                Ok(Box::new(source))
            }
            #[cfg(feature = "opencv")]
            CaptureBackend::OpenCv => {
                let source = crate::camera::OpenCvSource::open(&self.uri, self.kind, self.target_size)?;
                Ok(Box::new(source))
            }
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_uris() {
        assert_eq!(SourceKind::from_uri("0"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("/dev/video2"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("rtsp://cam.local/stream"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("rtsps://cam.local/stream"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("clips/mall.mp4"), SourceKind::File);
    }

    #[test]
    fn only_files_are_finite() {
        assert!(SourceKind::File.is_finite());
        assert!(!SourceKind::Device.is_finite());
        assert!(!SourceKind::Rtsp.is_finite());
    }

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("3"), Some(3));
        assert_eq!(parse_device_index("/dev/video11"), Some(11));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("/dev/videoX"), None);
        assert_eq!(parse_device_index("video.mp4"), None);
    }

    #[test]
    fn factory_reports_kind_and_description() {
        let factory = UriSourceFactory::new("/dev/video0", (640, 480));
        assert_eq!(factory.kind(), SourceKind::Device);
        assert_eq!(factory.describe(), "/dev/video0 (device)");
    }
}
