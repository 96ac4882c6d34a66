//! Frame acquisition for the crowd pipeline.
//!
//! Sources are opened through a [`SourceFactory`] so the pipeline can reopen
//! live feeds after a transient failure. Decoding runs in an `ffmpeg`
//! subprocess by default; the `opencv` feature adds a native device backend.

#[cfg(feature = "opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod source;
pub mod types;

pub use ffmpeg::{FfmpegSource, FfmpegWriter, probe_dimensions, probe_frame_rate};
pub use source::{CaptureBackend, FrameSource, SourceFactory, SourceKind, UriSourceFactory};
pub use types::{CaptureError, Frame, FrameFormat};
