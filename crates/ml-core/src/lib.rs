//! Object detection interface consumed by the crowd pipeline.
//!
//! The pipeline only depends on [`Detector`]; the TorchScript YOLO backend is
//! compiled in with the `with-tch` feature so builds without libtorch still
//! link.

pub mod detection;
#[cfg(feature = "with-tch")]
pub mod detector;
pub mod labels;

pub use detection::{Detection, DetectionError, Detector, PERSON_CLASS_ID, non_max_suppression};

#[cfg(feature = "with-tch")]
pub use detector::YoloDetector;
#[cfg(feature = "with-tch")]
pub use tch;
