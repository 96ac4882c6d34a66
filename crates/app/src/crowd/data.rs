use actix_web::web::Bytes;
use ml_core::{Detection, DetectionError};
use serde::Serialize;
use thiserror::Error;
use video_ingest::CaptureError;

use crate::crowd::control::{CountersSnapshot, RunState};

/// Centroid of a person detection in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PersonPosition {
    pub(crate) x: f32,
    pub(crate) y: f32,
}

impl From<&Detection> for PersonPosition {
    fn from(det: &Detection) -> Self {
        let (x, y) = det.centroid();
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArtifactKind {
    /// Annotated frame from the source.
    Live,
    /// Fixed frame emitted while idle or reconnecting.
    Placeholder,
    /// Last frame of a finite source, published right before the hub closes.
    Terminal,
}

impl ArtifactKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ArtifactKind::Live => "live",
            ArtifactKind::Placeholder => "placeholder",
            ArtifactKind::Terminal => "terminal",
        }
    }
}

/// Encoded frame plus the counters observed when it was produced. Immutable
/// once published; subscribers share it behind an `Arc`.
#[derive(Clone, Debug)]
pub(crate) struct Artifact {
    /// Assigned by the hub on publish, strictly increasing.
    pub(crate) sequence: u64,
    pub(crate) kind: ArtifactKind,
    pub(crate) jpeg: Bytes,
    pub(crate) counters: CountersSnapshot,
    pub(crate) timestamp_ms: i64,
}

impl Artifact {
    pub(crate) fn new(
        kind: ArtifactKind,
        jpeg: Bytes,
        counters: CountersSnapshot,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            sequence: 0,
            kind,
            jpeg,
            counters,
            timestamp_ms,
        }
    }
}

/// Per-tick faults. Contained within the tick; never surfaced to clients.
#[derive(Debug, Error)]
pub(crate) enum Fault {
    #[error("acquisition fault: {0}")]
    Acquisition(#[from] CaptureError),
    #[error("detection fault: {0}")]
    Detection(#[from] DetectionError),
    #[error("encoding fault: {0}")]
    Encoding(#[from] image::ImageError),
}

impl Fault {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Fault::Acquisition(_) => "acquisition",
            Fault::Detection(_) => "detection",
            Fault::Encoding(_) => "encoding",
        }
    }
}

#[derive(Serialize)]
pub(crate) struct CountResponse {
    #[serde(rename = "peopleCount")]
    pub(crate) people_count: u64,
}

#[derive(Serialize)]
pub(crate) struct StatsResponse {
    pub(crate) frame: u64,
    pub(crate) people: u64,
    pub(crate) max_people: u64,
    pub(crate) total_people: u64,
    pub(crate) detection_faults: u64,
    pub(crate) encoding_faults: u64,
    pub(crate) acquisition_faults: u64,
    pub(crate) subscribers: usize,
    pub(crate) state: RunState,
}

impl StatsResponse {
    pub(crate) fn new(snapshot: CountersSnapshot, subscribers: usize, state: RunState) -> Self {
        Self {
            frame: snapshot.frames_processed,
            people: snapshot.current_count,
            max_people: snapshot.max_count_observed,
            total_people: snapshot.total_people,
            detection_faults: snapshot.detection_faults,
            encoding_faults: snapshot.encoding_faults,
            acquisition_faults: snapshot.acquisition_faults,
            subscribers,
            state,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) component: Option<&'static str>,
}

impl StatusResponse {
    pub(crate) fn new(status: &'static str) -> Self {
        Self {
            status,
            component: None,
        }
    }
}

/// Final record of a file processing run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub max_people: u64,
    pub frames: u64,
    pub total_people: u64,
    pub output_file: String,
}
