use thiserror::Error;

use crate::labels::class_label;

/// Class index of "person" in the COCO taxonomy used by YOLO checkpoints.
pub const PERSON_CLASS_ID: i64 = 0;

/// Single detection in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub label: String,
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: i64, bbox: [f32; 4], confidence: f32) -> Self {
        Self {
            class_id,
            label: class_label(class_id).to_string(),
            bbox,
            confidence,
        }
    }

    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID || self.label == "person"
    }

    /// Centre of the bounding box.
    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.bbox[0] + self.bbox[2]) / 2.0,
            (self.bbox[1] + self.bbox[3]) / 2.0,
        )
    }

    pub fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.bbox[0].max(other.bbox[0]);
        let top = self.bbox[1].max(other.bbox[1]);
        let right = self.bbox[2].min(other.bbox[2]);
        let bottom = self.bbox[3].min(other.bbox[3]);
        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detector did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("detector is still busy with a previous frame")]
    Busy,
    #[error("detector worker is not running")]
    Unavailable,
    #[error("invalid detector input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(#[source] anyhow::Error),
}

/// Synchronous object detector over BGR8 frames.
///
/// Implementations are driven from a single thread and need not be reentrant.
/// The input slice is borrowed immutably; detectors never alter the frame.
pub trait Detector: Send {
    fn detect(
        &mut self,
        bgr: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectionError>;

    /// Short description for startup logs.
    fn describe(&self) -> String {
        "detector".to_string()
    }
}

/// Greedy per-class non-maximum suppression. Keeps the highest scoring box of
/// every overlapping group.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.iou(&det) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_detection_uses_coco_label() {
        let det = Detection::new(PERSON_CLASS_ID, [10.0, 20.0, 30.0, 60.0], 0.9);
        assert_eq!(det.label, "person");
        assert!(det.is_person());
        assert_eq!(det.centroid(), (20.0, 40.0));
        assert!(!Detection::new(2, [0.0; 4], 0.5).is_person());
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = Detection::new(0, [0.0, 0.0, 10.0, 10.0], 0.9);
        let b = Detection::new(0, [20.0, 20.0, 30.0, 30.0], 0.9);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn nms_keeps_best_of_overlapping_boxes_per_class() {
        let dets = vec![
            Detection::new(0, [0.0, 0.0, 10.0, 10.0], 0.6),
            Detection::new(0, [1.0, 1.0, 11.0, 11.0], 0.9),
            Detection::new(2, [1.0, 1.0, 11.0, 11.0], 0.5),
            Detection::new(0, [50.0, 50.0, 60.0, 60.0], 0.4),
        ];
        let kept = non_max_suppression(dets, 0.45);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert!(kept.iter().any(|d| d.class_id == 2));
        assert!(kept.iter().any(|d| d.bbox[0] == 50.0));
    }
}
