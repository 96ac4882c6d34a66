use std::{convert::TryFrom, path::Path};

use anyhow::Context;
use tch::{self, Device, Kind, Tensor};

use crate::detection::{Detection, DetectionError, Detector, non_max_suppression};

const MAX_DETECTIONS: usize = 512;

/// TorchScript export of a YOLOv8-style model (`[1, 4 + classes, anchors]`
/// output, boxes as centre/size in model input pixels).
pub struct YoloDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> anyhow::Result<Self> {
        let path = model_path.as_ref();
        let mut module = tch::CModule::load_on_device(path, device)
            .with_context(|| format!("failed to load TorchScript model {}", path.display()))?;
        module.set_eval();
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    /// Convert a BGR8 frame into a normalised RGB NCHW tensor at model size.
    fn bgr_to_tensor(&self, bgr: &[u8], width: u32, height: u32) -> Result<Tensor, DetectionError> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            return Err(DetectionError::InvalidInput(format!(
                "frame buffer holds {} bytes, expected {expected}",
                bgr.len()
            )));
        }
        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .view([height as i64, width as i64, 3])
            .flip([2])
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            / 255.0;
        Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
    }

    fn decode(&self, output: &Tensor, width: u32, height: u32) -> anyhow::Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            anyhow::bail!("unexpected detector output shape: {shape:?}");
        }
        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = width as f32 / in_w as f32;
        let scale_y = height as f32 / in_h as f32;
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = [
                ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
            ];
            detections.push(Detection::new(class_id as i64, bbox, score));
        }

        let mut kept = non_max_suppression(detections, self.iou_threshold);
        kept.truncate(MAX_DETECTIONS);
        Ok(kept)
    }
}

impl Detector for YoloDetector {
    fn detect(
        &mut self,
        bgr: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectionError> {
        let input = self.bgr_to_tensor(bgr, width, height)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| DetectionError::Inference(err.into()))?;
        self.decode(&output, width, height)
            .map_err(DetectionError::Inference)
    }

    fn describe(&self) -> String {
        format!(
            "TorchScript YOLO on {:?} (input {}x{})",
            self.device, self.input_size.0, self.input_size.1
        )
    }
}
