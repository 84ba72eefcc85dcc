use std::{convert::TryFrom, path::Path};

use tch::{self, Device, Kind, Tensor};
use thiserror::Error;

/// Upper bound on detections returned for a single frame.
const MAX_DETECTIONS: usize = 512;

/// Single detection returned by a detector, box corners in input pixels.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub bbox_xyxy: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

/// Per-frame object detection over raw BGR pixel data.
pub trait Detector: Send {
    fn detect_bgr(&self, data: &[u8], width: i32, height: i32)
        -> Result<Vec<Detection>, DetectError>;
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unexpected frame buffer size: got {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("frame size {width}x{height} does not match detector input {input_w}x{input_h}")]
    InputSize {
        width: i32,
        height: i32,
        input_w: i64,
        input_h: i64,
    },
    #[error("unexpected detector output shape: {0:?}")]
    OutputShape(Vec<i64>),
    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

/// TorchScript-backed detector wrapper.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_floor: f32,
}

impl TorchDetector {
    /// Load a TorchScript module and prepare it for execution on `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self, DetectError> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            confidence_floor: 0.25,
        })
    }

    /// Override the confidence floor applied before detections are returned.
    pub fn with_confidence_floor(mut self, confidence: f32) -> Self {
        self.confidence_floor = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> (i64, i64) {
        self.input_size
    }

    /// Converts a BGR frame into a normalized NCHW RGB tensor.
    fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor, DetectError> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            return Err(DetectError::BufferSize {
                got: bgr.len(),
                expected,
            });
        }

        let (in_w, in_h) = self.input_size;
        if (width as i64, height as i64) != (in_w, in_h) {
            return Err(DetectError::InputSize {
                width,
                height,
                input_w: in_w,
                input_h: in_h,
            });
        }

        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;

        Ok(tensor)
    }
}

impl Detector for TorchDetector {
    fn detect_bgr(
        &self,
        data: &[u8],
        width: i32,
        height: i32,
    ) -> Result<Vec<Detection>, DetectError> {
        let input = self.bgr_to_tensor(data, width, height)?;
        let output = self.module.forward_ts(&[input])?;

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectError::OutputShape(shape));
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        Ok(detections_from_rows(rows, self.confidence_floor))
    }
}

/// Convert raw prediction rows `[cx, cy, w, h, conf, class?]` into corner-box
/// detections, applying the confidence floor.
fn detections_from_rows(rows: Vec<Vec<f32>>, confidence_floor: f32) -> Vec<Detection> {
    let mut detections = Vec::new();
    for row in rows {
        if row.len() < 5 {
            continue;
        }
        let score = row[4];
        if score < confidence_floor {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let bbox_xyxy = [
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
        ];
        let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };

        detections.push(Detection {
            bbox_xyxy,
            score,
            class_id,
        });
        if detections.len() >= MAX_DETECTIONS {
            break;
        }
    }
    detections
}
