use kestrel_types::DetectionRow;

#[derive(thiserror::Error, Debug, Clone)]
pub enum BackendError {
    /// The model could not be loaded or is structurally incompatible.
    /// Fatal for the owning worker; the arbiter removes it from rotation.
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),
    /// A transient inference failure; the request is eligible for requeue.
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// One raw inference result, before host-side postprocessing.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// SSD-style four-tensor output: per-row boxes `[y1, x1, y2, x2]`
    /// (normalized), class ids, scores, and a valid-row count.
    Ssd {
        boxes: Vec<[f32; 4]>,
        classes: Vec<f32>,
        scores: Vec<f32>,
        count: usize,
    },
    /// YOLO-style single-tensor output, one row per candidate box, already
    /// dequantized by the backend and in model-input pixel units.
    Yolo { rows: Vec<YoloRow> },
}

/// One YOLO candidate: center-format box plus per-class scores.
#[derive(Debug, Clone, PartialEq)]
pub struct YoloRow {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub class_scores: Vec<f32>,
}

/// One accelerator device with one loaded model.
///
/// Implementations own their device exclusively: a backend is moved into a
/// single worker thread and never shared.
pub trait AccelBackend: Send {
    /// Run inference over a `side*side*3` u8 HWC tensor.
    fn detect(&mut self, input: &[u8]) -> Result<ModelOutput, BackendError>;

    fn name(&self) -> &str;
}

/// Dequantize `(x - zero_point) * scale`, the standard affine scheme.
pub fn dequantize(data: &[u8], scale: f32, zero_point: i32) -> Vec<f32> {
    data.iter()
        .map(|v| (*v as i32 - zero_point) as f32 * scale)
        .collect()
}

/// Pre-scale a u8 input tensor for quantized models:
/// `(x − zp·255) · (1 / (s·255))`.
pub fn quantized_input_prescale(input: &[u8], scale: f32, zero_point: i32) -> Vec<f32> {
    let offset = scale * zero_point as f32 * 255.0;
    let factor = 1.0 / (scale * 255.0);
    input
        .iter()
        .map(|v| (*v as f32 - offset) * factor)
        .collect()
}

/// A backend that returns a fixed script of outputs, cycling when exhausted.
///
/// Used for synthetic pipelines and tests; it exercises the full
/// request/dispatch/postprocess path without an inference runtime.
pub struct StaticBackend {
    name: String,
    script: Vec<Result<ModelOutput, BackendError>>,
    at: usize,
    /// Artificial per-inference latency.
    pub latency: std::time::Duration,
}

impl StaticBackend {
    pub fn new(name: &str, script: Vec<Result<ModelOutput, BackendError>>) -> StaticBackend {
        StaticBackend {
            name: name.to_string(),
            script,
            at: 0,
            latency: std::time::Duration::ZERO,
        }
    }

    /// A backend that always reports the same detections.
    pub fn fixed(name: &str, rows: Vec<DetectionRow>) -> StaticBackend {
        let output = ModelOutput::Ssd {
            boxes: rows.iter().map(|r| [r.y1, r.x1, r.y2, r.x2]).collect(),
            classes: rows.iter().map(|r| r.class_id as f32).collect(),
            scores: rows.iter().map(|r| r.score).collect(),
            count: rows.len(),
        };
        StaticBackend::new(name, vec![Ok(output)])
    }

    /// A backend that never finds anything.
    pub fn empty(name: &str) -> StaticBackend {
        StaticBackend::fixed(name, Vec::new())
    }
}

impl AccelBackend for StaticBackend {
    fn detect(&mut self, _input: &[u8]) -> Result<ModelOutput, BackendError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let item = self.script[self.at % self.script.len()].clone();
        self.at += 1;
        item
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(feature = "onnx")]
pub mod onnx {
    use super::{AccelBackend, BackendError, ModelOutput, YoloRow};

    /// ONNX Runtime backend. One session per worker; the execution provider
    /// (CPU or GPU) is chosen at session build time.
    pub struct OnnxBackend {
        name: String,
        session: ort::session::Session,
        input_side: usize,
        yolo: bool,
    }

    impl OnnxBackend {
        pub fn load(
            name: &str,
            model_path: &std::path::Path,
            input_side: usize,
            yolo: bool,
        ) -> Result<OnnxBackend, BackendError> {
            let session = ort::session::Session::builder()
                .and_then(|b| b.commit_from_file(model_path))
                .map_err(|e| BackendError::ModelLoadFailed(e.to_string()))?;
            Ok(OnnxBackend {
                name: name.to_string(),
                session,
                input_side,
                yolo,
            })
        }
    }

    impl AccelBackend for OnnxBackend {
        fn detect(&mut self, input: &[u8]) -> Result<ModelOutput, BackendError> {
            let side = self.input_side;
            let data: Vec<f32> = input.iter().map(|v| *v as f32 / 255.0).collect();
            let value = ort::value::Value::from_array((
                [1usize, side, side, 3],
                data,
            ))
            .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;
            let outputs = self
                .session
                .run(ort::inputs![value])
                .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;

            if self.yolo {
                let (shape, data) = outputs[0]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;
                let cols = *shape.last().unwrap_or(&0) as usize;
                if cols < 5 {
                    return Err(BackendError::InferenceFailed(format!(
                        "unexpected yolo output shape {shape:?}"
                    )));
                }
                let rows = data
                    .chunks_exact(cols)
                    .map(|r| YoloRow {
                        cx: r[0] * side as f32,
                        cy: r[1] * side as f32,
                        w: r[2] * side as f32,
                        h: r[3] * side as f32,
                        class_scores: r[4..].to_vec(),
                    })
                    .collect();
                Ok(ModelOutput::Yolo { rows })
            } else {
                let extract = |i: usize| -> Result<Vec<f32>, BackendError> {
                    let (_shape, data) = outputs[i]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| BackendError::InferenceFailed(e.to_string()))?;
                    Ok(data.to_vec())
                };
                let raw_boxes = extract(0)?;
                let classes = extract(1)?;
                let scores = extract(2)?;
                let count = extract(3)?.first().copied().unwrap_or(0.0) as usize;
                let boxes = raw_boxes
                    .chunks_exact(4)
                    .map(|b| [b[0], b[1], b[2], b[3]])
                    .collect();
                Ok(ModelOutput::Ssd {
                    boxes,
                    classes,
                    scores,
                    count,
                })
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequantize() {
        let out = dequantize(&[0, 10, 255], 0.5, 10);
        assert_eq!(out, vec![-5.0, 0.0, 122.5]);
    }

    #[test]
    fn test_quantized_input_prescale() {
        // scale 0.01, zp 2: offset = 5.1, factor = 1/2.55
        let out = quantized_input_prescale(&[0, 255], 0.01, 2);
        assert!((out[0] - (-2.0)).abs() < 1e-5);
        assert!((out[1] - (255.0 - 5.1) / 2.55).abs() < 1e-4);
    }

    #[test]
    fn test_static_backend_cycles_script() {
        let mut b = StaticBackend::new(
            "s",
            vec![
                Ok(ModelOutput::Ssd {
                    boxes: vec![],
                    classes: vec![],
                    scores: vec![],
                    count: 0,
                }),
                Err(BackendError::InferenceFailed("boom".to_string())),
            ],
        );
        assert!(b.detect(&[]).is_ok());
        assert!(b.detect(&[]).is_err());
        assert!(b.detect(&[]).is_ok());
    }
}
