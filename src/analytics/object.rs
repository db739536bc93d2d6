use std::time::Instant;

use ndarray::{Array4, ArrayViewD};
use opencv::core::{Mat, Point, Rect, Scalar, Size, BORDER_CONSTANT};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;

use crate::config::DetectorConfig;
use crate::frame::{FrameGeometry, RawFrame};

use super::{BoxError, Detection, Inference, InferenceAdapter, InferenceError};

const YOLO_INPUT_SIZE: u32 = 640;
const LETTERBOX_FILL: f64 = 114.0;

/// Detection in frame pixel coordinates.
#[derive(Debug, Clone, Copy)]
struct LocatedDetection {
    detection: Detection,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

/// ONNX YOLO model emitting `logits` `[1, N, C]` and `pred_boxes` `[1, N, 4]`.
pub struct ObjectDetector {
    session: Session,
    confidence_threshold: f32,
    labels: Vec<String>,
}

impl ObjectDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, BoxError> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?;

        let path = config.model_path.as_str();
        let session = if path.starts_with("http://") || path.starts_with("https://") {
            builder.commit_from_url(path)?
        } else {
            builder.commit_from_file(path)?
        };

        tracing::info!(model = %path, "object detector loaded");

        Ok(Self {
            session,
            confidence_threshold: config.confidence_threshold,
            labels: config.labels.clone(),
        })
    }

    /// Runs one blank frame so the first real tick does not pay for session setup.
    pub fn warm_up(&mut self, geometry: FrameGeometry) -> Result<(), InferenceError> {
        let blank = RawFrame::new(vec![0; geometry.frame_byte_size()], geometry)
            .map_err(|_| BoxError::from("blank frame size mismatch"))?;
        let started = Instant::now();
        self.infer(&blank)?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detector warm-up complete"
        );
        Ok(())
    }

    fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    fn run(&mut self, frame: &RawFrame) -> Result<Inference, BoxError> {
        let height = frame.geometry().height() as i32;
        let mut canvas = Mat::from_slice(frame.as_bytes())?
            .reshape(3, height)?
            .try_clone()?;

        let located = self.detect(&canvas)?;
        self.annotate(&mut canvas, &located)?;

        Ok(Inference {
            annotated: canvas.data_bytes()?.to_vec(),
            detections: located.iter().map(|l| l.detection).collect(),
        })
    }

    fn detect(&mut self, frame: &Mat) -> Result<Vec<LocatedDetection>, BoxError> {
        let rows = frame.rows();
        let cols = frame.cols();
        if rows == 0 || cols == 0 {
            return Ok(Vec::new());
        }

        let (input_tensor, scale, pad_x, pad_y) = preprocess(frame)?;

        let tensor_ref = TensorRef::from_array_view(input_tensor.view())?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref])?;

        let (Some(logits_val), Some(boxes_val)) =
            (outputs.get("logits"), outputs.get("pred_boxes"))
        else {
            return Err("model must expose 'logits' and 'pred_boxes' outputs".into());
        };

        let logits = logits_val.try_extract_array::<f32>()?.to_owned();
        let boxes = boxes_val.try_extract_array::<f32>()?.to_owned();
        drop(outputs);

        postprocess(
            &logits.view(),
            &boxes.view(),
            self.confidence_threshold,
            Letterbox {
                scale,
                pad_x,
                pad_y,
            },
            cols as f32,
            rows as f32,
        )
    }

    fn annotate(&self, canvas: &mut Mat, located: &[LocatedDetection]) -> Result<(), BoxError> {
        let color = Scalar::new(0.0, 255.0, 0.0, 0.0);
        for l in located {
            let rect = Rect::new(
                l.x.round() as i32,
                l.y.round() as i32,
                l.width.round().max(1.0) as i32,
                l.height.round().max(1.0) as i32,
            );
            imgproc::rectangle(canvas, rect, color, 2, imgproc::LINE_8, 0)?;

            let text = format!(
                "{} {:.2}",
                self.label(l.detection.class_id),
                l.detection.confidence
            );
            let origin = Point::new(rect.x, (rect.y - 6).max(12));
            imgproc::put_text(
                canvas,
                &text,
                origin,
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }
        Ok(())
    }
}

impl InferenceAdapter for ObjectDetector {
    fn infer(&mut self, frame: &RawFrame) -> Result<Inference, InferenceError> {
        Ok(self.run(frame)?)
    }
}

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Letterboxes a BGR frame into a normalised `[1, 3, 640, 640]` RGB tensor.
fn preprocess(frame: &Mat) -> Result<(Array4<f32>, f32, f32, f32), BoxError> {
    let rows = frame.rows() as f32;
    let cols = frame.cols() as f32;
    let input_size = YOLO_INPUT_SIZE as f32;

    let scale = (input_size / cols).min(input_size / rows);
    let new_w = (cols * scale).round() as i32;
    let new_h = (rows * scale).round() as i32;

    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(new_w, new_h),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let pad_x = (input_size as i32 - new_w) / 2;
    let pad_y = (input_size as i32 - new_h) / 2;

    let mut padded = Mat::default();
    opencv::core::copy_make_border(
        &resized,
        &mut padded,
        pad_y,
        input_size as i32 - new_h - pad_y,
        pad_x,
        input_size as i32 - new_w - pad_x,
        BORDER_CONSTANT,
        Scalar::new(LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL, 0.0),
    )?;

    let mut rgb = Mat::default();
    imgproc::cvt_color_def(&padded, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    let side = YOLO_INPUT_SIZE as usize;
    let data = rgb.data_bytes()?;
    if data.len() < side * side * 3 {
        return Err("letterboxed frame too small".into());
    }

    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for y in 0..side {
        for x in 0..side {
            let idx = (y * side + x) * 3;
            tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
            tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
        }
    }

    Ok((tensor, scale, pad_x as f32, pad_y as f32))
}

fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

fn postprocess(
    logits: &ArrayViewD<f32>,
    boxes: &ArrayViewD<f32>,
    confidence_threshold: f32,
    letterbox: Letterbox,
    frame_w: f32,
    frame_h: f32,
) -> Result<Vec<LocatedDetection>, BoxError> {
    let logits_shape = logits.shape();
    if logits_shape.len() < 2 || boxes.shape().len() < 2 {
        return Ok(Vec::new());
    }

    let (num_queries, num_classes) = match logits_shape {
        [_, n, c] => (*n, *c),
        [n, c] => (*n, *c),
        _ => return Err(format!("unexpected logits shape {:?}", logits_shape).into()),
    };

    let logits_flat = logits.as_slice().ok_or("logits are not contiguous")?;
    let boxes_flat = boxes.as_slice().ok_or("boxes are not contiguous")?;
    if boxes_flat.len() < num_queries * 4 {
        return Err("fewer boxes than queries".into());
    }

    let input_size = YOLO_INPUT_SIZE as f32;
    let mut detections = Vec::new();

    for i in 0..num_queries {
        let row = &logits_flat[i * num_classes..(i + 1) * num_classes];
        let Some((class_id, confidence)) = row
            .iter()
            .map(|&l| sigmoid(l))
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };

        if confidence < confidence_threshold {
            continue;
        }

        // (cx, cy, w, h) normalised to the letterboxed input
        let cx = boxes_flat[i * 4] * input_size;
        let cy = boxes_flat[i * 4 + 1] * input_size;
        let w = boxes_flat[i * 4 + 2] * input_size;
        let h = boxes_flat[i * 4 + 3] * input_size;

        let x = (((cx - w / 2.0) - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_w);
        let y = (((cy - h / 2.0) - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_h);
        let width = (w / letterbox.scale).min(frame_w - x);
        let height = (h / letterbox.scale).min(frame_h - y);

        detections.push(LocatedDetection {
            detection: Detection {
                class_id,
                confidence,
            },
            x,
            y,
            width,
            height,
        });
    }

    Ok(detections)
}
