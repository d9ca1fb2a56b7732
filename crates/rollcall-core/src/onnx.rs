//! SCRFD detection + ArcFace encoding via ONNX Runtime.
//!
//! Faces are located with the SCRFD `det_10g` model (3-stride anchor
//! decoding, NMS), aligned on their five landmarks, and encoded to
//! 512-dimensional L2-normalized embeddings with `w600k_r50`. Distance is cosine distance,
//! so `1 - distance` is the cosine similarity of the pair.

use crate::alignment::align_face;
use crate::embedder::{EmbedderError, FaceEmbedder, FaceMetric};
use crate::types::{BoundingBox, Detection, Embedding};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const ENCODER_MODEL_FILE: &str = "w600k_r50.onnx";

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = 9;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Score, bbox and keypoint output positions for one stride.
type StrideOutputIndices = (usize, usize, usize);

/// Extra context kept around the detector box when no landmarks are available.
const CROP_MARGIN: f32 = 0.2;

/// Mapping from the padded model input back to source pixels.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Production face embedder backed by two ONNX sessions.
pub struct OnnxEmbedder {
    detector: Session,
    encoder: Session,
    output_indices: [StrideOutputIndices; 3],
    detection_threshold: f32,
    min_face_size: f32,
}

impl OnnxEmbedder {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EmbedderError> {
        let detector = load_session(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let outputs = detector.outputs().len();
        if outputs < SCRFD_OUTPUTS {
            return Err(EmbedderError::InferenceFailed(format!(
                "SCRFD model requires {SCRFD_OUTPUTS} outputs (3 strides × score/bbox/kps), got {outputs}"
            )));
        }
        let names: Vec<String> = detector.outputs().iter().map(|o| o.name().to_string()).collect();
        let output_indices = discover_output_indices(&names);
        let encoder = load_session(&model_dir.join(ENCODER_MODEL_FILE))?;

        Ok(Self {
            detector,
            encoder,
            output_indices,
            detection_threshold: 0.5,
            min_face_size: 20.0,
        })
    }

    /// Minimum detector score for a box to count as a face.
    pub fn with_detection_threshold(mut self, threshold: f32) -> Self {
        self.detection_threshold = threshold;
        self
    }

    /// Faces whose shorter side is below `pixels` are ignored.
    pub fn with_min_face_size(mut self, pixels: u32) -> Self {
        self.min_face_size = pixels as f32;
        self
    }

    fn locate(&mut self, rgb: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        let (input, letterbox) = letterbox_tensor(rgb);
        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut boxes = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in
            SCRFD_STRIDES.iter().zip(&self.output_indices)
        {
            let extract = |idx: usize, what: &str| {
                outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    EmbedderError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                })
            };
            let (_, scores) = extract(score_idx, "scores")?;
            let (_, deltas) = extract(bbox_idx, "bboxes")?;
            let (_, kps) = extract(kps_idx, "keypoints")?;
            boxes.extend(decode_stride(
                scores,
                deltas,
                kps,
                stride,
                &letterbox,
                self.detection_threshold,
            ));
        }

        let mut faces = nms(boxes, SCRFD_NMS_THRESHOLD);
        faces.retain(|b| b.width.min(b.height) >= self.min_face_size);
        Ok(faces)
    }

    fn encode(&mut self, rgb: &RgbImage, face: &BoundingBox) -> Result<Embedding, EmbedderError> {
        let crop = match &face.landmarks {
            Some(landmarks) => align_face(rgb, landmarks),
            None => crop_face(rgb, face),
        };
        let input = arcface_tensor(&crop);
        let outputs = self
            .encoder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

impl FaceMetric for OnnxEmbedder {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        (1.0 - a.similarity(b)).max(0.0)
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>, EmbedderError> {
        let rgb = image.to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Ok(Vec::new());
        }

        let boxes = self.locate(&rgb)?;
        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.encode(&rgb, &bbox)?;
            detections.push(Detection { bbox, embedding });
        }

        tracing::debug!(faces = detections.len(), "onnx: faces encoded");
        Ok(detections)
    }
}

fn load_session(path: &Path) -> Result<Session, EmbedderError> {
    if !path.exists() {
        return Err(EmbedderError::ModelNotFound(path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)
        .map_err(ort::Error::from)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Map each stride to its (score, bbox, kps) output position.
///
/// Exports that name their tensors `score_8`, `bbox_16`, `kps_32`, ... are
/// matched by name. Anything else gets the standard positional order:
/// [0-2] scores, [3-5] bboxes, [6-8] keypoints.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let lookup = |stride: usize| -> Option<StrideOutputIndices> {
        Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?))
    };

    match (lookup(SCRFD_STRIDES[0]), lookup(SCRFD_STRIDES[1]), lookup(SCRFD_STRIDES[2])) {
        (Some(s8), Some(s16), Some(s32)) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [s8, s16, s32]
        }
        _ => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Fit the image into the square SCRFD input, centred, as a normalized NCHW tensor.
fn letterbox_tensor(rgb: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = rgb.dimensions();
    let target = SCRFD_INPUT_SIZE as f32;
    let scale = (target / width as f32).min(target / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    // Zero is the normalized value of the mean, so padding stays neutral.
    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Decode the anchor grid of one stride into source-space boxes.
/// Keypoints are attached when the kps tensor covers the anchor.
fn decode_stride(
    scores: &[f32],
    deltas: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let d = deltas.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_source(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step)
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence, highest first.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// Square crop around the face with a margin, clamped to the image, resized for ArcFace.
fn crop_face(rgb: &RgbImage, face: &BoundingBox) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let side = face.width.max(face.height) * (1.0 + CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).clamp(0.0, width as f32) as u32;
    let y0 = (cy - side / 2.0).clamp(0.0, height as f32) as u32;
    let x1 = (cx + side / 2.0).clamp(0.0, width as f32) as u32;
    let y1 = (cy + side / 2.0).clamp(0.0, height as f32) as u32;

    let region = if x1 > x0 && y1 > y0 {
        imageops::crop_imm(rgb, x0, y0, x1 - x0, y1 - y0).to_image()
    } else {
        rgb.clone()
    };

    imageops::resize(&region, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle)
}

fn arcface_tensor(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
