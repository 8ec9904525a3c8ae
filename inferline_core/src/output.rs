use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw output tensor for one surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub layer_name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label_id: i64,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Per-surface backend output. Tensor-stage backends return raw layer
/// tensors, video-stage backends return decoded detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InferenceOutput {
    Tensors(Vec<Tensor>),
    Detections(Vec<Detection>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutcomeError {
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Terminal event for one accepted surface. Exactly one outcome is
/// delivered per surface, in non-decreasing `seq` order.
#[derive(Debug)]
pub struct SurfaceOutcome {
    pub surface_id: Uuid,
    pub seq: u64,
    pub batch_id: Option<Uuid>,
    pub result: Result<InferenceOutput, OutcomeError>,
}
