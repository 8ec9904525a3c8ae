//! Stage-descriptor registry: exposes the inferline core components as
//! named stages a host pipeline runtime can discover and instantiate.
//! The host's own plugin ABI sits above this table and is not modeled
//! here.

use std::sync::Arc;

use anyhow::{bail, Result};
use hashbrown::HashMap;
use log::debug;
use tokio::sync::mpsc::UnboundedReceiver;

use inferline_core::batch::BatchAccumulator;
use inferline_core::configuration::InferenceConfiguration;
use inferline_core::dispatch::{InferenceBackend, InferenceDispatcher};
use inferline_core::output::SurfaceOutcome;
use inferline_core::surface::SurfacePool;
use inferline_core::sync::SyncManager;

pub const SURFACE_SYNC: &str = "surface_sync";
pub const BATCH_PROC: &str = "batch_proc";
pub const TENSOR_INFERENCE: &str = "tensor_inference";
pub const VIDEO_INFERENCE: &str = "video_inference";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Sync,
    BatchProc,
    Inference,
}

/// Output interpretation of an inference stage: raw layer tensors or
/// decoded per-frame detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceVariant {
    Tensor,
    Video,
}

/// Everything a factory needs to build its stage.
pub struct ElementInit {
    pub configuration: InferenceConfiguration,
    pub pool: Arc<SurfacePool>,
    pub backend: Option<Arc<dyn InferenceBackend>>,
}

pub enum Element {
    Sync(Arc<SyncManager>),
    BatchProc(BatchAccumulator),
    Inference {
        dispatcher: Arc<InferenceDispatcher>,
        output: UnboundedReceiver<SurfaceOutcome>,
        variant: InferenceVariant,
    },
}

pub struct ElementDesc {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ElementKind,
    pub factory: fn(ElementInit) -> Result<Element>,
}

fn surface_sync(_init: ElementInit) -> Result<Element> {
    Ok(Element::Sync(Arc::new(SyncManager::new())))
}

fn batch_proc(init: ElementInit) -> Result<Element> {
    Ok(Element::BatchProc(BatchAccumulator::new(
        init.configuration.max_batch_size,
        init.configuration.max_batch_wait,
    )))
}

fn inference(init: ElementInit, variant: InferenceVariant) -> Result<Element> {
    let Some(backend) = init.backend else {
        bail!("inference stages require a backend");
    };
    let (dispatcher, output) =
        InferenceDispatcher::new(backend, init.pool, &init.configuration);
    Ok(Element::Inference {
        dispatcher: Arc::new(dispatcher),
        output,
        variant,
    })
}

fn tensor_inference(init: ElementInit) -> Result<Element> {
    inference(init, InferenceVariant::Tensor)
}

fn video_inference(init: ElementInit) -> Result<Element> {
    inference(init, InferenceVariant::Video)
}

/// The export table the host enumerates.
pub const ELEMENTS: &[ElementDesc] = &[
    ElementDesc {
        name: SURFACE_SYNC,
        description: "Waits for hardware completion fences on surfaces",
        kind: ElementKind::Sync,
        factory: surface_sync,
    },
    ElementDesc {
        name: BATCH_PROC,
        description: "Accumulates ready surfaces into inference-sized batches",
        kind: ElementKind::BatchProc,
        factory: batch_proc,
    },
    ElementDesc {
        name: TENSOR_INFERENCE,
        description: "Batched inference emitting raw output tensors",
        kind: ElementKind::Inference,
        factory: tensor_inference,
    },
    ElementDesc {
        name: VIDEO_INFERENCE,
        description: "Batched inference emitting per-frame detections",
        kind: ElementKind::Inference,
        factory: video_inference,
    },
];

pub fn registry() -> HashMap<&'static str, &'static ElementDesc> {
    ELEMENTS.iter().map(|desc| (desc.name, desc)).collect()
}

pub fn make_element(name: &str, init: ElementInit) -> Result<Element> {
    let Some(desc) = ELEMENTS.iter().find(|desc| desc.name == name) else {
        bail!("unknown element: {}", name);
    };
    debug!("instantiating element {}", name);
    (desc.factory)(init)
}
