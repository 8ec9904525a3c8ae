#![allow(dead_code)]

use parking_lot::Mutex;

use inferline_core::batch::Batch;
use inferline_core::dispatch::{CompletionSender, InferenceBackend};
use inferline_core::output::{InferenceOutput, Tensor};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn identity_outputs(batch: &Batch) -> Vec<InferenceOutput> {
    batch
        .surfaces()
        .iter()
        .map(|s| {
            InferenceOutput::Tensors(vec![Tensor {
                layer_name: "identity".to_string(),
                dims: vec![1],
                data: vec![s.seq() as f32],
            }])
        })
        .collect()
}

/// Backend that completes every batch inline with identity tensors.
pub struct EchoBackend;

impl InferenceBackend for EchoBackend {
    fn execute(&self, batch: Batch, done: CompletionSender) {
        let outputs = identity_outputs(&batch);
        let _ = done.send(Ok(outputs));
    }
}

/// Backend that parks submitted batches until the test decides when,
/// and in which order, they complete.
#[derive(Default)]
pub struct ControlledBackend {
    pending: Mutex<Vec<(Batch, CompletionSender)>>,
}

impl ControlledBackend {
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn take_all(&self) -> Vec<(Batch, CompletionSender)> {
        std::mem::take(&mut self.pending.lock())
    }

    pub fn complete_ok(batch: Batch, done: CompletionSender) {
        let outputs = identity_outputs(&batch);
        let _ = done.send(Ok(outputs));
    }
}

impl InferenceBackend for ControlledBackend {
    fn execute(&self, batch: Batch, done: CompletionSender) {
        self.pending.lock().push((batch, done));
    }
}
