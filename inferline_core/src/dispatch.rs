use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use uuid::Uuid;

use crate::batch::Batch;
use crate::configuration::InferenceConfiguration;
use crate::output::{InferenceOutput, OutcomeError, SurfaceOutcome};
use crate::reorder::{ReorderError, ReorderQueue};
use crate::surface::SurfacePool;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The batch failed; other batches are unaffected.
    #[error("batch execution failed: {0}")]
    Batch(String),
    /// The device is gone; the dispatcher halts.
    #[error("device lost: {0}")]
    Device(String),
}

pub type CompletionSender = oneshot::Sender<Result<Vec<InferenceOutput>, BackendError>>;

/// External inference collaborator. Executes a batch asynchronously and
/// resolves the completion exactly once with one output per surface, in
/// batch order, or with an error.
pub trait InferenceBackend: Send + Sync + 'static {
    fn execute(&self, batch: Batch, done: CompletionSender);
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is halted")]
    Halted,
    #[error("batch {0} is empty")]
    EmptyBatch(Uuid),
    #[error(transparent)]
    Reorder(#[from] ReorderError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatcherStats {
    pub surfaces_tracked: usize,
    pub batches_submitted: usize,
    pub batches_failed: usize,
    pub outcomes_emitted: usize,
    pub in_flight: usize,
    pub in_flight_high_water: usize,
}

struct DispatcherState {
    queue: ReorderQueue,
    output: Option<mpsc::UnboundedSender<SurfaceOutcome>>,
    stats: DispatcherStats,
    halted: bool,
}

struct Shared {
    state: Mutex<DispatcherState>,
    pool: Arc<SurfacePool>,
    slots: Arc<Semaphore>,
}

impl Shared {
    /// Emits the contiguous ready prefix and returns the surfaces of the
    /// emitted outcomes to the pool. Call with the state lock held.
    fn emit_ready(&self, state: &mut DispatcherState) {
        for outcome in state.queue.drain() {
            if let Err(e) = self.pool.release(outcome.surface_id) {
                error!("surface release failed on emission: {}", e);
            }
            state.stats.outcomes_emitted += 1;
            if let Some(output) = &state.output {
                if output.send(outcome).is_err() {
                    debug!("downstream consumer is gone, dropping output channel");
                    state.output = None;
                }
            }
        }
    }

    /// One-way transition to `Halted`: cancels everything unemitted,
    /// releases the affected surfaces and closes the output stream.
    fn halt(&self, state: &mut DispatcherState, reason: &str) {
        if state.halted {
            return;
        }
        warn!("halting dispatcher: {}", reason);
        state.halted = true;
        self.slots.close();
        for outcome in state.queue.cancel_all() {
            if let Err(e) = self.pool.release(outcome.surface_id) {
                error!("surface release failed on cancellation: {}", e);
            }
            state.stats.outcomes_emitted += 1;
            if let Some(output) = &state.output {
                let _ = output.send(outcome);
            }
        }
        state.output = None;
    }
}

/// Submits sealed batches to the inference backend, bounds in-flight
/// requests and reconciles out-of-order completions back into stream
/// order. Terminal outcomes arrive on the receiver returned by `new`,
/// strictly ordered by sequence number.
pub struct InferenceDispatcher {
    backend: Arc<dyn InferenceBackend>,
    shared: Arc<Shared>,
    max_in_flight: usize,
}

impl InferenceDispatcher {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        pool: Arc<SurfacePool>,
        configuration: &InferenceConfiguration,
    ) -> (Self, mpsc::UnboundedReceiver<SurfaceOutcome>) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            backend,
            shared: Arc::new(Shared {
                state: Mutex::new(DispatcherState {
                    queue: ReorderQueue::new(),
                    output: Some(output_tx),
                    stats: DispatcherStats::default(),
                    halted: false,
                }),
                pool,
                slots: Arc::new(Semaphore::new(configuration.max_in_flight)),
            }),
            max_in_flight: configuration.max_in_flight,
        };
        (dispatcher, output_rx)
    }

    /// Registers an accepted surface in stream arrival order. Every
    /// tracked surface receives exactly one terminal outcome.
    pub fn track_surface(&self, seq: u64, surface_id: Uuid) -> Result<(), DispatchError> {
        let mut state = self.shared.state.lock();
        if state.halted {
            return Err(DispatchError::Halted);
        }
        state.queue.track(seq, surface_id)?;
        state.stats.surfaces_tracked += 1;
        Ok(())
    }

    /// Resolves a tracked surface with a per-frame hardware fault,
    /// keeping its slot in the ordered output stream.
    pub fn fail_surface(
        &self,
        seq: u64,
        surface_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), DispatchError> {
        let mut state = self.shared.state.lock();
        if state.halted {
            return Err(DispatchError::Halted);
        }
        state.queue.fulfill(SurfaceOutcome {
            surface_id,
            seq,
            batch_id: None,
            result: Err(OutcomeError::HardwareFault(reason.into())),
        })?;
        self.shared.emit_ready(&mut state);
        Ok(())
    }

    /// Submits one batch. Suspends while `max_in_flight` requests are
    /// outstanding; fails immediately once the dispatcher has halted.
    pub async fn submit(&self, batch: Batch) -> Result<(), DispatchError> {
        if batch.is_empty() {
            return Err(DispatchError::EmptyBatch(batch.id()));
        }
        if self.shared.state.lock().halted {
            return Err(DispatchError::Halted);
        }

        // admission control: one permit per in-flight request, held
        // until the completion resolves
        let permit = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Halted)?;

        let batch_id = batch.id();
        let entries: Vec<(u64, Uuid)> = batch
            .surfaces()
            .iter()
            .map(|s| (s.seq(), s.id()))
            .collect();
        {
            let mut state = self.shared.state.lock();
            if state.halted {
                return Err(DispatchError::Halted);
            }
            for (seq, _) in &entries {
                state.queue.mark_submitted(*seq, batch_id)?;
            }
            state.stats.batches_submitted += 1;
            state.stats.in_flight += 1;
            state.stats.in_flight_high_water = state
                .stats
                .in_flight_high_water
                .max(state.stats.in_flight);
        }
        debug!(
            "submitting batch {} with {} surfaces, seq range {:?}",
            batch_id,
            batch.len(),
            batch.seq_range()
        );

        let (done_tx, done_rx) = oneshot::channel();
        self.backend.execute(batch, done_tx);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let completion = done_rx.await;
            let mut state = shared.state.lock();
            state.stats.in_flight -= 1;
            if state.halted {
                // the halt already resolved this batch's surfaces
                drop(permit);
                return;
            }
            match completion {
                Ok(Ok(outputs)) => {
                    if outputs.len() == entries.len() {
                        for ((seq, surface_id), output) in entries.into_iter().zip(outputs) {
                            fulfill(&mut state, seq, surface_id, batch_id, Ok(output));
                        }
                    } else {
                        warn!(
                            "batch {} returned {} outputs for {} surfaces",
                            batch_id,
                            outputs.len(),
                            entries.len()
                        );
                        state.stats.batches_failed += 1;
                        for (seq, surface_id) in entries {
                            fulfill(
                                &mut state,
                                seq,
                                surface_id,
                                batch_id,
                                Err(OutcomeError::InferenceFailed(
                                    "backend output arity mismatch".to_string(),
                                )),
                            );
                        }
                    }
                }
                Ok(Err(BackendError::Batch(reason))) => {
                    warn!("batch {} failed: {}", batch_id, reason);
                    state.stats.batches_failed += 1;
                    for (seq, surface_id) in entries {
                        fulfill(
                            &mut state,
                            seq,
                            surface_id,
                            batch_id,
                            Err(OutcomeError::InferenceFailed(reason.clone())),
                        );
                    }
                }
                Ok(Err(BackendError::Device(reason))) => {
                    shared.halt(&mut state, &reason);
                    drop(permit);
                    return;
                }
                Err(_) => {
                    // backend dropped the completion without resolving
                    // it, which breaks the exactly-once contract
                    shared.halt(&mut state, "backend dropped completion channel");
                    drop(permit);
                    return;
                }
            }
            shared.emit_ready(&mut state);
            drop(permit);
        });
        Ok(())
    }

    /// Externally triggered device-fatal transition.
    pub fn halt(&self, reason: &str) {
        let mut state = self.shared.state.lock();
        self.shared.halt(&mut state, reason);
    }

    pub fn is_halted(&self) -> bool {
        self.shared.state.lock().halted
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn stats(&self) -> DispatcherStats {
        self.shared.state.lock().stats
    }
}

fn fulfill(
    state: &mut DispatcherState,
    seq: u64,
    surface_id: Uuid,
    batch_id: Uuid,
    result: Result<InferenceOutput, OutcomeError>,
) {
    let outcome = SurfaceOutcome {
        surface_id,
        seq,
        batch_id: Some(batch_id),
        result,
    };
    if let Err(e) = state.queue.fulfill(outcome) {
        error!("completion for seq {} rejected: {}", seq, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchAccumulator;
    use crate::output::Tensor;
    use crate::surface::{PixelFormat, Resolution};
    use std::time::Duration;

    struct IdentityBackend;

    impl InferenceBackend for IdentityBackend {
        fn execute(&self, batch: Batch, done: CompletionSender) {
            let outputs = batch
                .surfaces()
                .iter()
                .map(|s| {
                    InferenceOutput::Tensors(vec![Tensor {
                        layer_name: "identity".to_string(),
                        dims: vec![1],
                        data: vec![s.seq() as f32],
                    }])
                })
                .collect();
            let _ = done.send(Ok(outputs));
        }
    }

    struct FailingBackend(BackendError);

    impl InferenceBackend for FailingBackend {
        fn execute(&self, _batch: Batch, done: CompletionSender) {
            let _ = done.send(Err(self.0.clone()));
        }
    }

    fn pool() -> Arc<SurfacePool> {
        Arc::new(SurfacePool::new(
            16,
            PixelFormat::Nv12,
            Resolution {
                width: 640,
                height: 480,
            },
        ))
    }

    fn configuration() -> InferenceConfiguration {
        InferenceConfiguration::default()
    }

    fn sealed_batch(
        dispatcher: &InferenceDispatcher,
        pool: &SurfacePool,
        size: usize,
    ) -> Batch {
        let mut acc = BatchAccumulator::new(size, Duration::from_secs(10));
        for _ in 0..size - 1 {
            let (surface, signaller) = pool.acquire().unwrap();
            signaller.signal();
            dispatcher.track_surface(surface.seq(), surface.id()).unwrap();
            assert!(acc.push(surface).unwrap().is_none());
        }
        let (surface, signaller) = pool.acquire().unwrap();
        signaller.signal();
        dispatcher.track_surface(surface.seq(), surface.id()).unwrap();
        acc.push(surface).unwrap().expect("batch must seal")
    }

    #[tokio::test]
    async fn test_ordered_emission_and_pool_return() -> anyhow::Result<()> {
        let pool = pool();
        let (dispatcher, mut output) =
            InferenceDispatcher::new(Arc::new(IdentityBackend), pool.clone(), &configuration());
        let batch = sealed_batch(&dispatcher, &pool, 3);
        dispatcher.submit(batch).await?;

        for expected_seq in 0..3u64 {
            let outcome = output.recv().await.expect("outcome");
            assert_eq!(outcome.seq, expected_seq);
            assert!(outcome.result.is_ok());
        }
        assert_eq!(pool.outstanding(), 0);
        let stats = dispatcher.stats();
        assert_eq!(stats.outcomes_emitted, 3);
        assert_eq!(stats.batches_submitted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_failure_is_contained() -> anyhow::Result<()> {
        let pool = pool();
        let (dispatcher, mut output) = InferenceDispatcher::new(
            Arc::new(FailingBackend(BackendError::Batch("oom".to_string()))),
            pool.clone(),
            &configuration(),
        );
        let batch = sealed_batch(&dispatcher, &pool, 2);
        dispatcher.submit(batch).await?;

        for _ in 0..2 {
            let outcome = output.recv().await.expect("outcome");
            assert!(matches!(
                outcome.result,
                Err(OutcomeError::InferenceFailed(ref r)) if r == "oom"
            ));
        }
        assert!(!dispatcher.is_halted());
        assert_eq!(dispatcher.stats().batches_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_device_error_halts() -> anyhow::Result<()> {
        let pool = pool();
        let (dispatcher, mut output) = InferenceDispatcher::new(
            Arc::new(FailingBackend(BackendError::Device("device lost".to_string()))),
            pool.clone(),
            &configuration(),
        );
        let batch = sealed_batch(&dispatcher, &pool, 2);
        dispatcher.submit(batch).await?;

        for _ in 0..2 {
            let outcome = output.recv().await.expect("outcome");
            assert!(matches!(outcome.result, Err(OutcomeError::Cancelled)));
        }
        // output stream ends after the drain
        assert!(output.recv().await.is_none());
        assert!(dispatcher.is_halted());
        assert_eq!(pool.outstanding(), 0);

        let batch = {
            // tracking is rejected too, so build the batch directly
            let mut acc = BatchAccumulator::new(1, Duration::from_secs(10));
            let (surface, signaller) = pool.acquire()?;
            signaller.signal();
            acc.push(surface).unwrap().expect("sealed")
        };
        assert!(matches!(
            dispatcher.submit(batch).await,
            Err(DispatchError::Halted)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_surface_keeps_order() -> anyhow::Result<()> {
        let pool = pool();
        let (dispatcher, mut output) =
            InferenceDispatcher::new(Arc::new(IdentityBackend), pool.clone(), &configuration());

        // seq 0 faults at the sync stage, seqs 1 and 2 go through a batch
        let (faulted, signaller) = pool.acquire()?;
        signaller.signal_error("scanout fault");
        dispatcher.track_surface(faulted.seq(), faulted.id())?;

        let batch = {
            let mut acc = BatchAccumulator::new(2, Duration::from_secs(10));
            let mut sealed = None;
            for _ in 0..2 {
                let (surface, signaller) = pool.acquire()?;
                signaller.signal();
                dispatcher.track_surface(surface.seq(), surface.id())?;
                if let Some(batch) = acc.push(surface)? {
                    sealed = Some(batch);
                }
            }
            sealed.expect("sealed")
        };
        dispatcher.submit(batch).await?;
        dispatcher.fail_surface(faulted.seq(), faulted.id(), "scanout fault")?;

        let first = output.recv().await.expect("outcome");
        assert_eq!(first.seq, 0);
        assert!(matches!(
            first.result,
            Err(OutcomeError::HardwareFault(ref r)) if r == "scanout fault"
        ));
        for expected_seq in 1..3u64 {
            let outcome = output.recv().await.expect("outcome");
            assert_eq!(outcome.seq, expected_seq);
            assert!(outcome.result.is_ok());
        }
        Ok(())
    }
}
