use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::surface::Surface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    Full,
    Expired,
    Flushed,
}

/// Immutable, sealed group of surfaces with strictly increasing
/// sequence numbers.
#[derive(Debug)]
pub struct Batch {
    id: Uuid,
    surfaces: Vec<Surface>,
    reason: SealReason,
}

impl Batch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn reason(&self) -> SealReason {
        self.reason
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn seq_range(&self) -> Option<(u64, u64)> {
        match (self.surfaces.first(), self.surfaces.last()) {
            (Some(first), Some(last)) => Some((first.seq(), last.seq())),
            _ => None,
        }
    }

    pub fn into_surfaces(self) -> Vec<Surface> {
        self.surfaces
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("surface seq {seq} arrived behind high-water mark {high_water}, upstream reordering is fatal")]
    OutOfOrderSurface { seq: u64, high_water: u64 },
    #[error("surface seq {0} is unusable and cannot be batched")]
    UnusableSurface(u64),
}

/// Groups ready surfaces into inference-sized batches. A batch seals
/// when it reaches `max_batch_size` or when `max_batch_wait` elapses
/// from the arrival of its oldest member, whichever happens first.
pub struct BatchAccumulator {
    max_batch_size: usize,
    max_batch_wait: Duration,
    pending: Vec<Surface>,
    oldest_arrival: Option<Instant>,
    high_water: Option<u64>,
}

impl BatchAccumulator {
    pub fn new(max_batch_size: usize, max_batch_wait: Duration) -> Self {
        Self {
            max_batch_size,
            max_batch_wait,
            pending: Vec::with_capacity(max_batch_size),
            oldest_arrival: None,
            high_water: None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Accepts a surface that passed the sync wait. Returns a sealed
    /// batch when the size bound is reached.
    pub fn push(&mut self, surface: Surface) -> Result<Option<Batch>, BatchError> {
        if !surface.is_usable() {
            return Err(BatchError::UnusableSurface(surface.seq()));
        }
        if let Some(high_water) = self.high_water {
            if surface.seq() <= high_water {
                return Err(BatchError::OutOfOrderSurface {
                    seq: surface.seq(),
                    high_water,
                });
            }
        }
        self.high_water = Some(surface.seq());
        if self.pending.is_empty() {
            self.oldest_arrival = Some(Instant::now());
        }
        self.pending.push(surface);
        if self.pending.len() >= self.max_batch_size {
            return Ok(Some(self.seal(SealReason::Full)));
        }
        Ok(None)
    }

    /// Instant at which the currently pending batch must seal, if any
    /// surface is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest_arrival.map(|t| t + self.max_batch_wait)
    }

    /// Seals the pending batch if its wait bound elapsed at `now`.
    pub fn seal_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => Some(self.seal(SealReason::Expired)),
            _ => None,
        }
    }

    /// Seals whatever is pending, used at end of stream.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.seal(SealReason::Flushed))
    }

    fn seal(&mut self, reason: SealReason) -> Batch {
        self.oldest_arrival = None;
        let batch = Batch {
            id: Uuid::now_v7(),
            surfaces: std::mem::take(&mut self.pending),
            reason,
        };
        self.pending = Vec::with_capacity(self.max_batch_size);
        debug!(
            "sealed batch {} ({:?}), seq range {:?}",
            batch.id(),
            batch.reason(),
            batch.seq_range()
        );
        batch
    }

    /// Drives the accumulator over channels: ready surfaces in, sealed
    /// batches out. Ends when the input closes (flushing the remainder)
    /// or the batch consumer goes away.
    pub async fn run(
        mut self,
        mut surfaces: mpsc::UnboundedReceiver<Surface>,
        batches: mpsc::UnboundedSender<Batch>,
    ) -> Result<(), BatchError> {
        loop {
            let deadline = self.deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + self.max_batch_wait);
            tokio::select! {
                incoming = surfaces.recv() => match incoming {
                    Some(surface) => {
                        if let Some(batch) = self.push(surface)? {
                            if batches.send(batch).is_err() {
                                break;
                            }
                        }
                    }
                    None => {
                        if let Some(batch) = self.flush() {
                            let _ = batches.send(batch);
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)),
                    if deadline.is_some() =>
                {
                    if let Some(batch) = self.seal_expired(Instant::now()) {
                        if batches.send(batch).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
