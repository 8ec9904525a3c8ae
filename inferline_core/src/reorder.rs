use std::collections::BTreeMap;

use uuid::Uuid;

use crate::output::{OutcomeError, SurfaceOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ReorderError {
    #[error("seq {seq} tracked behind high-water mark {high_water}")]
    OutOfOrderTrack { seq: u64, high_water: u64 },
    #[error("seq {0} was never tracked")]
    UnknownSequence(u64),
    #[error("seq {0} already has a terminal outcome")]
    DuplicateOutcome(u64),
    #[error("seq {0} was already tracked")]
    DuplicateSequence(u64),
}

#[derive(Debug)]
enum Slot {
    Outstanding {
        surface_id: Uuid,
        batch_id: Option<Uuid>,
    },
    Ready(SurfaceOutcome),
}

/// Pending-result structure reconciling out-of-order completions into
/// in-order delivery. Sequence numbers are tracked in arrival order;
/// outcomes fill in as completions land; `drain` releases only the
/// contiguous ready prefix at the emission cursor.
#[derive(Debug, Default)]
pub struct ReorderQueue {
    slots: BTreeMap<u64, Slot>,
    cursor: Option<u64>,
    high_water: Option<u64>,
}

impl ReorderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registers a surface in stream arrival order. The first tracked
    /// seq anchors the emission cursor.
    pub fn track(&mut self, seq: u64, surface_id: Uuid) -> Result<(), ReorderError> {
        if let Some(high_water) = self.high_water {
            if seq <= high_water {
                return if self.slots.contains_key(&seq) {
                    Err(ReorderError::DuplicateSequence(seq))
                } else {
                    Err(ReorderError::OutOfOrderTrack { seq, high_water })
                };
            }
        }
        self.high_water = Some(seq);
        if self.cursor.is_none() {
            self.cursor = Some(seq);
        }
        self.slots.insert(
            seq,
            Slot::Outstanding {
                surface_id,
                batch_id: None,
            },
        );
        Ok(())
    }

    /// Associates a tracked seq with the batch it was submitted in.
    pub fn mark_submitted(&mut self, seq: u64, batch: Uuid) -> Result<(), ReorderError> {
        match self.slots.get_mut(&seq) {
            Some(Slot::Outstanding { batch_id, .. }) => {
                *batch_id = Some(batch);
                Ok(())
            }
            Some(Slot::Ready(_)) => Err(ReorderError::DuplicateOutcome(seq)),
            None => Err(ReorderError::UnknownSequence(seq)),
        }
    }

    /// Records the terminal outcome for a tracked seq.
    pub fn fulfill(&mut self, outcome: SurfaceOutcome) -> Result<(), ReorderError> {
        match self.slots.get_mut(&outcome.seq) {
            Some(slot) => match slot {
                Slot::Outstanding { .. } => {
                    *slot = Slot::Ready(outcome);
                    Ok(())
                }
                Slot::Ready(_) => Err(ReorderError::DuplicateOutcome(outcome.seq)),
            },
            None => Err(ReorderError::UnknownSequence(outcome.seq)),
        }
    }

    /// Pops the contiguous ready prefix, advancing the cursor.
    pub fn drain(&mut self) -> Vec<SurfaceOutcome> {
        let mut ready = Vec::new();
        while let Some(cursor) = self.cursor {
            match self.slots.get(&cursor) {
                Some(Slot::Ready(_)) => {
                    if let Some(Slot::Ready(outcome)) = self.slots.remove(&cursor) {
                        ready.push(outcome);
                    }
                    self.cursor = Some(cursor + 1);
                }
                _ => break,
            }
        }
        ready
    }

    /// Converts every unemitted slot, ready or not, into a `Cancelled`
    /// outcome in seq order. Used when the dispatcher halts.
    pub fn cancel_all(&mut self) -> Vec<SurfaceOutcome> {
        let slots = std::mem::take(&mut self.slots);
        self.cursor = None;
        slots
            .into_iter()
            .map(|(seq, slot)| match slot {
                Slot::Outstanding {
                    surface_id,
                    batch_id,
                } => SurfaceOutcome {
                    surface_id,
                    seq,
                    batch_id,
                    result: Err(OutcomeError::Cancelled),
                },
                Slot::Ready(outcome) => SurfaceOutcome {
                    result: Err(OutcomeError::Cancelled),
                    ..outcome
                },
            })
            .collect()
    }
}
