use hashbrown::HashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::surface::{FenceCompletion, FenceState, Surface};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("hardware fault on surface {}: {}", .surface.id(), .reason)]
    HardwareFault { surface: Box<Surface>, reason: String },
    #[error("fence for surface {0} was already consumed or never submitted")]
    InvalidFenceState(Uuid),
}

/// Handle for one submitted wait. Cheap to copy; waiting with a stale
/// token fails fast with `InvalidFenceState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadyToken {
    surface_id: Uuid,
}

impl ReadyToken {
    pub fn surface_id(&self) -> Uuid {
        self.surface_id
    }
}

struct PendingWait {
    surface: Surface,
    waiter: oneshot::Receiver<FenceCompletion>,
}

/// Waits for hardware operations on submitted surfaces to complete.
/// Each wait suspends only the calling task; any number of surfaces may
/// be waited concurrently and independently.
#[derive(Default)]
pub struct SyncManager {
    pending: Mutex<HashMap<Uuid, PendingWait>>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of the surface's fence until `wait` resolves.
    pub fn submit(&self, mut surface: Surface) -> Result<ReadyToken, SyncError> {
        let surface_id = surface.id();
        let waiter = surface
            .fence_mut()
            .take_waiter()
            .ok_or(SyncError::InvalidFenceState(surface_id))?;
        self.pending
            .lock()
            .insert(surface_id, PendingWait { surface, waiter });
        Ok(ReadyToken { surface_id })
    }

    /// Suspends until the fence transitions out of `Pending`. The token
    /// is consumed: a second wait on the same fence is a programming
    /// error and fails fast.
    pub async fn wait(&self, token: ReadyToken) -> Result<Surface, SyncError> {
        let PendingWait {
            mut surface,
            waiter,
        } = self
            .pending
            .lock()
            .remove(&token.surface_id)
            .ok_or(SyncError::InvalidFenceState(token.surface_id))?;

        match waiter.await {
            Ok(FenceCompletion::Signaled) => {
                surface.fence_mut().mark(FenceState::Signaled);
                debug!("surface {} seq {} ready", surface.id(), surface.seq());
                Ok(surface)
            }
            Ok(FenceCompletion::Error(reason)) => {
                warn!(
                    "surface {} seq {} faulted: {}",
                    surface.id(),
                    surface.seq(),
                    reason
                );
                surface.fence_mut().mark(FenceState::Error);
                surface.mark_unusable();
                Err(SyncError::HardwareFault {
                    surface: Box::new(surface),
                    reason,
                })
            }
            Err(_) => {
                // the driver dropped the signaller without completing
                surface.fence_mut().mark(FenceState::Error);
                surface.mark_unusable();
                Err(SyncError::HardwareFault {
                    surface: Box::new(surface),
                    reason: "fence signaller dropped".to_string(),
                })
            }
        }
    }

    pub fn pending_waits(&self) -> usize {
        self.pending.lock().len()
    }
}
