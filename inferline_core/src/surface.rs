use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv12,
    I420,
    Rgba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Pending,
    Signaled,
    Error,
}

#[derive(Debug)]
pub enum FenceCompletion {
    Signaled,
    Error(String),
}

/// Hardware-completion token for one surface. The receiver half may be
/// taken exactly once; a fence with no receiver left has already been
/// handed to a waiter.
#[derive(Debug)]
pub struct Fence {
    waiter: Option<oneshot::Receiver<FenceCompletion>>,
    state: FenceState,
}

impl Fence {
    pub fn new_pair() -> (Self, FenceSignaller) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                waiter: Some(rx),
                state: FenceState::Pending,
            },
            FenceSignaller { tx },
        )
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    pub(crate) fn take_waiter(&mut self) -> Option<oneshot::Receiver<FenceCompletion>> {
        self.waiter.take()
    }

    pub(crate) fn mark(&mut self, state: FenceState) {
        self.state = state;
    }
}

/// The driver-side half of a fence. Consumed on signal, so a fence can
/// transition out of `Pending` at most once.
#[derive(Debug)]
pub struct FenceSignaller {
    tx: oneshot::Sender<FenceCompletion>,
}

impl FenceSignaller {
    pub fn signal(self) {
        let _ = self.tx.send(FenceCompletion::Signaled);
    }

    pub fn signal_error(self, reason: impl Into<String>) {
        let _ = self.tx.send(FenceCompletion::Error(reason.into()));
    }
}

/// An accelerator-resident frame buffer. Deliberately not `Clone`:
/// exactly one owner moves it through the pipeline.
#[derive(Debug)]
pub struct Surface {
    id: Uuid,
    format: PixelFormat,
    resolution: Resolution,
    seq: u64,
    fence: Fence,
    usable: bool,
}

impl Surface {
    pub fn new(format: PixelFormat, resolution: Resolution, seq: u64, fence: Fence) -> Self {
        Self {
            id: Uuid::now_v7(),
            format,
            resolution,
            seq,
            fence,
            usable: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn fence_state(&self) -> FenceState {
        self.fence.state()
    }

    pub(crate) fn fence_mut(&mut self) -> &mut Fence {
        &mut self.fence
    }

    pub(crate) fn mark_unusable(&mut self) {
        self.usable = false;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("surface pool exhausted, {0} surfaces outstanding")]
    Exhausted(usize),
    #[error("surface {0} does not belong to the pool or was already released")]
    UnknownSurface(Uuid),
}

struct PoolInner {
    outstanding: HashSet<Uuid>,
    next_seq: u64,
}

/// Bounded pool of surface slots. Acquisition stamps the next stream
/// sequence number; release is accounted per surface id and must happen
/// exactly once.
pub struct SurfacePool {
    capacity: usize,
    format: PixelFormat,
    resolution: Resolution,
    inner: Mutex<PoolInner>,
}

impl SurfacePool {
    pub fn new(capacity: usize, format: PixelFormat, resolution: Resolution) -> Self {
        Self {
            capacity,
            format,
            resolution,
            inner: Mutex::new(PoolInner {
                outstanding: HashSet::with_capacity(capacity),
                next_seq: 0,
            }),
        }
    }

    pub fn acquire(&self) -> Result<(Surface, FenceSignaller), PoolError> {
        let mut inner = self.inner.lock();
        if inner.outstanding.len() >= self.capacity {
            return Err(PoolError::Exhausted(inner.outstanding.len()));
        }
        let (fence, signaller) = Fence::new_pair();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let surface = Surface::new(self.format, self.resolution, seq, fence);
        inner.outstanding.insert(surface.id());
        Ok((surface, signaller))
    }

    pub fn release(&self, id: Uuid) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        if !inner.outstanding.remove(&id) {
            return Err(PoolError::UnknownSurface(id));
        }
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
