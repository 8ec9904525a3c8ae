pub mod batch;
pub mod configuration;
pub mod dispatch;
pub mod output;
pub mod reorder;
pub mod surface;
pub mod sync;

pub use batch::{Batch, BatchAccumulator, BatchError, SealReason};
pub use configuration::{DeviceSelector, InferenceConfiguration};
pub use dispatch::{
    BackendError, CompletionSender, DispatchError, InferenceBackend, InferenceDispatcher,
};
pub use output::{InferenceOutput, OutcomeError, SurfaceOutcome};
pub use surface::{Fence, FenceSignaller, PixelFormat, Resolution, Surface, SurfacePool};
pub use sync::{ReadyToken, SyncError, SyncManager};

pub mod test {
    //! Helpers shared by unit and integration tests.

    use std::sync::Arc;

    use crate::surface::{PixelFormat, Resolution, Surface, SurfacePool};

    pub fn gen_pool(capacity: usize) -> Arc<SurfacePool> {
        Arc::new(SurfacePool::new(
            capacity,
            PixelFormat::Nv12,
            Resolution {
                width: 640,
                height: 480,
            },
        ))
    }

    /// Acquires a surface whose fence is already signaled.
    pub fn gen_ready_surface(pool: &SurfacePool) -> Surface {
        let (surface, signaller) = pool.acquire().expect("pool exhausted");
        signaller.signal();
        surface
    }
}
