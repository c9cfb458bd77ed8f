use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("a participant left the barrier: {0}")]
    Broken(String),
}

/// Rank synchronization point. The driver waits on this after every
/// validation pass so all ranks agree before anything checkpoints; the
/// actual collective is supplied by the distributed backend.
pub trait Barrier: Send + Sync + std::fmt::Debug {
    fn wait(&self) -> Result<(), BarrierError>;
}

/// Single-process barrier. Waiting is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBarrier;

impl Barrier for NoopBarrier {
    fn wait(&self) -> Result<(), BarrierError> {
        Ok(())
    }
}
