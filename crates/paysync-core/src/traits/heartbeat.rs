//! Best-effort progress reporting for long loops.

/// Receives progress after each committed batch. Must not fail or block.
pub trait Heartbeat: Send + Sync {
    fn record(&self, step: &str, progress: u64);
}

/// Discards every beat.
pub struct NoopHeartbeat;

impl Heartbeat for NoopHeartbeat {
    fn record(&self, _step: &str, _progress: u64) {}
}

impl<F> Heartbeat for F
where
    F: Fn(&str, u64) + Send + Sync,
{
    fn record(&self, step: &str, progress: u64) {
        self(step, progress)
    }
}
