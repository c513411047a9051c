use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

/// Cooperative shutdown flag shared by every long-running thread.
///
/// Clearing the flag does not interrupt anything by itself; each thread's
/// blocking points (the client queue, the pending condvar, socket accept
/// ticks) are woken separately by the caller initiating shutdown.
#[derive(Clone)]
pub struct ShutdownFlag {
    running: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}
