//! Three-state one-time initialization gate.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;

/// Progress of a registry's one-time initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
}

impl InitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => InitState::Initializing,
            2 => InitState::Ready,
            _ => InitState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            InitState::Uninitialized => 0,
            InitState::Initializing => 1,
            InitState::Ready => 2,
        }
    }
}

/// Runs an initialization future at most once to success.
///
/// Callers arriving while initialization is in flight wait on the lock and
/// then observe `Ready` instead of running the work again. A failed run
/// returns the gate to `Uninitialized` so the next caller retries.
#[derive(Debug)]
pub struct InitGate {
    state: AtomicU8,
    lock: Mutex<()>,
}

impl InitGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(InitState::Uninitialized.as_u8()),
            lock: Mutex::new(()),
        }
    }

    /// Current state of the gate.
    pub fn state(&self) -> InitState {
        InitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == InitState::Ready
    }

    /// Run `init` unless the gate is already `Ready`.
    pub async fn run<F, Fut, E>(&self, init: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self.is_ready() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        self.set(InitState::Initializing);
        match init().await {
            Ok(()) => {
                self.set(InitState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set(InitState::Uninitialized);
                Err(e)
            }
        }
    }

    fn set(&self, state: InitState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_gate_starts_uninitialized() {
        let gate = InitGate::new();
        assert_eq!(gate.state(), InitState::Uninitialized);
        assert!(!gate.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_initialize_once() {
        let gate = Arc::new(InitGate::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                gate.run(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<(), ()>(())
                })
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state(), InitState::Ready);
    }

    #[tokio::test]
    async fn test_failed_run_resets_gate() {
        let gate = InitGate::new();

        let result = gate.run(|| async { Err::<(), _>("unreachable") }).await;
        assert_eq!(result, Err("unreachable"));
        assert_eq!(gate.state(), InitState::Uninitialized);

        gate.run(|| async { Ok::<(), &str>(()) }).await.unwrap();
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn test_ready_gate_skips_init() {
        let gate = InitGate::new();
        gate.run(|| async { Ok::<(), ()>(()) }).await.unwrap();

        let reran = AtomicUsize::new(0);
        let result = gate
            .run(|| async {
                reran.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ()>(())
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(reran.load(Ordering::SeqCst), 0);
    }
}
