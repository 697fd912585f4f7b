//! Idle timeout for the local backend.
//!
//! Activity (`touch`) pushes the deadline forward. A single worker task sleeps
//! until the deadline and then runs the idle action, unless a request is still
//! in flight, in which case it waits another full period.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type IdleAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct IdleState {
    last_activity: Mutex<Instant>,
    delay: Mutex<Option<Duration>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    on_idle: IdleAction,
}

pub struct IdleTimer {
    state: Arc<IdleState>,
}

/// Marks one request as in flight for as long as it lives.
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IdleTimer {
    /// `in_flight` is shared with the idle action, which must re-check it under
    /// its own lock before acting.
    pub fn new(delay: Option<Duration>, in_flight: Arc<AtomicUsize>, on_idle: IdleAction) -> Self {
        Self {
            state: Arc::new(IdleState {
                last_activity: Mutex::new(Instant::now()),
                delay: Mutex::new(delay),
                worker: Mutex::new(None),
                in_flight,
                on_idle,
            }),
        }
    }

    pub fn enter(&self) -> InFlightGuard {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: self.state.in_flight.clone(),
        }
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock() = delay;
    }

    pub fn delay(&self) -> Option<Duration> {
        *self.state.delay.lock()
    }

    /// Record activity and make sure a worker is watching the deadline.
    /// Must be called from within a tokio runtime.
    pub fn touch(&self) {
        *self.state.last_activity.lock() = Instant::now();
        if self.state.delay.lock().is_none() {
            return;
        }

        let mut worker = self.state.worker.lock();
        let running = worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            *worker = Some(tokio::spawn(watch(self.state.clone())));
        }
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.state.worker.lock().take() {
            handle.abort();
        }
    }
}

async fn watch(state: Arc<IdleState>) {
    loop {
        let Some(delay) = *state.delay.lock() else {
            return;
        };
        let deadline = *state.last_activity.lock() + delay;
        if Instant::now() < deadline {
            tokio::time::sleep_until(deadline).await;
            continue;
        }
        if state.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(delay).await;
            continue;
        }
        tracing::debug!(?delay, "idle timeout reached");
        (state.on_idle)().await;
        return;
    }
}
