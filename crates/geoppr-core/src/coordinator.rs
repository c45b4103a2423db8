//! Single-flight coordination of the full dataset load.
//!
//! At most one caller holds the load at a time. Everyone else gets a
//! [`LoadPending`] that resolves when the loader finishes, successfully or
//! not, and then re-reads the cache. The coordinator never carries the
//! payload itself.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use tracing::debug;

/// The current loader: who it is and how to tell waiters it finished.
struct LoadTicket {
    generation: u64,
    source: String,
    started_at: Instant,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    current: Option<LoadTicket>,
    next_generation: u64,
}

#[derive(Default)]
pub struct LoadCoordinator {
    state: Mutex<State>,
}

pub enum Acquire {
    /// The caller is the loader until the guard is released or dropped.
    Granted(LoadGuard),
    /// Another caller is loading.
    Pending(LoadPending),
}

impl LoadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Become the loader, or get a handle on the load already in flight.
    ///
    /// The check and the flag flip happen under one lock with no await in
    /// between, so two callers can never both be granted.
    pub fn try_acquire(self: &Arc<Self>, source: &str) -> Acquire {
        let mut state = self.lock();

        if let Some(ticket) = state.current.as_ref() {
            debug!(source, loader = %ticket.source, "Load in flight, waiting");
            return Acquire::Pending(LoadPending {
                done: ticket.done.subscribe(),
                source: ticket.source.clone(),
            });
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let (done, _) = watch::channel(false);
        state.current = Some(LoadTicket {
            generation,
            source: source.to_string(),
            started_at: Instant::now(),
            done,
        });
        debug!(source, generation, "Load lock acquired");

        Acquire::Granted(LoadGuard {
            coordinator: Arc::clone(self),
            generation,
            source: source.to_string(),
            released: false,
        })
    }

    /// Release whatever load is in flight. No-op when idle.
    pub fn release(&self) {
        let ticket = self.lock().current.take();
        if let Some(ticket) = ticket {
            Self::finish(ticket);
        }
    }

    fn release_generation(&self, generation: u64) {
        let ticket = {
            let mut state = self.lock();
            match state.current.as_ref() {
                Some(t) if t.generation == generation => state.current.take(),
                _ => None,
            }
        };
        if let Some(ticket) = ticket {
            Self::finish(ticket);
        }
    }

    fn finish(ticket: LoadTicket) {
        ticket.done.send_replace(true);
        debug!(
            source = %ticket.source,
            elapsed_ms = ticket.started_at.elapsed().as_millis() as u64,
            "Load lock released"
        );
    }

    pub fn is_loading(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Source tag of the current loader, if any.
    pub fn loading_source(&self) -> Option<String> {
        self.lock().current.as_ref().map(|t| t.source.clone())
    }
}

/// Scoped ownership of the load. Dropping it releases the coordinator,
/// including on error returns and panics.
#[must_use = "dropping the guard releases the load immediately"]
pub struct LoadGuard {
    coordinator: Arc<LoadCoordinator>,
    generation: u64,
    source: String,
    released: bool,
}

impl LoadGuard {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.coordinator.release_generation(self.generation);
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Handle on a load owned by someone else.
pub struct LoadPending {
    done: watch::Receiver<bool>,
    source: String,
}

impl LoadPending {
    /// Source tag of the loader being waited on.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Resolve once the loader is done. Never fails: a loader that
    /// vanished without releasing counts as done.
    pub async fn wait(mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}
