//! Cancellation and progress reporting for a running promise.
//!
//! A [`Progress`] is shared between the routine doing the work and whoever
//! waits on it. The routine reports unit counts, an application-defined state
//! and a description, and registers cancellation handlers to abort its work.
//! Handlers run on the calling thread, or on a [`SerialQueue`] when one is
//! given.
use crate::scheduler::SerialQueue;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::trace;

type ProgressHandler = Arc<dyn Fn(&Progress) + Send + Sync>;
type CancellationHandler = Box<dyn FnOnce(&Progress) + Send>;

#[derive(Default)]
struct Inner {
    completed: u64,
    total: u64,
    state: u64,
    description: Option<String>,
    cancelled: bool,
    on_progress: Vec<(ProgressHandler, Option<SerialQueue>)>,
    on_cancel: Vec<(CancellationHandler, Option<SerialQueue>)>,
}

/// A cancellable progress token. Clones share the same token.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Progress")
            .field("completed", &inner.completed)
            .field("total", &inner.total)
            .field("state", &inner.state)
            .field("cancelled", &inner.cancelled)
            .finish()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    /// Marks the token cancelled and runs every cancellation handler once.
    pub fn cancel(&self) {
        let handlers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            std::mem::take(&mut inner.on_cancel)
        };
        trace!(handlers = handlers.len(), "progress cancelled");
        for (handler, queue) in handlers {
            match queue {
                Some(queue) => {
                    let progress = self.clone();
                    queue.dispatch(move || handler(&progress));
                }
                None => handler(self),
            }
        }
    }

    /// Runs `handler` when the token is cancelled, or right away if it
    /// already is.
    pub fn on_cancel<F>(&self, handler: F)
    where
        F: FnOnce(&Progress) + Send + 'static,
    {
        self.add_cancellation_handler(Box::new(handler), None);
    }

    /// Like [`on_cancel`](Self::on_cancel), running `handler` on `queue`.
    pub fn on_cancel_on<F>(&self, queue: &SerialQueue, handler: F)
    where
        F: FnOnce(&Progress) + Send + 'static,
    {
        self.add_cancellation_handler(Box::new(handler), Some(queue.clone()));
    }

    fn add_cancellation_handler(&self, handler: CancellationHandler, queue: Option<SerialQueue>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.cancelled {
                inner.on_cancel.push((handler, queue));
                return;
            }
        }
        match queue {
            Some(queue) => {
                let progress = self.clone();
                queue.dispatch(move || handler(&progress));
            }
            None => handler(self),
        }
    }

    /// Called after every update.
    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().on_progress.push((Arc::new(handler), None));
    }

    pub fn on_progress_on<F>(&self, queue: &SerialQueue, handler: F)
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .on_progress
            .push((Arc::new(handler), Some(queue.clone())));
    }

    /// `(completed, total)` units of work.
    pub fn completed(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.completed, inner.total)
    }

    /// Completed share of the work, `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        let (completed, total) = self.completed();
        (total > 0).then(|| completed as f64 / total as f64)
    }

    pub fn state(&self) -> u64 {
        self.inner.lock().unwrap().state
    }

    pub fn description(&self) -> Option<String> {
        self.inner.lock().unwrap().description.clone()
    }

    pub fn update_completed(&self, completed: u64, total: u64) {
        self.update(|inner| {
            inner.completed = completed;
            inner.total = total;
        });
    }

    /// Sets an application-defined state code.
    pub fn update_state(&self, state: u64) {
        self.update(|inner| inner.state = state);
    }

    pub fn update_description<D: Into<String>>(&self, description: D) {
        let description = description.into();
        self.update(|inner| inner.description = Some(description));
    }

    /// Updates after cancellation are dropped.
    fn update<F: FnOnce(&mut Inner)>(&self, apply: F) {
        let handlers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                trace!("progress update after cancellation ignored");
                return;
            }
            apply(&mut *inner);
            inner.on_progress.clone()
        };
        for (handler, queue) in handlers {
            match queue {
                Some(queue) => {
                    let progress = self.clone();
                    queue.dispatch(move || handler(&progress));
                }
                None => handler(self),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_updates_reach_handlers() {
        let progress = Progress::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        progress.on_progress(move |progress| sink.lock().unwrap().push(progress.completed()));
        assert_eq!(progress.fraction(), None);
        progress.update_completed(1, 4);
        progress.update_completed(3, 4);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 4), (3, 4)]);
        assert_eq!(progress.fraction(), Some(0.75));
    }

    #[test]
    fn test_state_and_description() {
        let progress = Progress::new();
        progress.update_state(2);
        progress.update_description("downloading");
        assert_eq!(progress.state(), 2);
        assert_eq!(progress.description().as_deref(), Some("downloading"));
    }

    #[test]
    fn test_cancellation_handlers_run_once() {
        let progress = Progress::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        progress.on_cancel(move |progress| {
            assert!(progress.is_cancelled());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        progress.cancel();
        progress.cancel();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_cancellation_handler_runs_immediately() {
        let progress = Progress::new();
        progress.cancel();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        progress.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_updates_after_cancel_are_ignored() {
        let progress = Progress::new();
        progress.update_completed(1, 2);
        progress.cancel();
        progress.update_completed(2, 2);
        assert_eq!(progress.completed(), (1, 2));
    }

    #[test]
    fn test_handlers_on_queue() {
        let queue = SerialQueue::spawn("progress").unwrap();
        let progress = Progress::new();
        let (tx, rx) = channel();
        let on_queue = queue.clone();
        let progress_tx = tx.clone();
        progress.on_progress_on(&queue, move |_| progress_tx.send(on_queue.is_current()).unwrap());
        let on_queue = queue.clone();
        progress.on_cancel_on(&queue, move |_| tx.send(on_queue.is_current()).unwrap());

        progress.update_state(1);
        progress.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
