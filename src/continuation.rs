//! Continuations: units of work gated on the outcome of earlier ones.
//!
//! Every combinator submits its successor immediately with a dependency on
//! the predecessor, so the successor never starts before the predecessor is
//! finished or cancelled. Value-producing forms return the successor for
//! further chaining; side-effect forms return nothing.
//!
//! Successors only hold their predecessor weakly. The scheduler keeps each
//! predecessor alive until its successor has started, so the successor's first
//! run always finds it even when every other handle is gone. A successor run
//! outside that window, for example a later retry, that finds the predecessor
//! gone does nothing and logs at trace.
use crate::operation::{BlockOperation, Operation};
use crate::promise::{Promise, Routine};
use crate::resolution::Resolution;
use crate::scheduler::{Lane, Scheduler};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

impl<T: Send + 'static> Promise<T> {
    /// Runs the promise built by `build` after this one settles, whatever the
    /// outcome.
    pub fn then<U, F>(&self, scheduler: &Scheduler, build: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&Promise<T>) -> Promise<U>,
    {
        self.then_in(scheduler, Lane::Pool, build)
    }

    pub fn then_on_main<U, F>(&self, scheduler: &Scheduler, build: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&Promise<T>) -> Promise<U>,
    {
        self.then_in(scheduler, Lane::Main, build)
    }

    fn then_in<U, F>(&self, scheduler: &Scheduler, lane: Lane, build: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&Promise<T>) -> Promise<U>,
    {
        let next = build(self);
        next.submit(scheduler, vec![self.operation()], lane);
        next
    }

    /// Runs `block` with this promise once it settles.
    pub fn then_do<F>(&self, scheduler: &Scheduler, block: F)
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        self.then_do_in(scheduler, Lane::Pool, block, false);
    }

    pub fn then_do_on_main<F>(&self, scheduler: &Scheduler, block: F)
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        self.then_do_in(scheduler, Lane::Main, block, false);
    }

    fn then_do_in<F>(&self, scheduler: &Scheduler, lane: Lane, block: F, only_on_result: bool)
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        let predecessor = self.downgrade();
        let operation = BlockOperation::new(move || {
            let Some(previous) = predecessor.upgrade() else {
                trace!("predecessor dropped before its continuation ran");
                return;
            };
            if only_on_result && !previous.with_resolution(Resolution::is_result) {
                return;
            }
            block(&previous);
        });
        scheduler.submit_with(operation, vec![self.operation()], lane);
    }

    /// Like [`then`](Promise::then), but the built promise's routine only runs
    /// if this promise ended with a result.
    ///
    /// Otherwise the successor takes over this promise's outcome: an error is
    /// carried over unchanged, a cancellation cancels it. `build` itself is
    /// always called, right away. The promise it returns is replaced by the
    /// one returned here, which keeps its retry settings.
    pub fn on_success<U, F>(&self, scheduler: &Scheduler, build: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&Promise<T>) -> Promise<U>,
    {
        self.on_success_in(scheduler, Lane::Pool, build)
    }

    pub fn on_success_on_main<U, F>(&self, scheduler: &Scheduler, build: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&Promise<T>) -> Promise<U>,
    {
        self.on_success_in(scheduler, Lane::Main, build)
    }

    fn on_success_in<U, F>(&self, scheduler: &Scheduler, lane: Lane, build: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(&Promise<T>) -> Promise<U>,
    {
        let predecessor = self.downgrade();
        let next = build(self).rebuild(move |routine: Routine<U>| -> Routine<U> {
            // Retries rerun this wrapper; the predecessor is only consulted once.
            let cleared = AtomicBool::new(false);
            Arc::new(move |promise: &Promise<U>| {
                if !cleared.load(Ordering::Acquire) {
                    let Some(previous) = predecessor.upgrade() else {
                        trace!("predecessor dropped before its continuation ran");
                        return;
                    };
                    if let Some(inherited) = previous.with_resolution(|resolution| resolution.passthrough::<U>()) {
                        promise.set_retry_count(0);
                        promise.set_resolution(inherited);
                        return;
                    }
                    cleared.store(true, Ordering::Release);
                }
                routine(promise)
            })
        });
        next.submit(scheduler, vec![self.operation()], lane);
        next
    }

    /// Runs `block` only if this promise ends with a result.
    pub fn on_success_do<F>(&self, scheduler: &Scheduler, block: F)
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        self.then_do_in(scheduler, Lane::Pool, block, true);
    }

    pub fn on_success_do_on_main<F>(&self, scheduler: &Scheduler, block: F)
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        self.then_do_in(scheduler, Lane::Main, block, true);
    }

    /// Hands the result, if any, to `inspect`, and returns a promise that
    /// settles exactly like this one.
    pub fn with_result<F>(&self, scheduler: &Scheduler, inspect: F) -> Promise<T>
    where
        T: Clone,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.mirror(scheduler, move |resolution| {
            if let Resolution::Result(value) = resolution {
                inspect(value);
            }
        })
    }

    /// Hands the error, if any, to `inspect`, and returns a promise that
    /// settles exactly like this one.
    pub fn with_error<F>(&self, scheduler: &Scheduler, inspect: F) -> Promise<T>
    where
        T: Clone,
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.mirror(scheduler, move |resolution| {
            if let Resolution::Error(err) = resolution {
                inspect(err);
            }
        })
    }

    fn mirror<F>(&self, scheduler: &Scheduler, inspect: F) -> Promise<T>
    where
        T: Clone,
        F: Fn(&Resolution<T>) + Send + Sync + 'static,
    {
        let predecessor = self.downgrade();
        let next = Promise::new(move |promise: &Promise<T>| {
            let Some(previous) = predecessor.upgrade() else {
                trace!("predecessor dropped before its continuation ran");
                return;
            };
            let resolution = previous.resolution();
            inspect(&resolution);
            promise.set_resolution(resolution);
        });
        next.submit(scheduler, vec![self.operation()], Lane::Pool);
        next
    }
}

/// Runs the promise built by `build` once every predecessor has settled,
/// whatever their outcomes.
pub fn when_all<U, F>(scheduler: &Scheduler, predecessors: &[Arc<dyn Operation>], build: F) -> Promise<U>
where
    U: Send + 'static,
    F: FnOnce() -> Promise<U>,
{
    let next = build();
    next.submit(scheduler, predecessors.to_vec(), Lane::Pool);
    next
}

pub fn when_all_on_main<U, F>(scheduler: &Scheduler, predecessors: &[Arc<dyn Operation>], build: F) -> Promise<U>
where
    U: Send + 'static,
    F: FnOnce() -> Promise<U>,
{
    let next = build();
    next.submit(scheduler, predecessors.to_vec(), Lane::Main);
    next
}

/// Runs `block` once every predecessor has settled.
pub fn when_all_do<F>(scheduler: &Scheduler, predecessors: &[Arc<dyn Operation>], block: F)
where
    F: FnOnce() + Send + 'static,
{
    scheduler.submit_after(BlockOperation::new(block), predecessors);
}

pub fn when_all_do_on_main<F>(scheduler: &Scheduler, predecessors: &[Arc<dyn Operation>], block: F)
where
    F: FnOnce() + Send + 'static,
{
    scheduler.submit_on_main_after(BlockOperation::new(block), predecessors);
}
