//! Promises: units of work that settle to a [`Resolution`].
//!
//! A promise runs its routine when it starts. The routine, now or later and
//! from any thread, sets the promise's resolution, and that assignment is what
//! drives the promise forward:
//!
//! - a result, or an error with no retries left, finishes the promise;
//! - an error with retries left spends one and runs the routine again, either
//!   right away or, when a retry delay is set, from a one-shot timer on the
//!   scheduler's main queue;
//! - `Cancelled` cancels the promise;
//! - `Unresolved` is stored and nothing else happens.
//!
//! A routine that never sets a terminal resolution leaves its promise
//! executing forever.
//!
//! Attempts of one promise never overlap, and once `cancel` has returned no
//! further attempt starts.
use crate::operation::{ExecutionState, Observer, Operation, StateMachine};
use crate::progress::Progress;
use crate::resolution::Resolution;
use crate::scheduler::{Lane, Scheduler, SerialQueue, TimerHandle};
use crate::Error;
use parking_lot::ReentrantMutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub(crate) type Routine<T> = Arc<dyn Fn(&Promise<T>) + Send + Sync>;

type Teardown = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    resolution: Resolution<T>,
    /// Set once a terminal resolution is stored; later assignments are ignored.
    sealed: bool,
    retries: u32,
    retry_delay: Option<Duration>,
    timer: Option<TimerHandle>,
    timer_queue: Option<SerialQueue>,
    /// An attempt is on the stack; retries requested meanwhile set `rerun`.
    running: bool,
    rerun: bool,
    wakers: Vec<Waker>,
}

pub(crate) struct Shared<T> {
    machine: StateMachine,
    slot: Mutex<Slot<T>>,
    routine: Routine<T>,
    /// Held for the whole of an attempt, and by `cancel`.
    attempts: ReentrantMutex<()>,
    /// Runs once, just before the promise finishes or is cancelled.
    teardown: Mutex<Option<Teardown>>,
    progress: Progress,
}

impl<T> Shared<T> {
    fn run_teardown(&self) {
        let teardown = self.teardown.lock().unwrap().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    fn disarm_timer(&self) {
        let timer = self.slot.lock().unwrap().timer.take();
        if let Some(timer) = timer {
            timer.invalidate();
            debug!(timer = timer.id(), "invalidated pending retry");
        }
    }
}

impl<T: Send + 'static> Operation for Shared<T> {
    fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    fn execute(self: Arc<Self>) {
        Promise { shared: self }.attempt();
    }

    fn finish(&self) {
        self.disarm_timer();
        if self.machine.is_executing() {
            self.run_teardown();
        }
        self.machine.transition(ExecutionState::Finished);
    }

    /// Waits for an attempt running on another thread to return first.
    fn cancel(&self) {
        let cancelled = {
            let _attempt = self.attempts.lock();
            self.disarm_timer();
            if !self.machine.is_finished() {
                self.run_teardown();
            }
            self.machine.transition_with(ExecutionState::Cancelled, || {
                let mut slot = self.slot.lock().unwrap();
                slot.sealed = true;
                slot.resolution = Resolution::Cancelled;
            })
        };
        if cancelled {
            self.progress.cancel();
        }
    }
}

/// A unit of work that settles to a [`Resolution<T>`].
///
/// `Promise` is a cheap handle; clones refer to the same unit of work.
///
/// # Examples
///
/// ```
/// use promise_chain::{Error, Promise, Scheduler};
/// use futures::executor::block_on;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// let scheduler = Scheduler::new().unwrap();
/// let attempts = AtomicU32::new(0);
/// let flaky = Promise::new(move |promise: &Promise<&'static str>| {
///     if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
///         promise.reject(Error::execution("not yet"));
///     } else {
///         promise.resolve("done");
///     }
/// })
/// .with_retry_count(3)
/// .await_on(&scheduler);
/// assert_eq!(block_on(flaky.settled()).into_result(), Some("done"));
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock().unwrap();
        f.debug_struct("Promise")
            .field("state", &self.shared.machine.state())
            .field("resolution", &slot.resolution)
            .field("retries", &slot.retries)
            .finish()
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates an unscheduled promise. Nothing runs until it is started,
    /// usually by [`await_on`](Promise::await_on).
    pub fn new<F>(routine: F) -> Self
    where
        F: Fn(&Promise<T>) + Send + Sync + 'static,
    {
        Self::from_parts(Arc::new(routine), 0, None, None)
    }

    /// A promise that immediately settles to `resolution` when it runs.
    pub fn resolved(resolution: Resolution<T>) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |promise| promise.set_resolution(resolution.clone()))
    }

    fn from_parts(
        routine: Routine<T>,
        retries: u32,
        retry_delay: Option<Duration>,
        timer_queue: Option<SerialQueue>,
    ) -> Self {
        let shared = Arc::new(Shared {
            machine: StateMachine::new(),
            slot: Mutex::new(Slot {
                resolution: Resolution::Unresolved,
                sealed: false,
                retries,
                retry_delay,
                timer: None,
                timer_queue,
                running: false,
                rerun: false,
                wakers: Vec::new(),
            }),
            routine,
            attempts: ReentrantMutex::new(()),
            teardown: Mutex::new(None),
            progress: Progress::new(),
        });
        let weak = Arc::downgrade(&shared);
        shared.machine.when_terminal(move |_| {
            if let Some(shared) = weak.upgrade() {
                let wakers = std::mem::take(&mut shared.slot.lock().unwrap().wakers);
                for waker in wakers {
                    waker.wake();
                }
            }
        });
        let weak = Arc::downgrade(&shared);
        shared.progress.on_cancel(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.cancel();
            }
        });
        Self { shared }
    }

    /// A promise that settles like `source` does.
    ///
    /// Nothing is adopted until the returned promise runs.
    pub fn adopting(source: &Promise<T>) -> Self
    where
        T: Clone,
    {
        let source = source.clone();
        Self::new(move |promise| promise.adopt(&source))
    }

    /// Retries left after an error.
    pub fn with_retry_count(self, count: u32) -> Self {
        self.set_retry_count(count);
        self
    }

    /// Waits `delay` on the main queue before each retry.
    pub fn with_retry_delay(self, delay: Duration) -> Self {
        self.set_retry_delay(Some(delay));
        self
    }

    pub fn set_retry_count(&self, count: u32) {
        self.shared.slot.lock().unwrap().retries = count;
    }

    pub fn set_retry_delay(&self, delay: Option<Duration>) {
        self.shared.slot.lock().unwrap().retry_delay = delay;
    }

    /// Remaining retry budget.
    pub fn retry_count(&self) -> u32 {
        self.shared.slot.lock().unwrap().retries
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.shared.slot.lock().unwrap().retry_delay
    }

    pub fn resolution(&self) -> Resolution<T>
    where
        T: Clone,
    {
        self.shared.slot.lock().unwrap().resolution.clone()
    }

    /// Borrows the current resolution without cloning it.
    pub fn with_resolution<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Resolution<T>) -> R,
    {
        f(&self.shared.slot.lock().unwrap().resolution)
    }

    /// Sets the resolution and reacts to it.
    ///
    /// Ignored once the promise has settled. Before the promise has started
    /// the value is only stored; the routine will overwrite it.
    pub fn set_resolution(&self, resolution: Resolution<T>) {
        if resolution.is_cancelled() {
            self.cancel();
            return;
        }
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.sealed || self.shared.machine.is_finished() {
            trace!("promise already settled, ignoring resolution");
            return;
        }
        if self.shared.machine.state() == ExecutionState::Initial {
            slot.resolution = resolution;
            return;
        }
        match resolution {
            Resolution::Error(_) if slot.retries > 0 => {
                slot.retries -= 1;
                let remaining = slot.retries;
                let delay = slot.retry_delay;
                slot.resolution = resolution;
                debug!(remaining, ?delay, "retrying after error");
                match delay {
                    Some(delay) => self.arm_retry(slot, delay),
                    None => self.retry_now(slot),
                }
            }
            Resolution::Result(_) | Resolution::Error(_) => {
                slot.sealed = true;
                slot.resolution = resolution;
                drop(slot);
                self.shared.finish();
            }
            Resolution::Unresolved | Resolution::Cancelled => slot.resolution = resolution,
        }
    }

    pub fn resolve(&self, value: T) {
        self.set_resolution(Resolution::Result(value));
    }

    pub fn reject(&self, err: Error) {
        self.set_resolution(Resolution::Error(err));
    }

    /// Settles this promise with `source`'s resolution once `source` is
    /// finished or cancelled.
    ///
    /// Like any assignment, the adopted value is only stored if this promise
    /// has not started yet.
    pub fn adopt(&self, source: &Promise<T>)
    where
        T: Clone,
    {
        let target = self.downgrade();
        let source_handle = source.downgrade();
        source.shared.machine.when_terminal(move |_| {
            if let (Some(target), Some(source)) = (target.upgrade(), source_handle.upgrade()) {
                target.set_resolution(source.resolution());
            }
        });
    }

    /// Blocks the calling thread until the promise settles or `timeout`
    /// elapses. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Resolution<T>>
    where
        T: Clone,
    {
        let (settled, wait) = crossbeam_channel::bounded(1);
        self.shared.machine.when_terminal(move |_| {
            let _ = settled.send(());
        });
        wait.recv_timeout(timeout).ok().map(|()| self.resolution())
    }

    /// Cancellation and progress token shared with the routine.
    ///
    /// Cancelling the token cancels the promise, and cancelling the promise
    /// cancels the token.
    pub fn progress(&self) -> &Progress {
        &self.shared.progress
    }

    fn retry_now(&self, mut slot: MutexGuard<'_, Slot<T>>) {
        if slot.running {
            slot.rerun = true;
        } else {
            drop(slot);
            self.attempt();
        }
    }

    fn arm_retry(&self, mut slot: MutexGuard<'_, Slot<T>>, delay: Duration) {
        if slot.sealed || !self.shared.machine.is_executing() {
            return;
        }
        if slot.timer.is_some() {
            trace!("retry timer already armed");
            return;
        }
        let queue = match &slot.timer_queue {
            Some(queue) => queue.clone(),
            None => match Scheduler::shared() {
                Ok(scheduler) => scheduler.main_queue().clone(),
                Err(err) => {
                    warn!(%err, "no queue for the retry timer, retrying without delay");
                    self.retry_now(slot);
                    return;
                }
            },
        };
        let promise = self.clone();
        let timer = queue.dispatch_after(delay, move || promise.fire_retry());
        debug!(timer = timer.id(), ?delay, queue = queue.name(), "armed retry timer");
        slot.timer = Some(timer);
    }

    fn fire_retry(&self) {
        let armed = self.shared.slot.lock().unwrap().timer.take();
        match armed {
            Some(timer) if !timer.is_invalidated() => {
                trace!(timer = timer.id(), "retry timer fired");
                self.attempt();
            }
            _ => trace!("stale retry timer ignored"),
        }
    }

    /// Runs the routine, then reruns it for every retry requested while it
    /// ran. Holds the attempt lock throughout, so `cancel` on another thread
    /// waits and no attempt starts after it.
    fn attempt(&self) {
        let _attempt = self.shared.attempts.lock();
        {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.running {
                slot.rerun = true;
                return;
            }
            if slot.sealed || !self.shared.machine.is_executing() {
                trace!("promise settled, skipping attempt");
                return;
            }
            slot.running = true;
        }
        loop {
            (self.shared.routine)(self);
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.rerun && !slot.sealed && self.shared.machine.is_executing() {
                slot.rerun = false;
                continue;
            }
            slot.running = false;
            slot.rerun = false;
            return;
        }
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.shared.machine.state()
    }

    pub fn is_executing(&self) -> bool {
        self.shared.machine.is_executing()
    }

    /// True once the promise is finished or cancelled.
    pub fn is_finished(&self) -> bool {
        self.shared.machine.is_finished()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.machine.is_cancelled()
    }

    /// Runs the promise on the calling thread, bypassing any scheduler.
    pub fn start(&self) {
        Operation::start(self.shared.clone());
    }

    /// Invalidates any pending retry, then moves the promise to Cancelled.
    ///
    /// An attempt running on another thread is allowed to return first; no
    /// attempt starts once this returns.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn finish(&self) {
        self.shared.finish();
    }

    pub fn observe(&self, observer: Observer) {
        self.shared.machine.observe(observer);
    }

    /// This promise as a unit of work, for dependency lists.
    pub fn operation(&self) -> Arc<dyn Operation> {
        self.shared.clone()
    }

    pub fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Submits the promise to `scheduler`'s worker pool.
    pub fn await_on(self, scheduler: &Scheduler) -> Self {
        self.submit(scheduler, Vec::new(), Lane::Pool);
        self
    }

    /// Submits the promise to `scheduler`'s main queue.
    pub fn await_on_main(self, scheduler: &Scheduler) -> Self {
        self.submit(scheduler, Vec::new(), Lane::Main);
        self
    }

    /// Completes with the final resolution once the promise is finished or
    /// cancelled.
    pub fn settled(&self) -> Settled<T> {
        Settled {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn submit(&self, scheduler: &Scheduler, dependencies: Vec<Arc<dyn Operation>>, lane: Lane) {
        {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.timer_queue.is_none() {
                slot.timer_queue = Some(scheduler.main_queue().clone());
            }
        }
        scheduler.submit_with(self.operation(), dependencies, lane);
    }

    pub(crate) fn set_teardown<F>(&self, teardown: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.shared.teardown.lock().unwrap() = Some(Box::new(teardown));
    }

    /// A fresh promise with the same retry settings and teardown, running the
    /// routine produced by `wrap`.
    pub(crate) fn rebuild<F>(self, wrap: F) -> Self
    where
        F: FnOnce(Routine<T>) -> Routine<T>,
    {
        let (retries, retry_delay, timer_queue) = {
            let slot = self.shared.slot.lock().unwrap();
            (slot.retries, slot.retry_delay, slot.timer_queue.clone())
        };
        let teardown = self.shared.teardown.lock().unwrap().take();
        let rebuilt = Self::from_parts(wrap(self.shared.routine.clone()), retries, retry_delay, timer_queue);
        *rebuilt.shared.teardown.lock().unwrap() = teardown;
        rebuilt
    }
}

/// A non-owning handle to a [`Promise`].
pub struct WeakPromise<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakPromise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> WeakPromise<T> {
    pub fn upgrade(&self) -> Option<Promise<T>> {
        self.shared.upgrade().map(|shared| Promise { shared })
    }
}

/// Future returned by [`Promise::settled`].
pub struct Settled<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> Future for Settled<T> {
    type Output = Resolution<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock().unwrap();
        if self.shared.machine.is_finished() {
            Poll::Ready(slot.resolution.clone())
        } else {
            if !slot.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                slot.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}
