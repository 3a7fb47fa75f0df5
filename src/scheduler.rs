//! Queues that run units of work once their dependencies have settled.
//!
//! A [`Scheduler`] owns a pool of worker threads and one [`SerialQueue`], the
//! designated "main" context. Work submitted with dependencies is held back
//! until every dependency reaches a terminal state, whatever its outcome.
//! Nothing here blocks a worker waiting on another unit of work: readiness is
//! driven by the dependencies' terminal hooks.
use crate::operation::Operation;
use crate::Error;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads. Never less than one.
    pub workers: usize,
    /// Prefix for thread names.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            name: "promise-worker".into(),
        }
    }
}

impl SchedulerConfig {
    pub fn workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }

    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Pool,
    Main,
}

struct SchedulerInner {
    config: SchedulerConfig,
    jobs: Sender<Job>,
    main: SerialQueue,
}

/// Runs submitted units of work on a worker pool or on the main queue.
///
/// Cloning is cheap; clones share the same threads. The threads exit once the
/// last clone is dropped and their queues drain.
///
/// # Examples
///
/// ```
/// use promise_chain::{BlockOperation, Scheduler, SchedulerConfig};
/// use std::sync::mpsc::channel;
///
/// let scheduler = Scheduler::with_config(SchedulerConfig::default().workers(2)).unwrap();
/// let (tx, rx) = channel();
/// let first = BlockOperation::new(|| {});
/// let second = BlockOperation::new(move || tx.send("after first").unwrap());
/// scheduler.submit_after(second, &[first.clone()]);
/// scheduler.submit(first);
/// assert_eq!(rx.recv().unwrap(), "after first");
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("config", &self.inner.config).finish()
    }
}

impl Scheduler {
    pub fn new() -> Result<Self, Error> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self, Error> {
        let (jobs, receiver) = unbounded::<Job>();
        let workers = config.workers.max(1);
        for index in 0..workers {
            let name = format!("{}-{index}", config.name);
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(receiver))
                .map_err(|source| Error::spawn(name, source))?;
        }
        let main = SerialQueue::spawn(format!("{}-main", config.name))?;
        debug!(workers, name = %config.name, "scheduler started");
        Ok(Self {
            inner: Arc::new(SchedulerInner { config, jobs, main }),
        })
    }

    /// A process-wide default, created on first use and never torn down.
    ///
    /// Callers that need isolation should construct their own scheduler.
    /// Fails with [`Error::Spawn`] if its threads cannot be started; a later
    /// call tries again.
    pub fn shared() -> Result<&'static Scheduler, Error> {
        static SHARED: OnceLock<Scheduler> = OnceLock::new();
        if let Some(shared) = SHARED.get() {
            return Ok(shared);
        }
        // A scheduler that loses the race is dropped and its threads exit.
        let scheduler = Scheduler::new()?;
        Ok(SHARED.get_or_init(|| scheduler))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The serial context used for main-queue work and retry timers.
    pub fn main_queue(&self) -> &SerialQueue {
        &self.inner.main
    }

    pub fn submit(&self, operation: Arc<dyn Operation>) {
        self.submit_with(operation, Vec::new(), Lane::Pool);
    }

    /// Runs `operation` once every dependency is cancelled or finished.
    pub fn submit_after(&self, operation: Arc<dyn Operation>, dependencies: &[Arc<dyn Operation>]) {
        self.submit_with(operation, dependencies.to_vec(), Lane::Pool);
    }

    pub fn submit_on_main(&self, operation: Arc<dyn Operation>) {
        self.submit_with(operation, Vec::new(), Lane::Main);
    }

    pub fn submit_on_main_after(&self, operation: Arc<dyn Operation>, dependencies: &[Arc<dyn Operation>]) {
        self.submit_with(operation, dependencies.to_vec(), Lane::Main);
    }

    pub(crate) fn submit_with(
        &self,
        operation: Arc<dyn Operation>,
        dependencies: Vec<Arc<dyn Operation>>,
        lane: Lane,
    ) {
        let gate = Arc::new(Gate {
            remaining: AtomicUsize::new(dependencies.len() + 1),
            pending: Mutex::new(Some((operation, dependencies.clone()))),
            scheduler: self.clone(),
            lane,
        });
        for dependency in &dependencies {
            let gate = gate.clone();
            dependency.state_machine().when_terminal(move |_| gate.arrive());
        }
        // Releases the slot held during registration.
        gate.arrive();
    }

    fn dispatch(&self, operation: Arc<dyn Operation>, dependencies: Vec<Arc<dyn Operation>>, lane: Lane) {
        // The edges keep predecessors alive until the successor has started.
        let job: Job = Box::new(move || {
            operation.start();
            drop(dependencies);
        });
        match lane {
            Lane::Pool => {
                if self.inner.jobs.send(job).is_err() {
                    warn!("worker pool is gone, dropping unit of work");
                }
            }
            Lane::Main => self.inner.main.dispatch(job),
        }
    }
}

/// Counts down the dependencies of one pending unit of work.
struct Gate {
    remaining: AtomicUsize,
    pending: Mutex<Option<(Arc<dyn Operation>, Vec<Arc<dyn Operation>>)>>,
    scheduler: Scheduler,
    lane: Lane,
}

impl Gate {
    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let pending = self.pending.lock().unwrap().take();
        if let Some((operation, dependencies)) = pending {
            self.scheduler.dispatch(operation, dependencies, self.lane);
        }
    }
}

fn worker_loop(jobs: Receiver<Job>) {
    let name = thread::current().name().unwrap_or("worker").to_owned();
    trace!(worker = %name, "worker starting");
    for job in jobs {
        run_job(&name, job);
    }
    trace!(worker = %name, "worker exiting");
}

fn run_job(context: &str, job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        error!(context, panic = %panic_message(&payload), "unit of work panicked");
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

/// A one-shot timer armed on a [`SerialQueue`].
///
/// Once invalidated the timer never runs its job, even if its deadline has
/// already passed and it is waiting to be picked up.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    invalidated: Arc<AtomicBool>,
    queue: Weak<SerialInner>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the timer and lets its queue drop the job straight away.
    pub fn invalidate(&self) {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.commands.send(Command::Disarm(self.id));
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}

enum Command {
    Run(Job),
    After { deadline: Instant, timer: TimerHandle, job: Job },
    Disarm(u64),
}

struct SerialInner {
    name: String,
    commands: Sender<Command>,
    next_timer: AtomicU64,
    thread: ThreadId,
}

/// A single thread running jobs one at a time, in submission order, plus
/// cancellable one-shot timers.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<SerialInner>,
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue").field("name", &self.inner.name).finish()
    }
}

impl SerialQueue {
    pub fn spawn<N: Into<String>>(name: N) -> Result<Self, Error> {
        let name = name.into();
        let (commands, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || serial_loop(receiver))
            .map_err(|source| Error::spawn(name.clone(), source))?;
        let thread = handle.thread().id();
        Ok(Self {
            inner: Arc::new(SerialInner {
                name,
                commands,
                next_timer: AtomicU64::new(1),
                thread,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this queue's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.commands.send(Command::Run(Box::new(job))).is_err() {
            warn!(queue = %self.inner.name, "serial queue is gone, dropping job");
        }
    }

    /// Runs `job` on this queue after `delay`, unless the returned handle is
    /// invalidated first.
    pub fn dispatch_after<F>(&self, delay: Duration, job: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = TimerHandle {
            id: self.inner.next_timer.fetch_add(1, Ordering::Relaxed),
            invalidated: Arc::new(AtomicBool::new(false)),
            queue: Arc::downgrade(&self.inner),
        };
        let command = Command::After {
            deadline: Instant::now() + delay,
            timer: timer.clone(),
            job: Box::new(job),
        };
        if self.inner.commands.send(command).is_err() {
            warn!(queue = %self.inner.name, "serial queue is gone, timer will never fire");
            timer.invalidate();
        }
        timer
    }
}

fn serial_loop(commands: Receiver<Command>) {
    let name = thread::current().name().unwrap_or("serial").to_owned();
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut timers: HashMap<u64, (TimerHandle, Job)> = HashMap::new();
    loop {
        let received = match deadlines.peek() {
            Some(Reverse((deadline, _))) => match commands.recv_deadline(*deadline) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };
        match received {
            Some(Command::Run(job)) => run_job(&name, job),
            Some(Command::After { deadline, timer, job }) => {
                deadlines.push(Reverse((deadline, timer.id())));
                timers.insert(timer.id(), (timer, job));
            }
            Some(Command::Disarm(id)) => {
                if timers.remove(&id).is_some() {
                    trace!(queue = %name, timer = id, "dropped disarmed timer");
                }
            }
            None => {}
        }

        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = deadlines.peek() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some((timer, job)) = timers.remove(&id) {
                if timer.is_invalidated() {
                    trace!(queue = %name, timer = id, "skipping invalidated timer");
                } else {
                    run_job(&name, job);
                }
            }
        }
    }
    debug!(queue = %name, pending_timers = timers.len(), "serial queue exiting");
}
