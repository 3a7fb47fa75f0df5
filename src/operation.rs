//! The unit-of-work state machine.
//!
//! Every unit of work moves through `Initial -> Executing -> {Cancelled |
//! Finished}`, or straight from `Initial` to `Cancelled` when it is cancelled
//! before it ever starts. Cancelled and Finished are terminal. Requests for any
//! other transition are dropped without effect.
//!
//! Observers see each transition bracketed by [`Phase::Will`] and
//! [`Phase::Did`] notifications for the properties it touches. Transitions of
//! one unit of work never interleave.
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Initial,
    Executing,
    Cancelled,
    Finished,
}

impl ExecutionState {
    /// Cancelled and Finished never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Cancelled | ExecutionState::Finished)
    }

    /// Whether `self -> next` is one of the four legal edges.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Initial, Executing) | (Initial, Cancelled) | (Executing, Cancelled) | (Executing, Finished)
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ExecutionState::Initial,
            1 => ExecutionState::Executing,
            2 => ExecutionState::Cancelled,
            _ => ExecutionState::Finished,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ExecutionState::Initial => 0,
            ExecutionState::Executing => 1,
            ExecutionState::Cancelled => 2,
            ExecutionState::Finished => 3,
        }
    }
}

/// Observable properties of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    IsExecuting,
    IsFinished,
    IsCancelled,
}

impl Property {
    pub fn key(self) -> &'static str {
        match self {
            Property::IsExecuting => "isExecuting",
            Property::IsFinished => "isFinished",
            Property::IsCancelled => "isCancelled",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Sent before the state changes.
    Will,
    /// Sent after the state has changed.
    Did,
}

/// One before/after notification for one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub property: Property,
    pub phase: Phase,
    pub from: ExecutionState,
    pub to: ExecutionState,
}

pub type Observer = Arc<dyn Fn(&Observation) + Send + Sync>;

type TerminalHook = Box<dyn FnOnce(ExecutionState) + Send>;

/// Properties bracketed by a transition, in notification order.
fn bracketed(from: ExecutionState, to: ExecutionState) -> &'static [Property] {
    use ExecutionState::*;
    use Property::*;
    match (from, to) {
        (_, Executing) => &[IsExecuting],
        (Executing, Cancelled) => &[IsExecuting, IsCancelled, IsFinished],
        (_, Cancelled) => &[IsCancelled, IsFinished],
        (Executing, Finished) => &[IsExecuting, IsFinished],
        (_, Finished) => &[IsFinished],
        (_, Initial) => &[],
    }
}

#[derive(Default)]
struct Inner {
    transitioning: bool,
    observers: Vec<Observer>,
    on_terminal: Vec<TerminalHook>,
}

/// The authoritative lifecycle of one unit of work.
///
/// Reads are lock-free. Transitions, and the notifications that bracket them,
/// run under a per-instance reentrant lock, so an observer may query the state
/// or request another transition from inside a notification without
/// deadlocking. Such nested requests are rejected.
pub struct StateMachine {
    state: AtomicU8,
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine").field("state", &self.state()).finish()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ExecutionState::Initial.as_u8()),
            inner: ReentrantMutex::new(RefCell::new(Inner::default())),
        }
    }

    pub fn state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_executing(&self) -> bool {
        self.state() == ExecutionState::Executing
    }

    /// True for both Finished and Cancelled.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ExecutionState::Cancelled
    }

    /// Registers an observer for every later transition.
    pub fn observe(&self, observer: Observer) {
        let guard = self.inner.lock();
        guard.borrow_mut().observers.push(observer);
    }

    /// Runs `hook` once the state is terminal, immediately if it already is.
    ///
    /// Hooks run after the transition lock is released.
    pub fn when_terminal<F>(&self, hook: F)
    where
        F: FnOnce(ExecutionState) + Send + 'static,
    {
        let guard = self.inner.lock();
        let state = self.state();
        if state.is_terminal() {
            drop(guard);
            hook(state);
        } else {
            guard.borrow_mut().on_terminal.push(Box::new(hook));
        }
    }

    pub fn transition(&self, to: ExecutionState) -> bool {
        self.transition_with(to, || {})
    }

    /// Moves to `to` if the edge is legal, running `commit` between the
    /// before and after notifications. Returns whether the transition happened.
    pub fn transition_with<F: FnOnce()>(&self, to: ExecutionState, commit: F) -> bool {
        let guard = self.inner.lock();
        let from = self.state();
        let observers = {
            let mut inner = guard.borrow_mut();
            if inner.transitioning || !from.can_transition_to(to) {
                trace!(?from, ?to, nested = inner.transitioning, "rejected transition");
                return false;
            }
            inner.transitioning = true;
            inner.observers.clone()
        };

        let properties = bracketed(from, to);
        notify(&observers, properties, Phase::Will, from, to);
        commit();
        self.state.store(to.as_u8(), Ordering::Release);
        trace!(?from, ?to, "transition");
        notify(&observers, properties, Phase::Did, from, to);

        let hooks = {
            let mut inner = guard.borrow_mut();
            inner.transitioning = false;
            if to.is_terminal() {
                std::mem::take(&mut inner.on_terminal)
            } else {
                Vec::new()
            }
        };
        drop(guard);
        for hook in hooks {
            hook(to);
        }
        true
    }
}

fn notify(
    observers: &[Observer],
    properties: &[Property],
    phase: Phase,
    from: ExecutionState,
    to: ExecutionState,
) {
    for &property in properties {
        let observation = Observation { property, phase, from, to };
        for observer in observers {
            observer(&observation);
        }
    }
}

/// A cancellable, observable unit of work.
///
/// Implementors supply [`execute`](Operation::execute); `start`, `finish` and
/// `cancel` drive the [`StateMachine`] and may be overridden to add teardown.
pub trait Operation: Send + Sync + 'static {
    fn state_machine(&self) -> &StateMachine;

    /// Begins the work. Called at most once, by `start`.
    fn execute(self: Arc<Self>);

    /// No-op once cancelled or finished.
    fn start(self: Arc<Self>) {
        if self.state_machine().transition(ExecutionState::Executing) {
            self.execute();
        }
    }

    fn finish(&self) {
        self.state_machine().transition(ExecutionState::Finished);
    }

    fn cancel(&self) {
        self.state_machine().transition(ExecutionState::Cancelled);
    }

    fn execution_state(&self) -> ExecutionState {
        self.state_machine().state()
    }

    fn is_executing(&self) -> bool {
        self.state_machine().is_executing()
    }

    fn is_finished(&self) -> bool {
        self.state_machine().is_finished()
    }

    fn is_cancelled(&self) -> bool {
        self.state_machine().is_cancelled()
    }
}

/// Runs one closure, then finishes.
pub struct BlockOperation {
    machine: StateMachine,
    block: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl BlockOperation {
    pub fn new<F>(block: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self {
            machine: StateMachine::new(),
            block: Mutex::new(Some(Box::new(block))),
        })
    }
}

impl fmt::Debug for BlockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockOperation").field("machine", &self.machine).finish()
    }
}

impl Operation for BlockOperation {
    fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    fn execute(self: Arc<Self>) {
        let block = self.block.lock().unwrap().take();
        if let Some(block) = block {
            block();
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use ExecutionState::*;

    fn recorded(machine: &StateMachine) -> Arc<Mutex<Vec<(Property, Phase)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        machine.observe(Arc::new(move |o: &Observation| {
            sink.lock().unwrap().push((o.property, o.phase));
        }));
        log
    }

    #[test]
    fn test_transition_table() {
        let all = [Initial, Executing, Cancelled, Finished];
        let legal = [(Initial, Executing), (Initial, Cancelled), (Executing, Cancelled), (Executing, Finished)];
        for from in all {
            for to in all {
                assert_eq!(from.can_transition_to(to), legal.contains(&(from, to)), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_start_then_finish_brackets() {
        let machine = StateMachine::new();
        let log = recorded(&machine);
        assert!(machine.transition(Executing));
        assert!(machine.transition(Finished));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                (Property::IsExecuting, Phase::Will),
                (Property::IsExecuting, Phase::Did),
                (Property::IsExecuting, Phase::Will),
                (Property::IsFinished, Phase::Will),
                (Property::IsExecuting, Phase::Did),
                (Property::IsFinished, Phase::Did),
            ]
        );
        assert!(machine.is_finished());
        assert!(!machine.is_cancelled());
    }

    #[test]
    fn test_cancel_before_start_skips_executing() {
        let machine = StateMachine::new();
        let log = recorded(&machine);
        assert!(machine.transition(Cancelled));
        let log = log.lock().unwrap();
        assert!(log.iter().all(|(p, _)| *p != Property::IsExecuting));
        assert_eq!(log.len(), 4);
        assert!(machine.is_finished());
        assert!(machine.is_cancelled());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let machine = StateMachine::new();
        machine.transition(Executing);
        machine.transition(Finished);
        assert!(!machine.transition(Cancelled));
        assert!(!machine.transition(Executing));
        assert!(!machine.transition(Initial));
        assert_eq!(machine.state(), Finished);
    }

    #[test]
    fn test_commit_runs_only_on_accepted_transition() {
        let machine = StateMachine::new();
        let commits = AtomicUsize::new(0);
        assert!(!machine.transition_with(Finished, || {
            commits.fetch_add(1, Ordering::SeqCst);
        }));
        machine.transition(Executing);
        assert!(machine.transition_with(Finished, || {
            commits.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_transition_from_observer_is_rejected() {
        let machine = Arc::new(StateMachine::new());
        let inner = machine.clone();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let results = nested.clone();
        machine.observe(Arc::new(move |o: &Observation| {
            if o.to == Finished && o.phase == Phase::Will {
                results.lock().unwrap().push(inner.transition(Cancelled));
            }
        }));
        machine.transition(Executing);
        assert!(machine.transition(Finished));
        assert_eq!(machine.state(), Finished);
        assert!(nested.lock().unwrap().iter().all(|accepted| !accepted));
    }

    #[test]
    fn test_when_terminal_fires_once() {
        let machine = StateMachine::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        machine.when_terminal(move |state| {
            assert_eq!(state, Cancelled);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        machine.transition(Executing);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        machine.transition(Cancelled);
        machine.transition(Finished);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let late = fired.clone();
        machine.when_terminal(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_racing_cancel_and_finish() {
        for _ in 0..64 {
            let machine = Arc::new(StateMachine::new());
            machine.transition(Executing);
            let accepted = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = [Cancelled, Finished]
                .into_iter()
                .map(|to| {
                    let machine = machine.clone();
                    let accepted = accepted.clone();
                    std::thread::spawn(move || {
                        if machine.transition(to) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("The transition thread has panicked");
            }
            assert_eq!(accepted.load(Ordering::SeqCst), 1);
            assert!(machine.state().is_terminal());
        }
    }

    #[test]
    fn test_block_operation_runs_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let op = BlockOperation::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        op.clone().start();
        op.clone().start();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(op.execution_state(), Finished);
    }

    #[test]
    fn test_cancelled_block_never_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let op = BlockOperation::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        op.cancel();
        op.clone().start();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(op.is_cancelled());
    }
}
