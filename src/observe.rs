//! Promises driven by change notifications from an observed object.
//!
//! An [`ObservingPromise`] subscribes to one property of an [`Observable`]
//! when it starts and hands every matching notification to a callback. The
//! callback decides when the promise is done by setting its resolution. The
//! subscription is dropped exactly once, when the promise finishes or is
//! cancelled, and the observed object is never kept alive by the promise.
use crate::promise::Promise;
use crate::scheduler::Scheduler;
use std::ops::{BitOr, Deref};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace};

/// Correlation token attached to a subscription and echoed by every
/// notification it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context(u64);

impl Context {
    /// A token distinct from every other token created in this process.
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Context(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`Observable::subscribe`], consumed by
/// [`Observable::unsubscribe`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

impl Subscription {
    pub fn new(id: u64) -> Self {
        Subscription(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Identity of an observed object, compared by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn of<O: ?Sized>(object: &O) -> Self {
        ObjectId(object as *const O as *const () as usize)
    }
}

/// Which values a notification carries, and whether one is sent right away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveOptions(u8);

impl ObserveOptions {
    /// Include the value after the change.
    pub const NEW: ObserveOptions = ObserveOptions(1);
    /// Include the value before the change.
    pub const OLD: ObserveOptions = ObserveOptions(1 << 1);
    /// Notify once with the current value as soon as the subscription is made.
    pub const INITIAL: ObserveOptions = ObserveOptions(1 << 2);

    pub const fn empty() -> Self {
        ObserveOptions(0)
    }

    pub const fn contains(self, other: ObserveOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ObserveOptions {
    type Output = ObserveOptions;

    fn bitor(self, rhs: ObserveOptions) -> ObserveOptions {
        ObserveOptions(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<V> {
    pub old: Option<V>,
    pub new: Option<V>,
}

#[derive(Debug, Clone)]
pub struct Notification<V> {
    pub object: ObjectId,
    pub key: String,
    pub change: Option<Change<V>>,
    pub context: Option<Context>,
}

pub type Handler<V> = Arc<dyn Fn(&Notification<V>) + Send + Sync>;

/// A source of change notifications.
///
/// Handlers may be called from any thread, but never while the observable
/// holds a lock that `unsubscribe` needs.
pub trait Observable: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn subscribe(
        &self,
        key: &str,
        options: ObserveOptions,
        context: Option<Context>,
        handler: Handler<Self::Value>,
    ) -> Subscription;

    /// Unknown subscriptions are ignored.
    fn unsubscribe(&self, subscription: Subscription);
}

struct Subscriber<V> {
    id: u64,
    key: String,
    options: ObserveOptions,
    context: Option<Context>,
    handler: Handler<V>,
}

struct CellState<V> {
    value: V,
    next_id: u64,
    subscribers: Vec<Subscriber<V>>,
}

/// A single named value that notifies its subscribers on every change.
///
/// # Examples
///
/// ```
/// use promise_chain::{ObservableCell, ObserveOptions, ObservingPromise, Promise};
///
/// let cell = ObservableCell::new("status", "idle");
/// let ready = ObservingPromise::new(&cell, "status", ObserveOptions::NEW, |_, change, promise: &Promise<()>| {
///     if change.new == Some("ready") {
///         promise.resolve(());
///     }
/// });
/// ready.start();
/// cell.set("loading");
/// assert!(ready.is_executing());
/// cell.set("ready");
/// assert!(ready.is_finished());
/// assert_eq!(cell.subscriber_count(), 0);
/// ```
pub struct ObservableCell<V> {
    key: String,
    state: Mutex<CellState<V>>,
}

impl<V: Clone + Send + Sync + 'static> ObservableCell<V> {
    pub fn new<K: Into<String>>(key: K, value: V) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            state: Mutex::new(CellState {
                value,
                next_id: 1,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn set(&self, value: V) {
        self.update(|current| *current = value);
    }

    /// Changes the value in place, then notifies every subscriber.
    pub fn update<F: FnOnce(&mut V)>(&self, change: F) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            let old = state.value.clone();
            change(&mut state.value);
            let new = state.value.clone();
            state
                .subscribers
                .iter()
                .filter(|subscriber| subscriber.key == self.key)
                .map(|subscriber| {
                    let notification = self.notification(subscriber, Some(old.clone()), new.clone());
                    (subscriber.handler.clone(), notification)
                })
                .collect::<Vec<_>>()
        };
        for (handler, notification) in pending {
            handler(&notification);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    fn notification(&self, subscriber: &Subscriber<V>, old: Option<V>, new: V) -> Notification<V> {
        let options = subscriber.options;
        Notification {
            object: ObjectId::of(self),
            key: subscriber.key.clone(),
            change: Some(Change {
                old: old.filter(|_| options.contains(ObserveOptions::OLD)),
                new: Some(new).filter(|_| options.contains(ObserveOptions::NEW)),
            }),
            context: subscriber.context,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Observable for ObservableCell<V> {
    type Value = V;

    fn subscribe(
        &self,
        key: &str,
        options: ObserveOptions,
        context: Option<Context>,
        handler: Handler<V>,
    ) -> Subscription {
        let (id, initial) = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            let subscriber = Subscriber {
                id,
                key: key.to_owned(),
                options,
                context,
                handler: handler.clone(),
            };
            let initial = (options.contains(ObserveOptions::INITIAL) && key == self.key)
                .then(|| self.notification(&subscriber, None, state.value.clone()));
            state.subscribers.push(subscriber);
            (id, initial)
        };
        if let Some(notification) = initial {
            handler(&notification);
        }
        Subscription::new(id)
    }

    fn unsubscribe(&self, subscription: Subscription) {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .retain(|subscriber| subscriber.id != subscription.id());
    }
}

type Callback<T, V, O> = Arc<dyn Fn(&O, &Change<V>, &Promise<T>) + Send + Sync>;

enum Link {
    Idle,
    Subscribing,
    Active(Subscription),
    Closed,
}

/// Subscription bookkeeping shared by the promise's routine, its teardown and
/// the handler registered with the observed object.
struct Bridge<T, O: Observable> {
    object: Weak<O>,
    object_id: ObjectId,
    key: String,
    options: ObserveOptions,
    context: Option<Context>,
    callback: Callback<T, O::Value, O>,
    fallback: Handler<O::Value>,
    link: Mutex<Link>,
}

impl<T: Send + 'static, O: Observable> Bridge<T, O> {
    /// Subscribes on the first run; retries keep the existing subscription.
    fn open(self: &Arc<Self>, promise: &Promise<T>) {
        {
            let mut link = self.link.lock().unwrap();
            if !matches!(*link, Link::Idle) {
                trace!(key = %self.key, "already subscribed");
                return;
            }
            *link = Link::Subscribing;
        }
        let Some(object) = self.object.upgrade() else {
            trace!(key = %self.key, "observed object is gone, not subscribing");
            *self.link.lock().unwrap() = Link::Closed;
            return;
        };

        let bridge = self.clone();
        let target = promise.clone();
        let handler: Handler<O::Value> =
            Arc::new(move |notification: &Notification<O::Value>| bridge.receive(notification, &target));
        let subscription = object.subscribe(&self.key, self.options, self.context, handler);
        debug!(key = %self.key, subscription = subscription.id(), "subscribed");

        let mut link = self.link.lock().unwrap();
        if matches!(*link, Link::Subscribing) {
            *link = Link::Active(subscription);
        } else {
            // Settled while subscribing; nobody else holds the subscription.
            *link = Link::Closed;
            drop(link);
            debug!(key = %self.key, subscription = subscription.id(), "unsubscribed");
            object.unsubscribe(subscription);
        }
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.link.lock().unwrap(), Link::Closed);
        let Link::Active(subscription) = previous else {
            return;
        };
        match self.object.upgrade() {
            Some(object) => {
                debug!(key = %self.key, subscription = subscription.id(), "unsubscribed");
                object.unsubscribe(subscription);
            }
            None => trace!(key = %self.key, "observed object is gone, nothing to unsubscribe"),
        }
    }

    fn receive(&self, notification: &Notification<O::Value>, promise: &Promise<T>) {
        if let Some(expected) = self.context {
            if notification.context != Some(expected) {
                (self.fallback)(notification);
                return;
            }
        }
        let Some(object) = self.object.upgrade() else {
            trace!(key = %self.key, "observed object is gone, dropping notification");
            return;
        };
        if notification.object != self.object_id || notification.key != self.key {
            (self.fallback)(notification);
            return;
        }
        let Some(change) = &notification.change else {
            (self.fallback)(notification);
            return;
        };
        (self.callback)(&object, change, promise);
    }

    fn is_subscribed(&self) -> bool {
        matches!(*self.link.lock().unwrap(), Link::Active(_))
    }
}

fn log_unmatched<V>(notification: &Notification<V>) {
    trace!(
        key = %notification.key,
        context = ?notification.context,
        "unmatched notification forwarded to the default handler"
    );
}

/// Configures an [`ObservingPromise`] beyond the key and callback.
pub struct ObservingBuilder<O: Observable> {
    object: Weak<O>,
    object_id: ObjectId,
    key: String,
    options: ObserveOptions,
    context: Option<Context>,
    fallback: Option<Handler<O::Value>>,
}

impl<O: Observable> ObservingBuilder<O> {
    /// Observes `key` on `object` with [`ObserveOptions::NEW`] and no context.
    pub fn new<K: Into<String>>(object: &Arc<O>, key: K) -> Self {
        Self {
            object: Arc::downgrade(object),
            object_id: ObjectId::of(&**object),
            key: key.into(),
            options: ObserveOptions::NEW,
            context: None,
            fallback: None,
        }
    }

    pub fn options(mut self, options: ObserveOptions) -> Self {
        self.options = options;
        self
    }

    /// Only notifications carrying this token reach the callback.
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Receives every notification the callback does not, in place of the
    /// default trace log.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Notification<O::Value>) + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn build<T, F>(self, callback: F) -> ObservingPromise<T, O>
    where
        T: Send + 'static,
        F: Fn(&O, &Change<O::Value>, &Promise<T>) + Send + Sync + 'static,
    {
        let fallback: Handler<O::Value> = match self.fallback {
            Some(fallback) => fallback,
            None => Arc::new(log_unmatched::<O::Value>),
        };
        let bridge = Arc::new(Bridge {
            object: self.object,
            object_id: self.object_id,
            key: self.key,
            options: self.options,
            context: self.context,
            callback: Arc::new(callback),
            fallback,
            link: Mutex::new(Link::Idle),
        });
        let routine = bridge.clone();
        let promise = Promise::new(move |promise: &Promise<T>| routine.open(promise));
        let teardown = bridge.clone();
        promise.set_teardown(move || teardown.close());
        ObservingPromise { promise, bridge }
    }
}

/// A [`Promise`] resolved from change notifications of an observed object.
///
/// Starting the promise subscribes to `key` on the object. Each matching
/// notification is passed to the callback together with the promise; the
/// callback settles the promise when it has seen enough. Notifications that
/// do not match the configured context, object or key go to the fallback
/// handler instead.
pub struct ObservingPromise<T, O: Observable> {
    promise: Promise<T>,
    bridge: Arc<Bridge<T, O>>,
}

impl<T, O: Observable> Clone for ObservingPromise<T, O> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            bridge: self.bridge.clone(),
        }
    }
}

impl<T: Send + 'static, O: Observable> ObservingPromise<T, O> {
    pub fn new<K, F>(object: &Arc<O>, key: K, options: ObserveOptions, callback: F) -> Self
    where
        K: Into<String>,
        F: Fn(&O, &Change<O::Value>, &Promise<T>) + Send + Sync + 'static,
    {
        ObservingBuilder::new(object, key).options(options).build(callback)
    }

    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    pub fn into_promise(self) -> Promise<T> {
        self.promise
    }

    /// True while a subscription is held on the observed object.
    pub fn is_subscribed(&self) -> bool {
        self.bridge.is_subscribed()
    }

    pub fn await_on(self, scheduler: &Scheduler) -> Self {
        Self {
            promise: self.promise.await_on(scheduler),
            bridge: self.bridge,
        }
    }

    pub fn await_on_main(self, scheduler: &Scheduler) -> Self {
        Self {
            promise: self.promise.await_on_main(scheduler),
            bridge: self.bridge,
        }
    }
}

impl<T, O: Observable> Deref for ObservingPromise<T, O> {
    type Target = Promise<T>;

    fn deref(&self) -> &Promise<T> {
        &self.promise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicU32;

    /// Delivers whatever the test hands it and counts subscription calls.
    #[derive(Default)]
    struct Recorder {
        handlers: Mutex<Vec<(u64, Handler<i32>)>>,
        subscribes: AtomicU32,
        unsubscribes: AtomicU32,
    }

    impl Recorder {
        fn deliver(&self, notification: Notification<i32>) {
            let handlers = self.handlers.lock().unwrap().clone();
            for (_, handler) in handlers {
                handler(&notification);
            }
        }

        fn notification(self: &Arc<Self>, key: &str, new: Option<i32>, context: Option<Context>) -> Notification<i32> {
            Notification {
                object: ObjectId::of(&**self),
                key: key.to_owned(),
                change: new.map(|new| Change { old: None, new: Some(new) }),
                context,
            }
        }
    }

    impl Observable for Recorder {
        type Value = i32;

        fn subscribe(&self, _: &str, _: ObserveOptions, _: Option<Context>, handler: Handler<i32>) -> Subscription {
            let id = self.subscribes.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            self.handlers.lock().unwrap().push((id, handler));
            Subscription::new(id)
        }

        fn unsubscribe(&self, subscription: Subscription) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.handlers.lock().unwrap().retain(|(id, _)| *id != subscription.id());
        }
    }

    fn resolve_on<T: Send + 'static>(value: i32, result: T) -> impl Fn(&Recorder, &Change<i32>, &Promise<T>) + Send + Sync
    where
        T: Clone + Sync,
    {
        move |_, change, promise| {
            if change.new == Some(value) {
                promise.resolve(result.clone());
            }
        }
    }

    #[test]
    fn test_counter_down_to_zero() {
        let counter = ObservableCell::new("count", 5);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let done = ObservingPromise::new(&counter, "count", ObserveOptions::NEW | ObserveOptions::OLD, move |_, change, promise: &Promise<i32>| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(change.old.map(|old| old - 1), change.new);
            if change.new == Some(0) {
                promise.resolve(0);
            }
        });
        done.start();
        assert!(done.is_subscribed());
        assert_eq!(counter.subscriber_count(), 1);

        for _ in 0..5 {
            assert!(done.is_executing());
            counter.update(|count| *count -= 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(done.resolution().into_result(), Some(0));
        assert!(!done.is_subscribed());
        assert_eq!(counter.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribes_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        let observing = ObservingPromise::new(&recorder, "value", ObserveOptions::NEW, resolve_on(1, "one"));
        observing.start();
        recorder.deliver(recorder.notification("value", Some(1), None));
        observing.cancel();
        observing.finish();
        assert_eq!(observing.resolution().into_result(), Some("one"));
        assert_eq!(recorder.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_unsubscribes() {
        let recorder = Arc::new(Recorder::default());
        let observing = ObservingPromise::new(&recorder, "value", ObserveOptions::NEW, resolve_on(1, ()));
        observing.start();
        observing.cancel();
        observing.cancel();
        assert!(observing.is_cancelled());
        assert_eq!(recorder.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(recorder.handlers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_start_never_subscribes() {
        let recorder = Arc::new(Recorder::default());
        let observing = ObservingPromise::new(&recorder, "value", ObserveOptions::NEW, resolve_on(1, ()));
        observing.cancel();
        observing.start();
        assert_eq!(recorder.subscribes.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.unsubscribes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_context_mismatch_goes_to_fallback() {
        let recorder = Arc::new(Recorder::default());
        let context = Context::new();
        let unmatched = Arc::new(AtomicU32::new(0));
        let sink = unmatched.clone();
        let observing = ObservingBuilder::new(&recorder, "value")
            .context(context)
            .fallback(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .build(resolve_on(1, ()));
        observing.start();

        recorder.deliver(recorder.notification("value", Some(1), Some(Context::new())));
        recorder.deliver(recorder.notification("value", Some(1), None));
        assert_eq!(unmatched.load(Ordering::SeqCst), 2);
        assert!(observing.is_executing());

        recorder.deliver(recorder.notification("value", Some(1), Some(context)));
        assert!(observing.is_finished());
        assert_eq!(unmatched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mismatched_key_object_or_change_goes_to_fallback() {
        let recorder = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        let unmatched = Arc::new(Mutex::new(Vec::new()));
        let sink = unmatched.clone();
        let observing = ObservingBuilder::new(&recorder, "value")
            .fallback(move |notification: &Notification<i32>| sink.lock().unwrap().push(notification.key.clone()))
            .build(resolve_on(1, ()));
        observing.start();

        recorder.deliver(recorder.notification("other", Some(1), None));
        recorder.deliver(other.notification("value", Some(1), None));
        recorder.deliver(recorder.notification("value", None, None));
        assert_eq!(*unmatched.lock().unwrap(), vec!["other", "value", "value"]);
        assert!(observing.is_executing());
    }

    #[test]
    fn test_dropped_object_is_a_no_op() {
        let recorder = Arc::new(Recorder::default());
        let observing = ObservingPromise::new(&recorder, "value", ObserveOptions::NEW, resolve_on(1, ()));
        drop(recorder);
        observing.start();
        assert!(observing.is_executing());
        assert!(!observing.is_subscribed());
        observing.cancel();
        assert!(observing.is_cancelled());
    }

    #[test]
    fn test_promise_does_not_keep_object_alive() {
        let cell = ObservableCell::new("value", 0);
        let weak = Arc::downgrade(&cell);
        let observing = ObservingPromise::new(&cell, "value", ObserveOptions::NEW, |_, _, _: &Promise<()>| {});
        observing.start();
        drop(cell);
        assert!(weak.upgrade().is_none());
        observing.cancel();
    }

    #[test]
    fn test_initial_notification_can_settle_during_subscribe() {
        let cell = ObservableCell::new("ready", true);
        let observing = ObservingPromise::new(
            &cell,
            "ready",
            ObserveOptions::NEW | ObserveOptions::INITIAL,
            |_, change, promise: &Promise<bool>| {
                if let Some(ready) = change.new {
                    promise.resolve(ready);
                }
            },
        );
        observing.start();
        assert_eq!(observing.resolution().into_result(), Some(true));
        assert!(!observing.is_subscribed());
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn test_retry_keeps_subscription() {
        let cell = ObservableCell::new("value", 0);
        let observing = ObservingPromise::new(&cell, "value", ObserveOptions::NEW, |_, change, promise: &Promise<i32>| {
            match change.new {
                Some(value) if value < 0 => promise.reject(Error::invalid_shape("negative")),
                Some(value) if value > 2 => promise.resolve(value),
                _ => {}
            }
        })
        .promise()
        .clone()
        .with_retry_count(1);
        observing.start();
        cell.set(-1);
        assert!(observing.is_executing());
        assert_eq!(cell.subscriber_count(), 1);
        cell.set(3);
        assert_eq!(observing.resolution().into_result(), Some(3));
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn test_options_select_payload() {
        let cell = ObservableCell::new("value", 1);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        let observing = ObservingPromise::new(&cell, "value", ObserveOptions::OLD, move |_, change: &Change<i32>, _: &Promise<()>| {
            sink.lock().unwrap().push(change.clone());
        });
        observing.start();
        cell.set(2);
        assert_eq!(*changes.lock().unwrap(), vec![Change { old: Some(1), new: None }]);
        assert!(ObserveOptions::empty().contains(ObserveOptions::empty()));
        assert!(!ObserveOptions::NEW.contains(ObserveOptions::NEW | ObserveOptions::OLD));
        observing.cancel();
    }
}
