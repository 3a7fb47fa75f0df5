//! Chainable, retryable promises for client-side asynchronous work.
//!
//! A [`Promise`] is a unit of work that runs a routine and eventually settles
//! to a result, an error, or a cancellation. Promises are submitted to a
//! [`Scheduler`], which starts them once everything they depend on has
//! settled. Continuations such as [`Promise::then`] and
//! [`Promise::on_success`] build the next unit of work from the outcome of
//! the previous one. A failing promise can retry itself, optionally after a
//! delay, before it settles with its last error.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{Promise, Resolution, Scheduler};
//! use futures::executor::block_on;
//!
//! let scheduler = Scheduler::new().unwrap();
//! let first = Promise::new(|promise: &Promise<i32>| promise.resolve(20)).await_on(&scheduler);
//! let source = first.clone();
//! let second = first.on_success(&scheduler, move |_| {
//!     Promise::new(move |promise: &Promise<i32>| {
//!         let value = source.resolution().into_result().unwrap();
//!         promise.resolve(value + 22);
//!     })
//! });
//! assert_eq!(block_on(second.settled()).into_result(), Some(42));
//! ```
use std::io;
use std::sync::Arc;

pub mod continuation;
pub mod observe;
pub mod operation;
pub mod progress;
pub mod promise;
pub mod resolution;
pub mod scheduler;

pub use continuation::{when_all, when_all_do, when_all_do_on_main, when_all_on_main};
pub use observe::{
    Change, Context, Handler, Notification, ObjectId, Observable, ObservableCell, ObserveOptions,
    ObservingBuilder, ObservingPromise, Subscription,
};
pub use operation::{
    BlockOperation, ExecutionState, Observation, Observer, Operation, Phase, Property, StateMachine,
};
pub use progress::Progress;
pub use promise::{Promise, Settled, WeakPromise};
pub use resolution::Resolution;
pub use scheduler::{Scheduler, SchedulerConfig, SerialQueue, TimerHandle};

/// Errors carried by [`Resolution::Error`] and returned by the scheduler.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The routine failed.
    #[error("{0}")]
    Execution(String),
    /// A data source produced neither a result nor an error.
    #[error("the data source produced neither a result nor an error")]
    MissingData,
    /// A result failed a structural check.
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: Arc<io::Error>,
    },
}

impl Error {
    pub fn execution<M: Into<String>>(message: M) -> Self {
        Error::Execution(message.into())
    }

    pub fn invalid_shape<M: Into<String>>(message: M) -> Self {
        Error::InvalidShape(message.into())
    }

    pub fn custom<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Custom(Arc::new(err))
    }

    pub(crate) fn spawn(name: String, source: io::Error) -> Self {
        Error::Spawn {
            name,
            source: Arc::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::error::Error as _;

    #[derive(Debug, thiserror::Error)]
    #[error("teapot")]
    struct Teapot;

    #[test]
    fn test_custom_error_is_transparent() {
        let err = Error::custom(Teapot);
        assert_eq!(err.to_string(), "teapot");
        assert_eq!(err.clone().to_string(), "teapot");
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        let err = Error::spawn("w-0".into(), std::io::Error::new(std::io::ErrorKind::Other, "no threads"));
        assert_eq!(err.to_string(), "failed to spawn thread `w-0`");
        assert_eq!(err.source().unwrap().to_string(), "no threads");
    }
}
