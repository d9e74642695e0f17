//! One-shot settleable results.
//!
//! [`promise`] returns a linked pair: the [`Promise`] settles exactly once,
//! the [`Completion`] observes the outcome either through registered
//! callbacks or by being `.await`ed from a task. Settlement is never
//! delivered synchronously inside the settling caller's stack: callbacks run
//! on a fresh task and awaiting tasks are merely woken, so no observer can
//! see partially-updated state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{Error, Result};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum State<T> {
    Pending {
        callbacks: SmallVec<[Callback<T>; 2]>,
        wakers: SmallVec<[Waker; 2]>,
    },
    Settled(Result<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// Create a linked settle/observe pair.
pub fn promise<T: Clone + Send + 'static>() -> (Promise<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending {
            callbacks: SmallVec::new(),
            wakers: SmallVec::new(),
        }),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        Completion { shared },
    )
}

/// The settling side of a one-shot result.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn succeed(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn fail(&self, error: Error) {
        self.settle(Err(error));
    }

    /// First settlement wins; later calls are no-ops.
    pub fn settle(&self, outcome: Result<T>) {
        let (callbacks, wakers) = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Settled(_) => return,
                State::Pending { callbacks, wakers } => {
                    let callbacks = std::mem::take(callbacks);
                    let wakers = std::mem::take(wakers);
                    *state = State::Settled(outcome.clone());
                    (callbacks, wakers)
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
        if !callbacks.is_empty() {
            tokio::spawn(async move {
                for callback in callbacks {
                    callback(&outcome);
                }
            });
        }
    }
}

/// The observing side of a one-shot result.
///
/// Implements [`Future`], which is what lets a task treat an asynchronous
/// completion as an apparently-synchronous call: the task suspends at
/// `.await` and the settlement wake resumes it without ever blocking the
/// runtime thread.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Run `callback` with the outcome once it exists. Registered after
    /// settlement, the callback still runs (on a fresh task) with the
    /// stored outcome.
    pub fn on_completion(&self, callback: impl FnOnce(&Result<T>) + Send + 'static) {
        let settled = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        tokio::spawn(async move {
            callback(&settled);
        });
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Settled(_))
    }

    /// The stored outcome, if already settled.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.shared.state.lock() {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }
}

impl<T: Clone + Send + 'static> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Settled(outcome) => Poll::Ready(outcome.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
