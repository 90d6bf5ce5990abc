//! Single-assignment asynchronous results.
//!
//! A [`Deferred`] is the consumer half of an operation that completes later
//! on the reactor thread owning the relevant descriptor; the [`Completer`] is
//! the producer half stashed alongside the parked operation. Exactly one of
//! `resolve` / `reject` is ever called, and consuming `self` enforces it at
//! the type level. Continuations run on whichever thread completes the
//! operation and must not block; further asynchronous work returns a new
//! `Deferred`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

type Callback<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

enum Slot<T> {
    Pending(Option<Callback<T>>),
    /// Completed, value waiting for a blocking consumer.
    Done(Option<Result<T, Error>>),
    /// Value delivered to a continuation, consumed by `wait`, or abandoned.
    Finished,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Create a linked deferred/completer pair.
pub fn deferred<T: Send + 'static>() -> (Deferred<T>, Completer<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(Slot::Pending(None)),
        cond: Condvar::new(),
    });
    (
        Deferred {
            inner: inner.clone(),
        },
        Completer { inner: Some(inner) },
    )
}

/// Consumer half: attach a continuation or block until completion.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Deferred<T> {
    /// Run `f` with the outcome. Invoked immediately if already complete,
    /// otherwise later on the completing thread. Dropped without being called
    /// if the producer abandons the operation.
    pub fn then<F>(self, f: F)
    where
        F: FnOnce(Result<T, Error>) + Send + 'static,
    {
        let mut f = Some(f);
        let ready = {
            let mut slot = self.inner.slot.lock().unwrap();
            match &mut *slot {
                Slot::Pending(cb) => {
                    *cb = Some(Box::new(f.take().expect("continuation consumed")));
                    None
                }
                Slot::Done(value) => {
                    let value = value.take();
                    *slot = Slot::Finished;
                    value
                }
                Slot::Finished => None,
            }
        };
        if let Some(value) = ready {
            if let Some(f) = f.take() {
                f(value);
            }
        }
    }

    /// Block until completion or `timeout`. `None` means the operation is
    /// still pending (or was abandoned). Intended for callers outside the
    /// reactor; never call this from a reactor thread.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, Error>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock().unwrap();
        loop {
            match &mut *slot {
                Slot::Done(value) => {
                    let value = value.take();
                    *slot = Slot::Finished;
                    return value;
                }
                Slot::Finished => return None,
                Slot::Pending(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .inner
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
            if result.timed_out() {
                match &mut *slot {
                    Slot::Done(value) => {
                        let value = value.take();
                        *slot = Slot::Finished;
                        return value;
                    }
                    _ => return None,
                }
            }
        }
    }
}

/// Producer half. Exactly one of `resolve` / `reject` is called; dropping an
/// incomplete completer abandons the operation, silently waking any blocked
/// waiter with no value.
pub struct Completer<T> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T: Send + 'static> Completer<T> {
    pub fn resolve(mut self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(mut self, error: Error) {
        self.complete(Err(error));
    }

    fn complete(&mut self, value: Result<T, Error>) {
        let inner = match self.inner.take() {
            Some(inner) => inner,
            None => return,
        };
        let callback = {
            let mut slot = inner.slot.lock().unwrap();
            match &mut *slot {
                Slot::Pending(cb) => match cb.take() {
                    Some(cb) => {
                        *slot = Slot::Finished;
                        Some((cb, value))
                    }
                    None => {
                        *slot = Slot::Done(Some(value));
                        inner.cond.notify_all();
                        None
                    }
                },
                // Single assignment: a second completion is unreachable
                // because `resolve`/`reject` consume the completer.
                _ => None,
            }
        };
        if let Some((cb, value)) = callback {
            cb(value);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut slot = inner.slot.lock().unwrap();
            if matches!(*slot, Slot::Pending(_)) {
                *slot = Slot::Finished;
                inner.cond.notify_all();
            }
        }
    }
}
