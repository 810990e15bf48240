//! Single-assignment promise with waiters and continuations.
//!
//! A [`Promise`] starts pending and moves exactly once to fulfilled or failed.
//! Interested parties either `wait().await` or register a continuation with
//! [`Promise::on_complete`]; continuations run on the thread that completes
//! the promise, after its lock has been released.

use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send>;

enum Slot<T> {
    Pending {
        waiters: Vec<oneshot::Sender<std::result::Result<T, String>>>,
        continuations: Vec<Continuation<T>>,
    },
    Fulfilled(T),
    Failed(String),
}

pub struct Promise<T> {
    name: &'static str,
    slot: Mutex<Slot<T>>,
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot::Pending {
                waiters: Vec::new(),
                continuations: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fulfill the promise. Fails with [`Error::AlreadyResolved`] if it already completed.
    pub fn fulfill(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    /// Fail the promise. Fails with [`Error::AlreadyResolved`] if it already completed.
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.complete(Err(reason.into()))
    }

    /// Fulfill if still pending. Returns whether this call completed the promise.
    pub fn try_fulfill(&self, value: T) -> bool {
        self.complete(Ok(value)).is_ok()
    }

    /// Fail if still pending. Returns whether this call completed the promise.
    pub fn try_fail(&self, reason: impl Into<String>) -> bool {
        self.complete(Err(reason.into())).is_ok()
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.lock().unwrap(), Slot::Pending { .. })
    }

    /// Current outcome without waiting. `None` while pending.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*self.slot.lock().unwrap() {
            Slot::Pending { .. } => None,
            Slot::Fulfilled(v) => Some(Ok(v.clone())),
            Slot::Failed(reason) => Some(Err(self.failure(reason.clone()))),
        }
    }

    /// Register a continuation. Runs immediately if the promise already completed.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let ready = {
            let mut slot = self.slot.lock().unwrap();
            match &mut *slot {
                Slot::Pending { continuations, .. } => {
                    continuations.push(Box::new(f));
                    return;
                }
                Slot::Fulfilled(v) => Ok(v.clone()),
                Slot::Failed(reason) => Err(self.failure(reason.clone())),
            }
        };
        f(ready);
    }

    /// Wait for the promise to complete.
    pub async fn wait(&self) -> Result<T> {
        let rx = {
            let mut slot = self.slot.lock().unwrap();
            match &mut *slot {
                Slot::Pending { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                Slot::Fulfilled(v) => return Ok(v.clone()),
                Slot::Failed(reason) => return Err(self.failure(reason.clone())),
            }
        };

        match rx.await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(reason)) => Err(self.failure(reason)),
            Err(_) => Err(self.failure("abandoned".to_string())),
        }
    }

    fn failure(&self, reason: String) -> Error {
        Error::negotiation(format!("{}: {}", self.name, reason))
    }

    fn complete(&self, outcome: std::result::Result<T, String>) -> Result<()> {
        let (waiters, continuations) = {
            let mut slot = self.slot.lock().unwrap();
            let next = match &outcome {
                Ok(v) => Slot::Fulfilled(v.clone()),
                Err(reason) => Slot::Failed(reason.clone()),
            };
            match std::mem::replace(&mut *slot, next) {
                Slot::Pending {
                    waiters,
                    continuations,
                } => (waiters, continuations),
                done => {
                    *slot = done;
                    return Err(Error::AlreadyResolved(self.name));
                }
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        for continuation in continuations {
            continuation(outcome.clone().map_err(|r| self.failure(r)));
        }
        Ok(())
    }
}
