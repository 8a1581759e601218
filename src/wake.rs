use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Poll, Waker},
};

use futures::future::poll_fn;

/// A set of parked wakers, woken together on a state transition.
#[derive(Clone, Default)]
pub(crate) struct WakerSet(Arc<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub fn wake_all(&self) {
        for waker in self.0.lock().drain(..) {
            waker.wake();
        }
    }
}

/// One-slot level-triggered signal: `signal()` releases the next `wait()`.
#[derive(Clone)]
pub(crate) struct AsyncSignal {
    waker: Arc<Mutex<Option<Waker>>>,
    signaled: Arc<AtomicBool>,
}

impl AsyncSignal {
    pub fn new() -> Self {
        Self {
            waker: Arc::new(Mutex::new(None)),
            signaled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.signaled.swap(false, Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                *self.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        if let Some(w) = self.waker.lock().take() {
            w.wake();
        }
    }
}
