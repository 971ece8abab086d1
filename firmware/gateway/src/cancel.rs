#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// Cooperative stop handle shared between a background responder task and
/// whoever owns its lifecycle. Unlike a polled flag, `cancelled()` wakes the
/// waiter immediately even if it is parked inside a socket receive, so there
/// is no window where a stop request races a blocked wait.
pub struct CancelToken {
    requested: AtomicBool,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl CancelToken {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            signal: Signal::new(),
        }
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::Release);
        self.signal.signal(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Completes once `cancel()` has been called. Intended for one waiter.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.signal.wait().await;
    }
}
