//! Cooperative cancellation (§5 Cancellation and timeouts).
//!
//! Every blocking loop in the agent (capture, playback, the UDP receive
//! loop, the PTT poller, the tone-detection worker) checks
//! [`Shutdown::is_shutting_down`] at each iteration rather than being
//! killed outright, so a SIGINT/SIGTERM lets in-flight frames finish.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves immediately if shutdown has already been triggered,
    /// otherwise waits for the next [`Shutdown::trigger`] call.
    pub async fn wait(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.wait().await;
            })
        };
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn wait_returns_immediately_if_already_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.wait().await;
    }
}
