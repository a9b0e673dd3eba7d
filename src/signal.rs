//! A single-slot, auto-resetting wakeup.

use tokio::sync::Notify;
use tokio::time::Duration;

/// Wakes one waiter, coalescing repeated signals.
///
/// Signalling never blocks. If nobody is waiting, the signal is remembered
/// until the next call to [Signal::wait_until], which consumes it.
#[derive(Debug, Default)]
pub struct Signal {
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal. Has no additional effect if already set.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Waits for the signal, or for `timeout` to elapse.
    ///
    /// Returns true if the signal fired (and clears it).
    pub async fn wait_until(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn times_out_without_signal() {
        let signal = Signal::new();
        assert!(!signal.wait_until(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_signal_is_consumed_once() {
        let signal = Signal::new();
        signal.signal();
        signal.signal();
        signal.signal();

        assert!(signal.wait_until(Duration::from_millis(10)).await);
        assert!(!signal.wait_until(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_a_blocked_waiter() {
        let signal = Arc::new(Signal::new());
        let waiter = tokio::task::spawn({
            let signal = signal.clone();
            async move { signal.wait_until(Duration::from_secs(60)).await }
        });
        tokio::task::yield_now().await;
        signal.signal();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn releases_exactly_one_waiter() {
        let signal = Arc::new(Signal::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                tokio::task::spawn(async move { signal.wait_until(Duration::from_secs(1)).await })
            })
            .collect();
        tokio::task::yield_now().await;
        signal.signal();

        let mut fired = 0;
        for waiter in waiters {
            if waiter.await.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }
}
