//! New-Data Notifier
//!
//! Writers call [`Notifier::signal_new_data`] after persisting rows; the poke
//! loop waits on [`Notifier::wait_for_new_data`]. A signal raised while no
//! one is waiting is kept as a single permit, so the next wait returns
//! immediately and no wake-up is lost. Signals raised back to back collapse
//! into one, which is fine because a single poke pass reads everything up to
//! the current tokens.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Wake-up channel between writers and the poke loop
#[derive(Debug, Default)]
pub struct Notifier {
    notify: Notify,
    signals: AtomicU64,
}

impl Notifier {
    /// Create a notifier with no pending signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce that new rows may be available
    pub fn signal_new_data(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Wait until a signal arrives (or consume a stored one)
    pub async fn wait_for_new_data(&self) {
        self.notify.notified().await;
    }

    /// Total signals raised since creation
    pub fn signal_count(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_signal_before_wait_is_kept() {
        let notifier = Notifier::new();
        notifier.signal_new_data();

        tokio::time::timeout(Duration::from_secs(1), notifier.wait_for_new_data())
            .await
            .expect("stored signal should wake the waiter");
        assert_eq!(notifier.signal_count(), 1);
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let notifier = Arc::new(Notifier::new());
        let waiter = {
            let notifier = Arc::clone(&notifier);
            tokio::spawn(async move { notifier.wait_for_new_data().await })
        };

        tokio::task::yield_now().await;
        notifier.signal_new_data();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_signals_collapse() {
        let notifier = Notifier::new();
        notifier.signal_new_data();
        notifier.signal_new_data();

        let mut first = task::spawn(notifier.wait_for_new_data());
        assert_ready!(first.poll());

        let mut second = task::spawn(notifier.wait_for_new_data());
        assert_pending!(second.poll());

        notifier.signal_new_data();
        assert!(second.is_woken());
        assert_ready!(second.poll());
        assert_eq!(notifier.signal_count(), 3);
    }
}
