//! Notification primitives for the cooperative commit pipeline.
//!
//! `NotifiedVersion` is a monotonically increasing version with waiters:
//! commit chains serialize on `when_at_least(prev_version)`, peek waiters
//! block on it, and the queue-commit loop watches it advance. `Trigger` is a
//! pulse: it wakes whoever is currently waiting and leaves no residue.

use tokio::sync::{watch, Notify};

use tidelog_core::Version;

/// A version number that tasks can wait on.
///
/// Values only move forward. Waiters registered via
/// [`when_at_least`](Self::when_at_least) observe a non-decreasing sequence.
#[derive(Debug)]
pub struct NotifiedVersion {
    tx: watch::Sender<Version>,
}

impl NotifiedVersion {
    /// Creates a notified version starting at `initial`.
    #[must_use]
    pub fn new(initial: Version) -> Self {
        Self { tx: watch::Sender::new(initial) }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> Version {
        *self.tx.borrow()
    }

    /// Advances the value, waking waiters at or below `version`.
    ///
    /// # Panics
    ///
    /// Panics if `version` would move the value backwards.
    pub fn set(&self, version: Version) {
        self.tx.send_modify(|current| {
            assert!(version >= *current, "notified version moved backwards: {version} < {current}");
            *current = version;
        });
    }

    /// Resolves once the value is at least `version`.
    pub async fn when_at_least(&self, version: Version) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed
        // channel while we hold &self.
        let _ = rx.wait_for(|current| *current >= version).await;
    }
}

/// A level-less pulse: wakes current waiters only.
#[derive(Debug, Default)]
pub struct Trigger {
    notify: Notify,
}

impl Trigger {
    /// Creates an idle trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every task currently inside [`triggered`](Self::triggered).
    pub fn trigger(&self) {
        self.notify.notify_waiters();
    }

    /// Waits for the next pulse.
    pub async fn triggered(&self) {
        self.notify.notified().await;
    }
}

/// A one-way boolean that tasks can wait to see set, optionally with an
/// error outcome. Used for recovery-complete and committing handshakes.
#[derive(Debug)]
pub struct Flag {
    tx: watch::Sender<Option<bool>>,
}

impl Flag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self { tx: watch::Sender::new(None) }
    }

    /// Whether the flag has been resolved at all.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves the flag successfully. Later calls are ignored.
    pub fn set(&self) {
        self.resolve(true);
    }

    /// Resolves the flag as failed. Later calls are ignored.
    pub fn fail(&self) {
        self.resolve(false);
    }

    fn resolve(&self, outcome: bool) {
        self.tx.send_if_modified(|v| {
            if v.is_some() {
                return false;
            }
            *v = Some(outcome);
            true
        });
    }

    /// Waits for resolution; returns `true` on success.
    pub async fn wait(&self) -> bool {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => (*value).unwrap_or(false),
            Err(_) => false,
        };
        result
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn when_at_least_wakes_in_order() {
        let version = Arc::new(NotifiedVersion::new(0));
        let v = version.clone();
        let waiter = tokio::spawn(async move {
            v.when_at_least(10).await;
            v.get()
        });

        tokio::task::yield_now().await;
        version.set(5);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        version.set(10);
        assert_eq!(waiter.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn when_at_least_returns_immediately_if_satisfied() {
        let version = NotifiedVersion::new(7);
        version.when_at_least(3).await;
    }

    #[tokio::test]
    #[should_panic(expected = "moved backwards")]
    async fn set_rejects_regression() {
        let version = NotifiedVersion::new(5);
        version.set(4);
    }

    #[tokio::test]
    async fn trigger_wakes_current_waiters() {
        let trigger = Arc::new(Trigger::new());
        let t = trigger.clone();
        let waiter = tokio::spawn(async move { t.triggered().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.trigger();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn flag_resolves_once() {
        let flag = Arc::new(Flag::new());
        let f = flag.clone();
        let waiter = tokio::spawn(async move { f.wait().await });
        tokio::task::yield_now().await;

        flag.set();
        flag.fail();
        assert!(waiter.await.unwrap());
        assert!(flag.is_set());
    }
}
