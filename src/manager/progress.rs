//! Periodic build-progress broadcasting.
//!
//! The build worker feeds phase updates into the tracker; every tick the
//! tracker pushes a snapshot of the current build to each subscribed
//! listener. A listener is a bounded channel whose receiving end backs a
//! streaming response: when the client goes away the channel closes and
//! the listener is dropped on the next tick, so nothing further is sent.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;

const LISTENER_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct BuildPhase {
    pub name: String,
    pub completion_percentage: f64,
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildProgress {
    pub index_name: String,
    pub phases: Vec<BuildPhase>,
}

pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    current: RwLock<Option<BuildProgress>>,
    listeners: Mutex<Vec<mpsc::Sender<BuildProgress>>>,
}

impl ProgressTracker {
    pub fn new(period: Duration) -> Self {
        let inner = Arc::new(TrackerInner {
            current: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        });

        let weak: Weak<TrackerInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.broadcast();
            }
        });

        Self { inner }
    }

    /// Register a listener; the receiver closes when the client cancels.
    pub fn subscribe(&self) -> mpsc::Receiver<BuildProgress> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        self.inner.listeners.lock().push(tx);
        rx
    }

    /// Called by the build worker when a build starts.
    pub fn begin(&self, index_name: &str, phase_names: &[&str]) {
        let phases = phase_names
            .iter()
            .map(|name| BuildPhase {
                name: (*name).to_string(),
                completion_percentage: 0.0,
                parameters: Vec::new(),
            })
            .collect();
        *self.inner.current.write() = Some(BuildProgress {
            index_name: index_name.to_string(),
            phases,
        });
    }

    /// Update one phase of the current build.
    pub fn update(&self, phase_name: &str, completion_percentage: f64, parameters: &[String]) {
        let mut current = self.inner.current.write();
        if let Some(progress) = current.as_mut() {
            if let Some(phase) = progress.phases.iter_mut().find(|p| p.name == phase_name) {
                phase.completion_percentage = completion_percentage.clamp(0.0, 100.0);
                phase.parameters = parameters.to_vec();
            }
        }
    }

    /// Called by the build worker when the build ends, successfully or not.
    pub fn finish(&self) {
        *self.inner.current.write() = None;
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Option<BuildProgress> {
        self.inner.current.read().clone()
    }
}

impl TrackerInner {
    fn broadcast(&self) {
        let snapshot = self.current.read().clone();

        let mut listeners = self.listeners.lock();
        // Cancelled clients drop their receiver; prune them even between
        // builds so the listener list cannot grow without bound.
        listeners.retain(|tx| !tx.is_closed());

        let Some(snapshot) = snapshot else {
            return;
        };
        listeners.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_begin_update_finish() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.begin("a", &["first", "second"]);
        tracker.update("second", 42.0, &["param=1".to_string()]);

        let snapshot = tracker.snapshot().unwrap();
        assert_eq!(snapshot.index_name, "a");
        assert_eq!(snapshot.phases.len(), 2);
        assert_eq!(snapshot.phases[0].completion_percentage, 0.0);
        assert_eq!(snapshot.phases[1].completion_percentage, 42.0);
        assert_eq!(snapshot.phases[1].parameters, vec!["param=1".to_string()]);

        tracker.finish();
        assert!(tracker.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_update_clamps_percentage() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.begin("a", &["phase"]);
        tracker.update("phase", 250.0, &[]);
        assert_eq!(
            tracker.snapshot().unwrap().phases[0].completion_percentage,
            100.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_receives_ticks_and_self_removes() {
        let tracker = ProgressTracker::new(Duration::from_millis(10));
        let mut rx = tracker.subscribe();

        tracker.begin("a", &["phase"]);
        tokio::time::advance(Duration::from_millis(25)).await;

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.index_name, "a");

        // Client cancellation: drop the receiver, the next tick prunes it.
        drop(rx);
        for _ in 0..100 {
            tokio::time::advance(Duration::from_millis(15)).await;
            tokio::task::yield_now().await;
            if tracker.inner.listeners.lock().is_empty() {
                break;
            }
        }
        assert_eq!(tracker.inner.listeners.lock().len(), 0);
    }
}
