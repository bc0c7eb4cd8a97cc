//! Engine events broadcast to subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::types::{FailureKind, HealthClass, TriggerKind};

/// Capacity of the event channel; slow subscribers lag and lose the oldest events.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecoveryEvent {
    RecoveryStarted {
        attempt_id: String,
        trigger: TriggerKind,
        component: String,
        strategy_id: String,
        forced: bool,
    },
    RecoveryCompleted {
        attempt_id: String,
        component: String,
        strategy_id: String,
        duration_ms: u64,
    },
    RecoveryFailed {
        attempt_id: String,
        component: String,
        failure: Option<FailureKind>,
        error: String,
    },
    RecoveryRejected {
        trigger: TriggerKind,
        component: String,
        reason: String,
    },
    PatternUpdated {
        pattern_id: String,
        confidence: f64,
        occurrences: u64,
    },
    BackupCreated {
        backup_id: String,
        component: String,
    },
    BackupRestored {
        backup_id: String,
        component: String,
    },
    IntegrityScanned {
        total: usize,
        corrupted: usize,
        missing: usize,
        corruption_percentage: f64,
    },
    HealthChanged {
        component: String,
        from: Option<HealthClass>,
        to: HealthClass,
    },
    FailureRateAlert {
        failure_rate: f64,
        window: usize,
    },
    ShutdownStarted,
    ShutdownCompleted {
        forced: usize,
    },
}

/// Fan-out of [`RecoveryEvent`]s. Emitting with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RecoveryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: RecoveryEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(RecoveryEvent::ShutdownStarted);
        bus.emit(RecoveryEvent::ShutdownCompleted { forced: 2 });
        assert_eq!(rx.recv().await.unwrap(), RecoveryEvent::ShutdownStarted);
        assert_eq!(
            rx.recv().await.unwrap(),
            RecoveryEvent::ShutdownCompleted { forced: 2 }
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(RecoveryEvent::ShutdownStarted);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(RecoveryEvent::BackupCreated {
            backup_id: "b1".into(),
            component: "db".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "backup_created");
        assert_eq!(json["component"], "db");
    }
}
