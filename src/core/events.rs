// src/core/events.rs

//! The typed event bus: the kernel's one-to-many notification hub. Every
//! subscriber (the admin API, remote-access manager, app lifecycle manager,
//! control store follower poller) gets its own bounded channel so a slow
//! subscriber can never block a publisher.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::core::cluster::{ResourceId, Role};

/// Default per-subscriber channel depth. Generous enough to absorb a burst of
/// commits without every consumer having to keep pace in lock-step.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    LeadershipRoleChanged,
    LockStateChanged,
    VolumeStateChanged,
    ControlCommit,
    ControlHealth,
    RemoteConfigChanged,
}

#[derive(Debug, Clone)]
pub struct LeadershipRoleChangedEvent {
    pub resource_id: ResourceId,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct LockStateChangedEvent {
    pub locked: bool,
}

#[derive(Debug, Clone)]
pub struct VolumeStateChangedEvent {
    pub volume_id: String,
    pub needs_repair: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ControlCommitEvent {
    pub table: String,
    pub revision: u64,
}

#[derive(Debug, Clone)]
pub struct ControlHealthEvent {
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteConfigChangedEvent {
    pub revision: u64,
}

/// One envelope per topic; carries that topic's payload so subscribers do not
/// need to special-case absent fields.
#[derive(Debug, Clone)]
pub enum Event {
    LeadershipRoleChanged(LeadershipRoleChangedEvent),
    LockStateChanged(LockStateChangedEvent),
    VolumeStateChanged(VolumeStateChangedEvent),
    ControlCommit(ControlCommitEvent),
    ControlHealth(ControlHealthEvent),
    RemoteConfigChanged(RemoteConfigChangedEvent),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::LeadershipRoleChanged(_) => Topic::LeadershipRoleChanged,
            Event::LockStateChanged(_) => Topic::LockStateChanged,
            Event::VolumeStateChanged(_) => Topic::VolumeStateChanged,
            Event::ControlCommit(_) => Topic::ControlCommit,
            Event::ControlHealth(_) => Topic::ControlHealth,
            Event::RemoteConfigChanged(_) => Topic::RemoteConfigChanged,
        }
    }
}

pub type EventReceiver = mpsc::Receiver<Event>;

struct Subscription {
    topic: Topic,
    sender: mpsc::Sender<Event>,
}

/// Central distribution hub for kernel-internal events. Mirrors the shape of
/// a single-writer, many-reader broadcast, but uses one bounded mpsc channel
/// per subscriber rather than a shared broadcast ring, so that a subscriber
/// lagging on one topic cannot cause others to miss events on a different
/// topic.
#[derive(Default)]
pub struct EventBus {
    subscriptions: parking_lot::Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Registers a new subscriber for `topic`, returning the receiving half.
    pub fn subscribe(&self, topic: Topic) -> EventReceiver {
        self.subscribe_with_capacity(topic, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> EventReceiver {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscriptions.lock().push(Subscription { topic, sender: tx });
        rx
    }

    /// Publishes `event` to every subscriber registered for its topic. Never
    /// blocks: a full subscriber channel drops the newest event and logs a
    /// warning rather than stalling the publisher or other subscribers.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let mut subs = self.subscriptions.lock();
        subs.retain(|sub| {
            if sub.topic != topic {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(?topic, "event subscriber is full, dropping newest event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_topic_only() {
        let bus = EventBus::new();
        let mut lock_rx = bus.subscribe(Topic::LockStateChanged);
        let mut commit_rx = bus.subscribe(Topic::ControlCommit);

        bus.publish(Event::LockStateChanged(LockStateChangedEvent { locked: true }));

        let received = lock_rx.try_recv().expect("lock subscriber should see event");
        assert!(matches!(received, Event::LockStateChanged(e) if e.locked));
        assert!(commit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_drops_newest_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_with_capacity(Topic::ControlHealth, 1);
        bus.publish(Event::ControlHealth(ControlHealthEvent { ok: true, detail: None }));
        // Second publish should be dropped silently (channel full), not panic or block.
        bus.publish(Event::ControlHealth(ControlHealthEvent { ok: false, detail: None }));

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Event::ControlHealth(e) if e.ok));
        assert!(rx.try_recv().is_err());
    }
}
