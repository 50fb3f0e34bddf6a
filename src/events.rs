//! Cluster event bus.
//!
//! Decouples the replication manager from command delivery: the manager
//! fires events, datanode dispatch loops (or tests) subscribe and forward
//! them. Delivery is asynchronous and the bus never blocks the publisher.

use crate::replication::CommandEnvelope;
use crate::types::ContainerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Events published by the replication manager.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// Request to close a container, handled by the container state machine.
    CloseContainer(ContainerId),
    /// A command addressed to a single datanode.
    DatanodeCommand(CommandEnvelope),
}

/// Event bus statistics.
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    /// Total events published.
    pub events_published: u64,
    /// Events published while no subscriber was listening.
    pub events_unobserved: u64,
}

struct EventBusStatsInner {
    events_published: AtomicU64,
    events_unobserved: AtomicU64,
}

/// The event bus.
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
    stats: EventBusStatsInner,
}

impl EventBus {
    /// Create a new bus buffering up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender,
            stats: EventBusStatsInner {
                events_published: AtomicU64::new(0),
                events_unobserved: AtomicU64::new(0),
            },
        })
    }

    /// Publish an event. Never blocks; events fired with no subscribers are
    /// counted and dropped.
    pub fn fire(&self, event: ClusterEvent) {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        debug!(event = ?event, "Event fired");
        if self.sender.send(event).is_err() {
            self.stats.events_unobserved.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    /// Current statistics.
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_unobserved: self.stats.events_unobserved.load(Ordering::Relaxed),
        }
    }
}
