//! Progress bus: one-to-many broadcast of job events.
//!
//! Delivery is best-effort per subscriber. A full send buffer counts as
//! a drop; enough consecutive drops mark the subscriber slow and cut it
//! off, so one stalled consumer never backs up the bus. Heartbeats
//! double as the liveness probe: two missed ACKs terminate the
//! subscriber.
//!
//! Per-job ordering holds because publishing is serialized under one
//! lock; cross-job ordering is explicitly unspecified.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::config::BusConfig;
use crate::domain::models::config::TransportKind;
use crate::domain::models::event::{ProgressEvent, SubscriptionFilter};
use crate::domain::ports::event_sink::{EventSink, SinkSendResult};

struct SubscriberEntry {
    kind: TransportKind,
    filter: SubscriptionFilter,
    sink: Box<dyn EventSink>,
    seq: u64,
    consecutive_drops: u32,
    missed_acks: u32,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<Uuid, SubscriberEntry>,
}

/// Broadcast hub between the job layer and the transports.
pub struct ProgressBus {
    state: Mutex<BusState>,
    config: BusConfig,
}

/// Public view of one subscriber, for status output.
#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub id: Uuid,
    pub kind: TransportKind,
    pub filter: SubscriptionFilter,
    pub connected_at: DateTime<Utc>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl ProgressBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register a subscriber; returns its id.
    pub fn subscribe(
        &self,
        kind: TransportKind,
        filter: SubscriptionFilter,
        sink: Box<dyn EventSink>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().expect("bus lock poisoned");
        state.subscribers.insert(
            id,
            SubscriberEntry {
                kind,
                filter,
                sink,
                seq: 0,
                consecutive_drops: 0,
                missed_acks: 0,
                connected_at: Utc::now(),
            },
        );
        tracing::debug!(subscriber = %id, kind = kind.as_str(), "subscriber connected");
        id
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self
            .state
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .remove(&id)
            .is_some();
        if removed {
            tracing::debug!(subscriber = %id, "subscriber disconnected");
        }
        removed
    }

    /// Record a heartbeat ACK from a subscriber.
    pub fn ack(&self, id: Uuid) {
        if let Some(entry) = self
            .state
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .get_mut(&id)
        {
            entry.missed_acks = 0;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .len()
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.state
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .iter()
            .map(|(&id, e)| SubscriberInfo {
                id,
                kind: e.kind,
                filter: e.filter,
                connected_at: e.connected_at,
            })
            .collect()
    }

    /// Broadcast an event to every subscriber whose filter matches.
    ///
    /// Never blocks: slow subscribers drop the event and accumulate
    /// toward disconnection instead.
    pub fn publish(&self, event: &ProgressEvent) {
        let threshold = self.config.slow_drop_threshold;
        let mut state = self.state.lock().expect("bus lock poisoned");
        let mut to_remove: Vec<Uuid> = Vec::new();

        for (&id, entry) in &mut state.subscribers {
            if !entry.filter.matches(event) {
                continue;
            }
            let mut delivered = event.clone();
            delivered.seq = entry.seq;
            match entry.sink.try_send(delivered) {
                SinkSendResult::Accepted => {
                    entry.seq += 1;
                    entry.consecutive_drops = 0;
                }
                SinkSendResult::Full => {
                    entry.consecutive_drops += 1;
                    tracing::warn!(
                        subscriber = %id,
                        drops = entry.consecutive_drops,
                        "subscriber buffer full, event dropped"
                    );
                    if entry.consecutive_drops >= threshold {
                        to_remove.push(id);
                    }
                }
                SinkSendResult::Closed => to_remove.push(id),
            }
        }

        for id in to_remove {
            state.subscribers.remove(&id);
            tracing::warn!(subscriber = %id, "slow or closed subscriber removed");
        }
    }

    /// One heartbeat round: ping everyone, terminate subscribers that
    /// have missed two consecutive ACKs.
    pub fn heartbeat_tick(&self) {
        // Collect the dead before pinging so this round's ping isn't
        // counted against the subscriber yet.
        let dead: Vec<Uuid> = {
            let mut state = self.state.lock().expect("bus lock poisoned");
            let mut dead = Vec::new();
            for (&id, entry) in &mut state.subscribers {
                if entry.missed_acks >= 2 {
                    dead.push(id);
                } else {
                    entry.missed_acks += 1;
                }
            }
            for id in &dead {
                state.subscribers.remove(id);
                tracing::warn!(subscriber = %id, "subscriber missed heartbeats, terminated");
            }
            dead
        };
        drop(dead);

        self.publish(&ProgressEvent::heartbeat());
    }

    /// Drive heartbeats until cancelled. Spawn once per bus.
    pub async fn run_heartbeat_loop(&self, cancel: CancellationToken) {
        let interval = std::time::Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh bus does
        // not ping before anyone can have subscribed.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_tick(),
            }
        }
    }
}
