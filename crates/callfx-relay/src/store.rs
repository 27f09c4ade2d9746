//! Slot storage shared by every relay connection.
//!
//! Participant ids are short-lived, so a slot nobody subscribes to is
//! dropped by [`SlotStore::cleanup`] once it has been idle for the
//! configured timeout.

use std::collections::HashMap;
use std::time::Duration;

use callfx_common::{ParticipantId, RelayPush};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Push queue of one connection.
pub type Outbox = mpsc::UnboundedSender<RelayPush>;

pub const DEFAULT_SLOT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("value of {len} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { len: usize, limit: usize },
    #[error("participant id must not be empty")]
    EmptyParticipant,
}

struct Slot {
    value: Option<String>,
    subscribers: HashMap<Uuid, Outbox>,
    last_activity: Instant,
}

impl Slot {
    fn new() -> Self {
        Self {
            value: None,
            subscribers: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    /// Push the current value to every subscriber, forgetting closed ones.
    fn publish(&mut self, participant: &ParticipantId) -> usize {
        let push = RelayPush::VALUE {
            participant_id: participant.clone(),
            value: self.value.clone(),
        };
        self.subscribers
            .retain(|_, outbox| outbox.send(push.clone()).is_ok());
        self.subscribers.len()
    }

    fn is_unused(&self) -> bool {
        self.value.is_none() && self.subscribers.is_empty()
    }

    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.subscribers.is_empty() && now.duration_since(self.last_activity) > idle_timeout
    }
}

/// One last-value-wins slot per participant.
pub struct SlotStore {
    slots: RwLock<HashMap<ParticipantId, Slot>>,
    max_value_bytes: usize,
    idle_timeout: Duration,
}

impl SlotStore {
    pub fn new(max_value_bytes: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            max_value_bytes,
            idle_timeout: DEFAULT_SLOT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Register `conn` for pushes on `participant` and send it the slot's
    /// current value once.
    pub async fn subscribe(
        &self,
        conn: Uuid,
        participant: ParticipantId,
        outbox: Outbox,
    ) -> Result<(), RelayError> {
        if participant.is_empty() {
            return Err(RelayError::EmptyParticipant);
        }
        let mut slots = self.slots.write().await;
        let slot = slots.entry(participant.clone()).or_insert_with(Slot::new);
        slot.last_activity = Instant::now();
        let current = RelayPush::VALUE {
            participant_id: participant,
            value: slot.value.clone(),
        };
        if outbox.send(current).is_ok() {
            slot.subscribers.insert(conn, outbox);
        }
        Ok(())
    }

    /// Overwrite the slot. Returns how many subscribers were notified.
    pub async fn write(
        &self,
        participant: ParticipantId,
        value: String,
    ) -> Result<usize, RelayError> {
        if participant.is_empty() {
            return Err(RelayError::EmptyParticipant);
        }
        if value.len() > self.max_value_bytes {
            return Err(RelayError::ValueTooLarge {
                len: value.len(),
                limit: self.max_value_bytes,
            });
        }
        let mut slots = self.slots.write().await;
        let slot = slots.entry(participant.clone()).or_insert_with(Slot::new);
        slot.value = Some(value);
        slot.last_activity = Instant::now();
        Ok(slot.publish(&participant))
    }

    /// Empty the slot. Clearing an empty slot notifies nobody.
    pub async fn clear(&self, participant: &ParticipantId) -> usize {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(participant) else {
            return 0;
        };
        if slot.value.take().is_none() {
            return 0;
        }
        slot.last_activity = Instant::now();
        let notified = slot.publish(participant);
        if slot.is_unused() {
            slots.remove(participant);
        }
        notified
    }

    /// Forget every subscription held by `conn`.
    pub async fn disconnect(&self, conn: Uuid) {
        let mut slots = self.slots.write().await;
        slots.retain(|participant, slot| {
            if slot.subscribers.remove(&conn).is_some() {
                debug!(participant = %participant, %conn, "subscription dropped");
            }
            !slot.is_unused()
        });
    }

    /// Drop slots without subscribers that saw no activity for the idle
    /// timeout. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|participant, slot| {
            let idle = slot.is_idle(now, self.idle_timeout);
            if idle && slot.value.is_some() {
                debug!(participant = %participant, "dropping stale slot value");
            }
            !idle
        });
        before - slots.len()
    }

    pub async fn value(&self, participant: &ParticipantId) -> Option<String> {
        self.slots
            .read()
            .await
            .get(participant)
            .and_then(|slot| slot.value.clone())
    }

    pub async fn subscriber_count(&self, participant: &ParticipantId) -> usize {
        self.slots
            .read()
            .await
            .get(participant)
            .map_or(0, |slot| slot.subscribers.len())
    }

    /// Number of slots currently holding a value.
    pub async fn occupied(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.value.is_some())
            .count()
    }
}
