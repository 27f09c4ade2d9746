//! Per-participant last-value-wins signaling slots.
//!
//! Every participant owns one slot. Writing to a slot replaces its value;
//! nothing is queued for readers that subscribe later. A live observer is
//! told about each change in the order it happened, so it sees intermediate
//! values as long as it is subscribed when they are written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use callfx_common::{ParticipantId, Result, SignalEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Overwrite `target`'s slot with `envelope`.
    async fn write(&self, target: &ParticipantId, envelope: &SignalEnvelope) -> Result<()>;

    /// Empty `participant`'s slot. Clearing an empty slot is a no-op.
    async fn clear(&self, participant: &ParticipantId) -> Result<()>;

    /// Follow `participant`'s slot, starting with its current value.
    async fn observe(&self, participant: &ParticipantId) -> Result<SlotWatcher>;
}

/// Stream of envelopes landing in one slot.
pub struct SlotWatcher {
    participant: ParticipantId,
    rx: mpsc::UnboundedReceiver<Option<String>>,
}

impl SlotWatcher {
    pub fn new(participant: ParticipantId, rx: mpsc::UnboundedReceiver<Option<String>>) -> Self {
        Self { participant, rx }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Next decodable envelope. Cleared slots and malformed payloads are
    /// skipped; `None` means the channel went away.
    pub async fn next(&mut self) -> Option<SignalEnvelope> {
        loop {
            let Some(value) = self.rx.recv().await? else {
                continue;
            };
            match SignalEnvelope::decode(&value) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    warn!(participant = %self.participant, error = %e, "dropping malformed envelope");
                }
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    value: Option<String>,
    observers: Vec<mpsc::UnboundedSender<Option<String>>>,
}

impl Slot {
    fn publish(&mut self, value: Option<String>) {
        self.observers.retain(|tx| tx.send(value.clone()).is_ok());
        self.value = value;
    }
}

/// In-process signaling channel. Clones share the same slots.
#[derive(Clone, Default)]
pub struct MemorySignalingChannel {
    slots: Arc<Mutex<HashMap<ParticipantId, Slot>>>,
}

impl MemorySignalingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value currently stored for `participant`.
    pub fn value(&self, participant: &ParticipantId) -> Option<String> {
        self.lock()
            .get(participant)
            .and_then(|slot| slot.value.clone())
    }

    /// Store a raw, possibly undecodable, value.
    pub fn write_raw(&self, target: &ParticipantId, value: impl Into<String>) {
        self.lock()
            .entry(target.clone())
            .or_default()
            .publish(Some(value.into()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ParticipantId, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SignalingChannel for MemorySignalingChannel {
    async fn write(&self, target: &ParticipantId, envelope: &SignalEnvelope) -> Result<()> {
        let raw = envelope.encode()?;
        debug!(target = %target, kind = ?envelope.kind, "slot write");
        self.write_raw(target, raw);
        Ok(())
    }

    async fn clear(&self, participant: &ParticipantId) -> Result<()> {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(participant) {
            if slot.value.is_some() {
                slot.publish(None);
            }
        }
        Ok(())
    }

    async fn observe(&self, participant: &ParticipantId) -> Result<SlotWatcher> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slots = self.lock();
        let slot = slots.entry(participant.clone()).or_default();
        if let Some(value) = &slot.value {
            let _ = tx.send(Some(value.clone()));
        }
        slot.observers.push(tx);
        Ok(SlotWatcher::new(participant.clone(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callfx_common::SignalKind;

    fn id(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[tokio::test]
    async fn test_late_observer_sees_only_latest_value() {
        let channel = MemorySignalingChannel::new();
        channel
            .write(&id("bob"), &SignalEnvelope::incoming_call(id("alice")))
            .await
            .unwrap();
        channel
            .write(&id("bob"), &SignalEnvelope::offer(id("alice"), "v=0"))
            .await
            .unwrap();

        let mut watcher = channel.observe(&id("bob")).await.unwrap();
        let envelope = watcher.next().await.unwrap();
        assert_eq!(envelope.kind, SignalKind::Offer);
        assert!(watcher.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_live_observer_sees_each_change_in_order() {
        let channel = MemorySignalingChannel::new();
        let mut watcher = channel.observe(&id("bob")).await.unwrap();

        channel
            .write(&id("bob"), &SignalEnvelope::offer(id("alice"), "v=0"))
            .await
            .unwrap();
        channel.clear(&id("bob")).await.unwrap();
        channel.write_raw(&id("bob"), "{garbage");
        channel
            .write(&id("bob"), &SignalEnvelope::answer(id("alice"), "v=1"))
            .await
            .unwrap();

        assert_eq!(watcher.next().await.unwrap().kind, SignalKind::Offer);
        // the clear and the garbage are skipped
        assert_eq!(watcher.next().await.unwrap().kind, SignalKind::Answer);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let channel = MemorySignalingChannel::new();
        channel.clear(&id("nobody")).await.unwrap();
        channel
            .write(&id("bob"), &SignalEnvelope::accept_call(id("alice")))
            .await
            .unwrap();
        channel.clear(&id("bob")).await.unwrap();
        channel.clear(&id("bob")).await.unwrap();
        assert_eq!(channel.value(&id("bob")), None);
    }

    #[tokio::test]
    async fn test_watcher_ends_with_channel() {
        let channel = MemorySignalingChannel::new();
        let mut watcher = channel.observe(&id("bob")).await.unwrap();
        drop(channel);
        assert!(watcher.next().await.is_none());
    }
}
