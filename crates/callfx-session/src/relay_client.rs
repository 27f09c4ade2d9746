//! [`SignalingChannel`] backed by a `callfx-relay` server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use callfx_common::{
    Error, ParticipantId, RelayPush, RelayRequest, Result, SignalEnvelope, MAX_RELAY_VALUE_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::signaling::{SignalingChannel, SlotWatcher};

#[derive(Default)]
struct Subscription {
    value: Option<String>,
    observers: Vec<mpsc::UnboundedSender<Option<String>>>,
}

type Subscriptions = Arc<Mutex<HashMap<ParticipantId, Subscription>>>;

/// WebSocket client for the relay.
///
/// Losing the connection ends every watcher; there is no reconnect.
pub struct RelaySignalingChannel {
    outgoing: mpsc::UnboundedSender<RelayRequest>,
    subscriptions: Subscriptions,
    closed: Arc<AtomicBool>,
}

impl RelaySignalingChannel {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await.map_err(Error::signaling)?;
        info!("Connected to signaling relay: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut requests) = mpsc::unbounded_channel::<RelayRequest>();
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode relay request: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("Failed to send relay request: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let routes = subscriptions.clone();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<RelayPush>(&text) {
                        Ok(RelayPush::VALUE {
                            participant_id,
                            value,
                        }) => dispatch(&routes, participant_id, value),
                        Ok(RelayPush::ERROR { message }) => {
                            warn!("Relay rejected request: {}", message);
                        }
                        Err(e) => warn!("Failed to parse relay push: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        error!("Relay WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            debug!("relay connection closed");
            reader_closed.store(true, Ordering::SeqCst);
            routes.lock().unwrap_or_else(|e| e.into_inner()).clear();
        });

        Ok(Self {
            outgoing,
            subscriptions,
            closed,
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.outgoing.is_closed()
    }

    fn request(&self, request: RelayRequest) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::signaling("relay connection closed"));
        }
        self.outgoing
            .send(request)
            .map_err(|_| Error::signaling("relay connection closed"))
    }
}

fn dispatch(routes: &Subscriptions, participant: ParticipantId, value: Option<String>) {
    let mut routes = routes.lock().unwrap_or_else(|e| e.into_inner());
    let Some(subscription) = routes.get_mut(&participant) else {
        debug!(participant = %participant, "push for unknown subscription");
        return;
    };
    subscription
        .observers
        .retain(|tx| tx.send(value.clone()).is_ok());
    subscription.value = value;
}

#[async_trait]
impl SignalingChannel for RelaySignalingChannel {
    async fn write(&self, target: &ParticipantId, envelope: &SignalEnvelope) -> Result<()> {
        let value = envelope.encode()?;
        if value.len() > MAX_RELAY_VALUE_BYTES {
            return Err(Error::signaling(format!(
                "envelope of {} bytes exceeds relay limit",
                value.len()
            )));
        }
        self.request(RelayRequest::WRITE {
            participant_id: target.clone(),
            value,
        })
    }

    async fn clear(&self, participant: &ParticipantId) -> Result<()> {
        self.request(RelayRequest::CLEAR {
            participant_id: participant.clone(),
        })
    }

    async fn observe(&self, participant: &ParticipantId) -> Result<SlotWatcher> {
        if !self.is_connected() {
            return Err(Error::signaling("relay connection closed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            match subscriptions.get_mut(participant) {
                Some(subscription) => {
                    if let Some(value) = &subscription.value {
                        let _ = tx.send(Some(value.clone()));
                    }
                    subscription.observers.push(tx);
                    false
                }
                None => {
                    subscriptions.insert(
                        participant.clone(),
                        Subscription {
                            value: None,
                            observers: vec![tx],
                        },
                    );
                    true
                }
            }
        };
        // the relay answers a subscribe with the slot's current value
        if first {
            self.request(RelayRequest::SUBSCRIBE {
                participant_id: participant.clone(),
            })?;
        }
        Ok(SlotWatcher::new(participant.clone(), rx))
    }
}
