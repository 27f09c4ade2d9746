//! WebSocket front end of the relay.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use callfx_common::{RelayPush, RelayRequest};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{Outbox, SlotStore};
use crate::RelayServerConfig;

#[derive(Debug, Default)]
pub struct RelayStats {
    pub connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub writes: AtomicU64,
    pub clears: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub active_connections: u64,
    pub writes: u64,
    pub clears: u64,
    pub rejected: u64,
    pub expired: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<SlotStore>,
    pub stats: Arc<RelayStats>,
    pub config: Arc<RelayServerConfig>,
}

impl RelayState {
    pub fn new(config: RelayServerConfig) -> Self {
        Self {
            store: Arc::new(
                SlotStore::new(config.max_value_bytes).with_idle_timeout(config.slot_idle_timeout),
            ),
            stats: Arc::new(RelayStats::default()),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(|| async { "callfx relay online" }))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    serve_with_shutdown(listener, state, std::future::pending()).await
}

pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: RelayState,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("relay listening on {}", listener.local_addr()?);
    let cleanup = tokio::spawn(run_cleanup(state.clone()));
    let result = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    cleanup.abort();
    result
}

async fn run_cleanup(state: RelayState) {
    let period = state.config.cleanup_interval.max(Duration::from_millis(1));
    let mut cleanup_interval = tokio::time::interval(period);
    loop {
        cleanup_interval.tick().await;
        let cleaned = state.store.cleanup().await;
        if cleaned > 0 {
            state.stats.expired.fetch_add(cleaned as u64, Ordering::Relaxed);
            info!("Cleaned up {} idle slots", cleaned);
        }
    }
}

async fn health(State(state): State<RelayState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let limit = state.config.max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

fn reject(tx: &Outbox, message: impl Into<String>) {
    let _ = tx.send(RelayPush::ERROR {
        message: message.into(),
    });
}

async fn handle_socket(stream: WebSocket, state: RelayState, addr: SocketAddr) {
    let conn = Uuid::new_v4();
    state.stats.connections.fetch_add(1, Ordering::Relaxed);
    state.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    info!("client {} connected from {}", conn, addr);

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayPush>();
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(push) = rx.recv().await {
            let text = match serde_json::to_string(&push) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode relay push: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("websocket error from {}: {}", addr, e);
                        break;
                    }
                };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        reject(&tx, "Binary messages are not supported");
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let request: RelayRequest = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!("invalid JSON from {}: {}", addr, err);
                        reject(&tx, "Invalid JSON");
                        break;
                    }
                };

                handle_request(&state, conn, &tx, request).await;
            }
        }
    }

    state.store.disconnect(conn).await;
    state
        .stats
        .active_connections
        .fetch_sub(1, Ordering::Relaxed);
    info!("client {} disconnected", conn);
}

async fn handle_request(state: &RelayState, conn: Uuid, tx: &Outbox, request: RelayRequest) {
    match request {
        RelayRequest::SUBSCRIBE { participant_id } => {
            debug!(participant = %participant_id, %conn, "subscribe");
            if let Err(e) = state.store.subscribe(conn, participant_id, tx.clone()).await {
                state.stats.rejected.fetch_add(1, Ordering::Relaxed);
                reject(tx, e.to_string());
            }
        }
        RelayRequest::WRITE {
            participant_id,
            value,
        } => match state.store.write(participant_id.clone(), value).await {
            Ok(notified) => {
                state.stats.writes.fetch_add(1, Ordering::Relaxed);
                debug!(participant = %participant_id, notified, "slot written");
            }
            Err(e) => {
                state.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(participant = %participant_id, "write rejected: {}", e);
                reject(tx, e.to_string());
            }
        },
        RelayRequest::CLEAR { participant_id } => {
            let notified = state.store.clear(&participant_id).await;
            state.stats.clears.fetch_add(1, Ordering::Relaxed);
            debug!(participant = %participant_id, notified, "slot cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callfx_common::ParticipantId;

    #[tokio::test]
    async fn test_oversize_write_counts_as_rejected() {
        let state = RelayState::new(RelayServerConfig {
            max_value_bytes: 4,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_request(
            &state,
            Uuid::new_v4(),
            &tx,
            RelayRequest::WRITE {
                participant_id: ParticipantId::from("bob"),
                value: "too long".into(),
            },
        )
        .await;

        assert!(matches!(rx.recv().await, Some(RelayPush::ERROR { .. })));
        let stats = state.stats.snapshot();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.writes, 0);
    }

    #[tokio::test]
    async fn test_write_then_subscribe_over_requests() {
        let state = RelayState::new(RelayServerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        let bob = ParticipantId::from("bob");

        handle_request(
            &state,
            conn,
            &tx,
            RelayRequest::WRITE {
                participant_id: bob.clone(),
                value: "hello".into(),
            },
        )
        .await;
        handle_request(
            &state,
            conn,
            &tx,
            RelayRequest::SUBSCRIBE {
                participant_id: bob.clone(),
            },
        )
        .await;

        assert_eq!(
            rx.recv().await,
            Some(RelayPush::VALUE {
                participant_id: bob,
                value: Some("hello".into()),
            })
        );
        assert_eq!(state.stats.snapshot().writes, 1);
    }
}
