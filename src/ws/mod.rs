use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::models::{ApplyResult, FeatureArea, Instance, Operation};
use crate::session::SessionState;

/// Event types for WebSocket messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstanceRegistered,
    InstanceRemoved,
    SessionStateChanged,
    IntentApplied,
    IntentFailed,
}

/// WebSocket event message
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstancePayload {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatePayload {
    pub instance_id: String,
    pub state: SessionState,
}

/// Payload for intent outcome events
#[derive(Debug, Clone, Serialize)]
pub struct IntentPayload {
    pub instance_id: String,
    pub feature_area: FeatureArea,
    pub operation: Operation,
    pub applied: usize,
    pub rejected: usize,
    pub skipped: usize,
    /// First device rejection in the batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntentPayload {
    fn tally(
        instance_id: &str,
        feature_area: FeatureArea,
        operation: Operation,
        results: &[ApplyResult],
    ) -> Self {
        let applied = results.iter().filter(|r| r.is_applied()).count();
        let rejected = results.iter().filter(|r| r.is_rejected()).count();
        Self {
            instance_id: instance_id.to_string(),
            feature_area,
            operation,
            applied,
            rejected,
            skipped: results.len() - applied - rejected,
            error: results
                .iter()
                .find_map(ApplyResult::rejection)
                .map(|e| e.to_string()),
        }
    }
}

/// WebSocket hub manages connections and broadcasts events
pub struct Hub {
    tx: broadcast::Sender<String>,
    client_count: Arc<RwLock<usize>>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            client_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Broadcast an event to all connected clients
    pub async fn broadcast_event(&self, event: Event) {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Error serializing WebSocket event: {}", e);
                return;
            }
        };

        let count = *self.client_count.read().await;
        if count > 0 {
            if let Err(e) = self.tx.send(data) {
                tracing::warn!("Error broadcasting WebSocket event: {}", e);
            } else {
                tracing::debug!("Broadcasting {:?} to {} clients", event.event_type, count);
            }
        }
    }

    pub async fn broadcast_instance_registered(&self, instance: &Instance) {
        self.broadcast_event(Event {
            event_type: EventType::InstanceRegistered,
            payload: serde_json::to_value(InstancePayload {
                instance_id: instance.id.clone(),
                host: Some(instance.endpoint.host.clone()),
                version: Some(instance.version.clone()),
            })
            .unwrap_or_default(),
        })
        .await;
    }

    pub async fn broadcast_instance_removed(&self, instance_id: &str) {
        self.broadcast_event(Event {
            event_type: EventType::InstanceRemoved,
            payload: serde_json::to_value(InstancePayload {
                instance_id: instance_id.to_string(),
                host: None,
                version: None,
            })
            .unwrap_or_default(),
        })
        .await;
    }

    /// Broadcast a session state transition
    pub async fn broadcast_session_state(&self, instance_id: &str, state: SessionState) {
        self.broadcast_event(Event {
            event_type: EventType::SessionStateChanged,
            payload: serde_json::to_value(SessionStatePayload {
                instance_id: instance_id.to_string(),
                state,
            })
            .unwrap_or_default(),
        })
        .await;
    }

    /// Broadcast the outcome of an applied intent.
    /// Any rejected or skipped command makes it an `intent_failed` event.
    pub async fn broadcast_intent_outcome(
        &self,
        instance_id: &str,
        feature_area: FeatureArea,
        operation: Operation,
        results: &[ApplyResult],
    ) {
        let payload = IntentPayload::tally(instance_id, feature_area, operation, results);
        let event_type = if payload.applied == results.len() {
            EventType::IntentApplied
        } else {
            EventType::IntentFailed
        };
        self.broadcast_event(Event {
            event_type,
            payload: serde_json::to_value(payload).unwrap_or_default(),
        })
        .await;
    }

    /// Get the number of connected clients
    pub async fn client_count(&self) -> usize {
        *self.client_count.read().await
    }

    /// Subscribe to events
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    async fn increment_clients(&self) {
        let mut count = self.client_count.write().await;
        *count += 1;
        tracing::info!("WebSocket client connected. Total clients: {}", *count);
    }

    async fn decrement_clients(&self) {
        let mut count = self.client_count.write().await;
        *count = count.saturating_sub(1);
        tracing::info!("WebSocket client disconnected. Total clients: {}", *count);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket handler for axum
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();

    hub.increment_clients().await;

    let mut rx = hub.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are only drained to notice disconnects
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            if msg.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    hub.decrement_clients().await;
}
