//! Observer WebSocket: passive subscribers watch a set of trips and
//! receive merged snapshots, with a one-time terminal notice when a
//! watched trip is canceled.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use tokio::sync::broadcast;

use crate::directory::TripKey;
use crate::tracking::feed::{self, TripView};
use crate::tracking::{LiveLocationChannel, TripStatus};

#[derive(Clone)]
pub struct WsState {
    pub pool: SqlitePool,
    pub channel: LiveLocationChannel,
}

/// Client subscription message
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    /// Subscribe to specific trips by wire key `{bus_id}-{route_name}`
    Subscribe { trips: Vec<String> },
}

/// Server message sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    /// Initial connection acknowledgment
    Connected { message: String },
    /// Full snapshots (sent on subscribe)
    Trips { trips: Vec<TripView> },
    /// One changed snapshot
    TripUpdate { view: TripView },
    /// One-time terminal notice for a watched trip
    TripCanceled { trip: String },
    /// Error message
    Error { message: String },
}

/// Hash the observable fields of a view for change suppression
fn compute_view_hash(view: &TripView) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    view.trip.hash(&mut hasher);
    (view.status as u8).hash(&mut hasher);
    if let Some(sample) = &view.last_sample {
        sample.timestamp.hash(&mut hasher);
        sample.latitude.map(f64::to_bits).hash(&mut hasher);
        sample.longitude.map(f64::to_bits).hash(&mut hasher);
    }
    if let Some(route) = &view.route {
        route.current_city.hash(&mut hasher);
        route.direction.as_str().hash(&mut hasher);
        route.destination_name.hash(&mut hasher);
        route.updated_at.hash(&mut hasher);
    }
    hasher.finish()
}

/// WebSocket endpoint for trip observers
pub async fn ws_trips(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates_rx = state.channel.subscribe();

    // Send connected message
    let connected_msg = ServerMessage::Connected {
        message: "Connected to trip updates. Send subscribe message with trip keys.".to_string(),
    };
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Channel to communicate subscriptions from receiver task to sender task
    let (sub_tx, mut sub_rx) = tokio::sync::mpsc::channel::<Vec<String>>(16);

    let forward_state = state.clone();

    // Spawn task to forward broadcast updates to WebSocket
    let forward_task = tokio::spawn(async move {
        let mut subscribed: HashSet<String> = HashSet::new();
        let mut view_hashes: HashMap<String, u64> = HashMap::new();
        let mut terminal_notified: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                // Handle subscription updates
                Some(trips) = sub_rx.recv() => {
                    subscribed = trips.into_iter().collect();
                    // Reset previous state when subscription changes
                    view_hashes.clear();
                    terminal_notified.clear();

                    let mut views = Vec::new();
                    for trip in &subscribed {
                        let Some(key) = TripKey::parse(trip) else {
                            let msg = ServerMessage::Error {
                                message: format!("invalid trip key '{trip}'"),
                            };
                            if let Ok(json) = serde_json::to_string(&msg) {
                                let _ = sender.send(Message::Text(json.into())).await;
                            }
                            continue;
                        };
                        let view =
                            feed::trip_snapshot(&forward_state.pool, &forward_state.channel, &key)
                                .await;
                        if view.status == TripStatus::Canceled {
                            terminal_notified.insert(trip.clone());
                        }
                        view_hashes.insert(trip.clone(), compute_view_hash(&view));
                        views.push(view);
                    }

                    let msg = ServerMessage::Trips { trips: views };
                    if let Ok(json) = serde_json::to_string(&msg) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                // Handle broadcast updates
                result = updates_rx.recv() => {
                    match result {
                        Ok(update) => {
                            if !subscribed.contains(&update.trip) {
                                continue;
                            }
                            let Some(key) = TripKey::parse(&update.trip) else {
                                continue;
                            };
                            let view = feed::trip_snapshot(
                                &forward_state.pool,
                                &forward_state.channel,
                                &key,
                            )
                            .await;

                            if view.status == TripStatus::Canceled {
                                // Terminal notice exactly once, then no
                                // further coordinate updates for this trip
                                if terminal_notified.insert(update.trip.clone()) {
                                    let msg = ServerMessage::TripCanceled {
                                        trip: update.trip.clone(),
                                    };
                                    if let Ok(json) = serde_json::to_string(&msg) {
                                        if sender.send(Message::Text(json.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                continue;
                            }
                            // A restarted trip speaks again
                            terminal_notified.remove(&update.trip);

                            let hash = compute_view_hash(&view);
                            if view_hashes.get(&update.trip) == Some(&hash) {
                                continue;
                            }
                            view_hashes.insert(update.trip.clone(), hash);

                            let msg = ServerMessage::TripUpdate { view };
                            if let Ok(json) = serde_json::to_string(&msg) {
                                if sender.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    });

    // Handle incoming messages from client
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) {
                    match client_msg {
                        ClientMessage::Subscribe { trips } => {
                            let _ = sub_tx.send(trips).await;
                        }
                    }
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum handles pong automatically
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    // Cleanup
    forward_task.abort();
}
