use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::rooms::drop::{drop_prompts, DropOutcome, DROP_FIRE_DELAY, DROP_WINDOW_TIMEOUT};
use crate::rooms::{tick, HostCheck, JoinOutcome};
use crate::state::AppState;
use crate::types::entities::{InputPayload, Role, Zone};
use crate::types::messages::{ClientMessage, Envelope, ServerMessage};

use super::applause;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DROP_BPM_LIFT: u16 = 20;
const DROP_BPM_CEILING: u16 = 160;

struct ConnState {
    connection_id: Uuid,
    user_id: Option<String>,
    room_id: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnState {
    fn send(&self, message: &ServerMessage) {
        let _ = self.tx.send(json_frame(message));
    }

    fn send_error(&self, message: impl Into<String>) {
        self.send(&ServerMessage::Error {
            message: message.into(),
        });
    }
}

fn json_frame(message: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(message).unwrap().into())
}

pub async fn handle_connection(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Sender task - drains the outbound queue into the socket.
    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Heartbeat keeps idle connections alive through proxies.
    let heartbeat_tx = tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if heartbeat_tx.send(json_frame(&ServerMessage::Ping)).is_err() {
                break;
            }
        }
    });

    // Server-minted id; drop votes dedup on this rather than the
    // client-supplied user_id, which can be shared across tabs.
    let connection_id = Uuid::now_v7();
    let mut conn = ConnState {
        connection_id,
        user_id: None,
        room_id: None,
        tx,
    };

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Binary frames from clients are not part of the protocol.
            _ => continue,
        };

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(envelope) => envelope,
            Err(_) => {
                conn.send_error("Invalid JSON");
                continue;
            }
        };

        dispatch(&state, &mut conn, envelope).await;
    }

    // Socket gone; drop it from the broadcast set but keep the role so the
    // participant can reconnect.
    if let Some(room_id) = &conn.room_id {
        state.rooms.remove_connection(room_id, connection_id);
    }
    heartbeat_task.abort();
    sender_task.abort();
    tracing::info!(
        connection_id = %connection_id,
        user_id = ?conn.user_id,
        room_id = ?conn.room_id,
        "client disconnected"
    );
}

async fn dispatch(state: &AppState, conn: &mut ConnState, envelope: Envelope) {
    let Envelope {
        user_id,
        room_id,
        message,
    } = envelope;

    if let Some(user_id) = user_id {
        conn.user_id = Some(user_id);
    }
    let msg_room = room_id.map(|r| r.to_uppercase());

    // A frame carrying a room id on a fresh connection re-registers this
    // socket into the room's broadcast set (reconnect path). The role was
    // never dropped, so nothing else is needed.
    if conn.room_id.is_none() {
        if let Some(room_id) = &msg_room {
            if state
                .rooms
                .register_connection(room_id, conn.connection_id, conn.tx.clone())
            {
                tracing::info!(room_id = %room_id, user_id = ?conn.user_id, "connection re-registered into room");
                conn.room_id = Some(room_id.clone());
            }
        }
    }

    match message {
        ClientMessage::CreateRoom {
            device_name,
            room_name,
            display_name,
        } => {
            let Some(user_id) = conn.user_id.clone() else {
                conn.send_error("Missing user_id");
                return;
            };
            let room_id = state.rooms.create_room(&user_id, &device_name, &room_name);
            let JoinOutcome::Joined(role) = state.rooms.join_room(
                &room_id,
                &user_id,
                &display_name,
                conn.connection_id,
                conn.tx.clone(),
            ) else {
                return;
            };
            conn.room_id = Some(room_id.clone());
            conn.send(&ServerMessage::RoomCreated {
                room_id: room_id.clone(),
                room_name,
                join_url: format!("?room_id={room_id}"),
                role,
            });
            broadcast_state(state, &room_id);
        }

        ClientMessage::JoinRoom { display_name } => {
            let Some(user_id) = conn.user_id.clone() else {
                conn.send_error("Missing user_id");
                return;
            };
            let room_id = msg_room.unwrap_or_default();
            match state.rooms.join_room(
                &room_id,
                &user_id,
                &display_name,
                conn.connection_id,
                conn.tx.clone(),
            ) {
                JoinOutcome::UnknownRoom => {
                    conn.send_error(format!("Room {room_id} not found"));
                }
                JoinOutcome::Full => {
                    conn.send_error("Room is full (max 10 players)");
                }
                JoinOutcome::Joined(role) => {
                    conn.room_id = Some(room_id.clone());
                    conn.send(&ServerMessage::Joined {
                        room_id: room_id.clone(),
                        role,
                        user_id,
                    });
                    broadcast_state(state, &room_id);
                }
            }
        }

        ClientMessage::StartMusic => {
            let Some(room_id) = conn.room_id.clone() else {
                conn.send_error("Not in a room");
                return;
            };
            match state.rooms.host_check(&room_id, conn.user_id.as_deref()) {
                HostCheck::UnknownRoom => conn.send_error("Room not found"),
                HostCheck::NotHost => conn.send_error("Only the host can start music"),
                HostCheck::Host => {
                    let bpm = state.rooms.set_playing(&room_id, true).unwrap_or(100);
                    match state.audio.start_session(&room_id, bpm).await {
                        Ok(()) => {
                            tick::start_tick_loop(state, &room_id);
                            state.rooms.broadcast(&room_id, &ServerMessage::MusicStarted);
                        }
                        Err(e) => {
                            state.rooms.set_playing(&room_id, false);
                            tracing::error!(room_id = %room_id, error = %e, "audio session start failed");
                            conn.send_error(format!("Failed to start music: {e}"));
                        }
                    }
                }
            }
        }

        ClientMessage::StopMusic => {
            let Some(room_id) = conn.room_id.clone() else {
                return;
            };
            match state.rooms.host_check(&room_id, conn.user_id.as_deref()) {
                HostCheck::UnknownRoom => conn.send_error("Room not found"),
                HostCheck::NotHost => conn.send_error("Only the host can stop music"),
                HostCheck::Host => {
                    state.rooms.set_playing(&room_id, false);
                    state.rooms.stop_tick_loop(&room_id);
                    state.audio.stop_session(&room_id).await;
                    state.rooms.broadcast(&room_id, &ServerMessage::MusicStopped);
                }
            }
        }

        ClientMessage::CloseRoom => {
            close_room(state, conn, ServerMessage::RoomClosed {
                message: "Host closed the room".into(),
            })
            .await;
        }

        ClientMessage::EndStream => {
            close_room(state, conn, ServerMessage::RoomEnded).await;
        }

        ClientMessage::LeaveRoom => {
            if let (Some(room_id), Some(user_id)) = (conn.room_id.clone(), conn.user_id.clone()) {
                state.rooms.remove_user(&room_id, &user_id);
                broadcast_state(state, &room_id);
            }
        }

        ClientMessage::ListRooms => {
            conn.send(&ServerMessage::RoomsList {
                rooms: state.rooms.rooms_list(),
            });
        }

        ClientMessage::ChangeRole { new_role } => {
            let (Some(room_id), Some(user_id)) = (conn.room_id.clone(), conn.user_id.clone())
            else {
                return;
            };
            let Some(role) = Role::parse(&new_role) else {
                conn.send_error(format!("Unknown role {new_role}"));
                return;
            };
            if state.rooms.change_role(&room_id, &user_id, role) {
                broadcast_state(state, &room_id);
            } else {
                conn.send_error("That role is taken");
            }
        }

        ClientMessage::InputUpdate { role, payload } => {
            let Some(room_id) = conn.room_id.clone() else {
                return;
            };
            // Unknown roles and unreadable payloads are dropped silently.
            let Some(role) = Role::parse(&role) else {
                return;
            };
            let Ok(payload) = serde_json::from_value::<InputPayload>(payload) else {
                return;
            };
            state.rooms.update_input(&room_id, role, payload);
        }

        ClientMessage::ApplauseUpdate { volume, clap_rate } => {
            let Some(room_id) = conn.room_id.clone() else {
                return;
            };
            let reading = applause::classify(volume, clap_rate);
            let Some((density, brightness)) = state
                .rooms
                .update_knobs_with(&room_id, |d, b| applause::adjust_knobs(reading, d, b))
            else {
                return;
            };

            // Push the change upstream now rather than waiting out the tick.
            if state.rooms.is_playing(&room_id) {
                if let Some(overlay) = applause::overlay_prompt(reading.zone) {
                    if let Err(e) = state
                        .audio
                        .apply_overlay(&room_id, overlay, reading.intensity, density, brightness)
                        .await
                    {
                        tracing::warn!(room_id = %room_id, error = %e, "applause overlay push failed");
                    }
                }
            }

            state.rooms.broadcast(&room_id, &ServerMessage::ApplauseLevel {
                volume: (reading.volume * 100.0).round() / 100.0,
                clap_rate: reading.clap_rate,
                intensity: reading.intensity,
                density,
                zone: reading.zone,
                loud: reading.zone == Zone::High,
            });
        }

        ClientMessage::Drop => {
            let Some(room_id) = conn.room_id.clone() else {
                return;
            };
            match state
                .rooms
                .record_drop(&room_id, conn.connection_id, conn.user_id.as_deref())
            {
                None => {}
                Some(DropOutcome::AlreadyVoted { count, needed }) => {
                    conn.send(&ServerMessage::DropAlreadyVoted { count, needed });
                }
                Some(DropOutcome::Registered { count, needed }) => {
                    state
                        .rooms
                        .broadcast(&room_id, &ServerMessage::DropProgress { count, needed });
                    if count == 1 {
                        spawn_drop_expiry(state.clone(), room_id);
                    }
                }
                Some(DropOutcome::Triggered { count, needed }) => {
                    state.rooms.broadcast(&room_id, &ServerMessage::DropIncoming {
                        in_seconds: DROP_FIRE_DELAY.as_secs(),
                        count,
                        needed,
                    });
                    spawn_drop_fire(state.clone(), room_id);
                }
            }
        }

        ClientMessage::Unknown => {}
    }
}

async fn close_room(state: &AppState, conn: &mut ConnState, farewell: ServerMessage) {
    let Some(room_id) = conn.room_id.clone() else {
        return;
    };
    match state.rooms.host_check(&room_id, conn.user_id.as_deref()) {
        HostCheck::UnknownRoom => conn.send_error("Room not found"),
        HostCheck::NotHost => conn.send_error("Only the host can close the room"),
        HostCheck::Host => {
            state.rooms.set_playing(&room_id, false);
            state.rooms.stop_tick_loop(&room_id);
            state.audio.stop_session(&room_id).await;
            state.rooms.broadcast(&room_id, &farewell);
            state.rooms.destroy_room(&room_id);
            state.arbitrator.forget_room(&room_id);
            conn.room_id = None;
        }
    }
}

/// Countdown task for a triggered drop. The upstream push and the client
/// notification are independent: a failed push never swallows the moment.
fn spawn_drop_fire(state: AppState, room_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(DROP_FIRE_DELAY).await;
        let Some(bpm) = state.rooms.room_bpm(&room_id) else {
            return;
        };
        let drop_bpm = (bpm + DROP_BPM_LIFT).min(DROP_BPM_CEILING);
        if let Err(e) = state
            .audio
            .update_prompts(&room_id, &drop_prompts(), drop_bpm, 1.0, 0.3)
            .await
        {
            tracing::warn!(room_id = %room_id, error = %e, "drop prompt push failed");
        }
        state.rooms.broadcast(&room_id, &ServerMessage::DropTriggered {
            message: "DROP!".into(),
        });
    });
}

/// Expiry task scheduled on the first vote of a window.
fn spawn_drop_expiry(state: AppState, room_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(DROP_WINDOW_TIMEOUT).await;
        if let Some(needed) = state.rooms.expire_drop_window(&room_id) {
            state.rooms.broadcast(&room_id, &ServerMessage::DropReset {
                needed,
                message: "Not enough votes, try again".into(),
            });
        }
    });
}

fn broadcast_state(state: &AppState, room_id: &str) {
    if let Some(snapshot) = state.rooms.snapshot(room_id, None) {
        state
            .rooms
            .broadcast(room_id, &ServerMessage::StateUpdate(snapshot));
    }
}
