use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entities::{
    InputPayload, ParticipantInfo, Role, RoomSummary, TimelineEvent, WeightedPrompt, Zone,
};

// ── Client -> Server messages ──────────────────────────

/// Common fields every client frame may carry; the tagged message itself is
/// flattened alongside them.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateRoom {
        #[serde(default = "default_device_name")]
        device_name: String,
        #[serde(default)]
        room_name: String,
        #[serde(default)]
        display_name: String,
    },
    JoinRoom {
        #[serde(default)]
        display_name: String,
    },
    StartMusic,
    StopMusic,
    CloseRoom,
    EndStream,
    LeaveRoom,
    ListRooms,
    ChangeRole {
        new_role: String,
    },
    InputUpdate {
        role: String,
        #[serde(default)]
        payload: Value,
    },
    ApplauseUpdate {
        #[serde(default)]
        volume: f64,
        #[serde(default)]
        clap_rate: f64,
    },
    Drop,
    /// Any unrecognised `type` lands here and is dropped without a reply.
    #[serde(other)]
    Unknown,
}

fn default_device_name() -> String {
    "Unknown".into()
}

// ── Server -> Client messages ──────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomCreated {
        room_id: String,
        room_name: String,
        join_url: String,
        role: Role,
    },
    Joined {
        room_id: String,
        role: Role,
        user_id: String,
    },
    StateUpdate(RoomSnapshot),
    MusicStarted,
    MusicStopped,
    RoomClosed {
        message: String,
    },
    RoomEnded,
    RoomsList {
        rooms: Vec<RoomSummary>,
    },
    ApplauseLevel {
        volume: f64,
        clap_rate: f64,
        intensity: f64,
        density: f64,
        zone: Zone,
        loud: bool,
    },
    DropProgress {
        count: usize,
        needed: usize,
    },
    DropAlreadyVoted {
        count: usize,
        needed: usize,
    },
    DropIncoming {
        in_seconds: u64,
        count: usize,
        needed: usize,
    },
    DropTriggered {
        message: String,
    },
    DropReset {
        needed: usize,
        message: String,
    },
    StreamError {
        message: String,
    },
    Error {
        message: String,
    },
    Ping,
}

/// Full room state as fanned out to every client.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_name: String,
    pub is_playing: bool,
    pub active_prompts: Vec<WeightedPrompt>,
    pub bpm: u16,
    pub density: f64,
    pub brightness: f64,
    pub current_inputs: BTreeMap<String, InputPayload>,
    pub influence_weights: BTreeMap<String, f64>,
    pub participants: Vec<ParticipantInfo>,
    pub timeline: Vec<TimelineEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini_reasoning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::entities::Role;

    #[test]
    fn envelope_parses_create_room() {
        let raw = r#"{"type":"create_room","user_id":"abc","room_name":"Friday Jam","display_name":"Ada","extra":42}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.user_id.as_deref(), Some("abc"));
        match envelope.message {
            ClientMessage::CreateRoom {
                device_name,
                room_name,
                display_name,
            } => {
                assert_eq!(device_name, "Unknown");
                assert_eq!(room_name, "Friday Jam");
                assert_eq!(display_name, "Ada");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let raw = r#"{"type":"telemetry","user_id":"abc","room_id":"ABC123"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(matches!(envelope.message, ClientMessage::Unknown));
        assert_eq!(envelope.room_id.as_deref(), Some("ABC123"));
    }

    #[test]
    fn input_update_keeps_raw_payload() {
        let raw = r#"{"type":"input_update","user_id":"u","room_id":"R","role":"genre_dj","payload":{"genre":"trap","mystery":true}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        match envelope.message {
            ClientMessage::InputUpdate { role, payload } => {
                assert_eq!(role, "genre_dj");
                assert_eq!(payload["genre"], "trap");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_messages_carry_snake_case_tags() {
        let joined = ServerMessage::Joined {
            room_id: "ABC123".into(),
            role: Role::VibeSetter,
            user_id: "u1".into(),
        };
        let value = serde_json::to_value(&joined).unwrap();
        assert_eq!(value["type"], "joined");
        assert_eq!(value["role"], "vibe_setter");

        let ping = serde_json::to_value(ServerMessage::Ping).unwrap();
        assert_eq!(ping["type"], "ping");
    }

    #[test]
    fn state_update_omits_absent_reasoning() {
        let snapshot = RoomSnapshot {
            room_name: "".into(),
            is_playing: false,
            active_prompts: vec![WeightedPrompt::new("ambient electronic music", 1.0)],
            bpm: 100,
            density: 0.5,
            brightness: 0.5,
            current_inputs: BTreeMap::new(),
            influence_weights: BTreeMap::new(),
            participants: vec![],
            timeline: vec![],
            gemini_reasoning: None,
        };
        let value = serde_json::to_value(ServerMessage::StateUpdate(snapshot)).unwrap();
        assert_eq!(value["type"], "state_update");
        assert_eq!(value["bpm"], 100);
        assert!(value.get("gemini_reasoning").is_none());
    }

    #[test]
    fn applause_zone_serialises_uppercase() {
        let msg = ServerMessage::ApplauseLevel {
            volume: 0.5,
            clap_rate: 0.5,
            intensity: 0.6,
            density: 0.7,
            zone: Zone::High,
            loud: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["zone"], "HIGH");
    }
}
