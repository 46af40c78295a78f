pub mod drop;
pub mod tick;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use axum::extract::ws::Message;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::types::entities::{
    InputPayload, ParticipantInfo, Role, RoomSummary, TimelineEvent, WeightedPrompt,
};
use crate::types::messages::{RoomSnapshot, ServerMessage};

pub const MAX_PARTICIPANTS: usize = 10;
pub const DEFAULT_BPM: u16 = 100;
const SEED_PROMPT: &str = "ambient electronic music";

const TIMELINE_CAP: usize = 50;
const TIMELINE_BROADCAST: usize = 20;

/// Inputs lose half their influence every 30 seconds.
const INFLUENCE_HALF_LIFE_SECS: f64 = 30.0;
const INFLUENCE_FLOOR: f64 = 0.05;

const ROOM_ID_LEN: usize = 6;
const ROOM_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub type ConnectionId = Uuid;
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// Result of a join attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(Role),
    Full,
    UnknownRoom,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HostCheck {
    Host,
    NotHost,
    UnknownRoom,
}

/// What the tick loop should do this pass.
pub enum TickGate {
    /// Room destroyed; the loop exits.
    Gone,
    /// Room exists but is not playing; skip arbitration.
    Idle,
    Run(TickInputs),
}

/// Snapshot handed to the arbitrator, taken with energy knobs already folded
/// into the room state.
pub struct TickInputs {
    pub inputs: BTreeMap<Role, InputPayload>,
    pub bpm: u16,
    pub density: f64,
    pub brightness: f64,
}

#[derive(Debug, Clone)]
struct Participant {
    display_name: String,
    role: Role,
}

pub struct Room {
    host_id: String,
    room_name: String,
    host_device: String,
    is_playing: bool,
    bpm: u16,
    density: f64,
    brightness: f64,
    active_prompts: Vec<WeightedPrompt>,
    current_inputs: BTreeMap<Role, InputPayload>,
    influence_weights: BTreeMap<Role, f64>,
    participants: HashMap<String, Participant>,
    timeline: VecDeque<TimelineEvent>,
    input_stamps: HashMap<Role, Instant>,
    drop_votes: HashMap<ConnectionId, Instant>,
    drop_window_start: Option<Instant>,
    connections: HashMap<ConnectionId, OutboundSender>,
}

impl Room {
    fn new(host_id: &str, room_name: &str, host_device: &str) -> Self {
        Self {
            host_id: host_id.to_string(),
            room_name: room_name.to_string(),
            host_device: host_device.to_string(),
            is_playing: false,
            bpm: DEFAULT_BPM,
            density: 0.5,
            brightness: 0.5,
            active_prompts: vec![WeightedPrompt::new(SEED_PROMPT, 1.0)],
            current_inputs: BTreeMap::new(),
            influence_weights: BTreeMap::new(),
            participants: HashMap::new(),
            timeline: VecDeque::new(),
            input_stamps: HashMap::new(),
            drop_votes: HashMap::new(),
            drop_window_start: None,
            connections: HashMap::new(),
        }
    }

    fn set_bpm(&mut self, bpm: i64) {
        self.bpm = bpm.clamp(60, 200) as u16;
    }

    fn set_density(&mut self, density: f64) {
        self.density = density.clamp(0.0, 1.0);
    }

    fn set_brightness(&mut self, brightness: f64) {
        self.brightness = brightness.clamp(0.0, 1.0);
    }

    /// Weights are renormalised on every assignment so they always sum to 1.
    fn set_active_prompts(&mut self, mut prompts: Vec<WeightedPrompt>) {
        if prompts.is_empty() {
            return;
        }
        let total: f64 = prompts.iter().map(|p| p.weight).sum();
        if total > 0.0 {
            for p in &mut prompts {
                p.weight /= total;
            }
        } else {
            let uniform = 1.0 / prompts.len() as f64;
            for p in &mut prompts {
                p.weight = uniform;
            }
        }
        self.active_prompts = prompts;
    }

    fn assign_role(&self) -> Role {
        let taken: Vec<Role> = self.participants.values().map(|p| p.role).collect();
        Role::PRIMARY
            .into_iter()
            .find(|r| !taken.contains(r))
            .unwrap_or(Role::Energy)
    }

    fn log_event(&mut self, source: &str, text: String) {
        self.timeline.push_back(TimelineEvent {
            time: unix_now(),
            source: source.to_string(),
            text,
        });
        while self.timeline.len() > TIMELINE_CAP {
            self.timeline.pop_front();
        }
    }

    /// Recency-weighted influence: each role's weight decays with a 30-second
    /// half-life since its last input, floored, then normalised to sum to 1.
    fn recalc_influence(&mut self, now: Instant) {
        if self.input_stamps.is_empty() {
            return;
        }
        let raw: Vec<(Role, f64)> = self
            .input_stamps
            .iter()
            .map(|(role, stamp)| {
                let age = now.duration_since(*stamp).as_secs_f64();
                (*role, influence_decay(age))
            })
            .collect();
        let total: f64 = raw.iter().map(|(_, w)| w).sum();
        if total > 0.0 {
            self.influence_weights = raw
                .into_iter()
                .map(|(role, w)| (role, (w / total * 100.0).round() / 100.0))
                .collect();
        }
    }

    fn display_label(&self, user_id: Option<&str>) -> String {
        match user_id {
            Some(uid) => self
                .participants
                .get(uid)
                .map(|p| p.display_name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| uid.chars().take(8).collect()),
            None => "anon".to_string(),
        }
    }

    fn snapshot(&self, reasoning: Option<String>) -> RoomSnapshot {
        let tail = self.timeline.len().saturating_sub(TIMELINE_BROADCAST);
        RoomSnapshot {
            room_name: self.room_name.clone(),
            is_playing: self.is_playing,
            active_prompts: self.active_prompts.clone(),
            bpm: self.bpm,
            density: self.density,
            brightness: self.brightness,
            current_inputs: self
                .current_inputs
                .iter()
                .map(|(role, payload)| (role.as_str().to_string(), payload.clone()))
                .collect(),
            influence_weights: self
                .influence_weights
                .iter()
                .map(|(role, w)| (role.as_str().to_string(), *w))
                .collect(),
            participants: self
                .participants
                .iter()
                .map(|(uid, p)| ParticipantInfo {
                    user_id: uid.clone(),
                    role: p.role,
                    display_name: p.display_name.clone(),
                    is_host: *uid == self.host_id,
                })
                .collect(),
            timeline: self.timeline.iter().skip(tail).cloned().collect(),
            gemini_reasoning: reasoning,
        }
    }
}

pub(crate) fn influence_decay(age_secs: f64) -> f64 {
    2f64.powf(-age_secs / INFLUENCE_HALF_LIFE_SECS).max(INFLUENCE_FLOOR)
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Process-wide room registry. All mutation is synchronous; no entry lock is
/// ever held across an await.
pub struct RoomStore {
    rooms: DashMap<String, Room>,
    ticks: DashMap<String, JoinHandle<()>>,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            ticks: DashMap::new(),
        }
    }

    /// Mint a room with defaults and return its id.
    pub fn create_room(&self, host_id: &str, device_name: &str, room_name: &str) -> String {
        let room_id = self.mint_room_id();
        let mut room = Room::new(host_id, room_name, device_name);
        room.log_event("create", format!("Room {room_id} created"));
        self.rooms.insert(room_id.clone(), room);
        tracing::info!(room_id = %room_id, host_id = %host_id, device = %device_name, "room created");
        room_id
    }

    fn mint_room_id(&self) -> String {
        let mut rng = rand::rng();
        loop {
            let id: String = (0..ROOM_ID_LEN)
                .map(|_| ROOM_ID_CHARS[rng.random_range(0..ROOM_ID_CHARS.len())] as char)
                .collect();
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }

    /// Idempotent join: a returning `user_id` keeps its role and does not
    /// count against the participant cap.
    pub fn join_room(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
        sender: OutboundSender,
    ) -> JoinOutcome {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return JoinOutcome::UnknownRoom;
        };

        let returning = room.participants.contains_key(user_id);
        if !returning && room.participants.len() >= MAX_PARTICIPANTS {
            tracing::info!(room_id = %room_id, user_id = %user_id, "room full, join rejected");
            return JoinOutcome::Full;
        }

        room.connections.insert(connection_id, sender);

        if returning {
            if let Some(p) = room.participants.get_mut(user_id) {
                if !display_name.is_empty() {
                    p.display_name = display_name.to_string();
                }
                let role = p.role;
                tracing::info!(room_id = %room_id, user_id = %user_id, role = %role, "participant reconnected");
                return JoinOutcome::Joined(role);
            }
        }

        let role = room.assign_role();
        room.participants.insert(
            user_id.to_string(),
            Participant {
                display_name: display_name.to_string(),
                role,
            },
        );
        let label = if display_name.is_empty() {
            user_id.chars().take(8).collect()
        } else {
            display_name.to_string()
        };
        room.log_event("join", format!("{label} joined as {role}"));
        tracing::info!(room_id = %room_id, user_id = %user_id, role = %role, "participant joined");
        JoinOutcome::Joined(role)
    }

    /// Re-attach a live socket to a room's broadcast set (reconnect path).
    /// Returns false when the room does not exist.
    pub fn register_connection(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        sender: OutboundSender,
    ) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                room.connections.insert(connection_id, sender);
                true
            }
            None => false,
        }
    }

    /// Drop a socket from the broadcast set while keeping the participant's
    /// role for reconnection.
    pub fn remove_connection(&self, room_id: &str, connection_id: ConnectionId) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.connections.remove(&connection_id);
        }
    }

    /// Permanently remove a participant and their role (explicit leave).
    pub fn remove_user(&self, room_id: &str, user_id: &str) {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let label = room.display_label(Some(user_id));
        if room.participants.remove(user_id).is_some() {
            room.log_event("leave", format!("{label} left the room"));
            tracing::info!(room_id = %room_id, user_id = %user_id, "participant left");
        }
    }

    /// Switch a participant to a role no other participant holds.
    pub fn change_role(&self, room_id: &str, user_id: &str, new_role: Role) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(old_role) = room.participants.get(user_id).map(|p| p.role) else {
            return false;
        };
        let taken = room
            .participants
            .iter()
            .any(|(uid, p)| uid != user_id && p.role == new_role);
        if taken {
            return false;
        }
        let label = room.display_label(Some(user_id));
        if let Some(p) = room.participants.get_mut(user_id) {
            p.role = new_role;
        }
        room.log_event(
            "role_change",
            format!("{label} switched from {old_role} to {new_role}"),
        );
        true
    }

    pub fn update_input(&self, room_id: &str, role: Role, payload: InputPayload) {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let summary = payload.summary();
        room.current_inputs.insert(role, payload);
        let now = Instant::now();
        room.input_stamps.insert(role, now);
        room.recalc_influence(now);
        if !summary.is_empty() {
            room.log_event("input", format!("{role}: {summary}"));
        }
        tracing::debug!(room_id = %room_id, role = %role, "input stored");
    }

    /// Apply an arbitration result. Inputs are left alone; the tick loop
    /// clears them once the whole pass is done.
    pub fn update_after_arbitration(
        &self,
        room_id: &str,
        prompts: Vec<WeightedPrompt>,
        bpm: u16,
        density: f64,
        brightness: f64,
    ) {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return;
        };
        room.set_active_prompts(prompts);
        room.set_bpm(bpm as i64);
        room.set_density(density);
        room.set_brightness(brightness);
        room.recalc_influence(Instant::now());
    }

    pub fn clear_inputs(&self, room_id: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.current_inputs.clear();
        }
    }

    /// Gate one tick pass: fold any energy-role knob inputs into the room
    /// (energy participants bypass arbitration), then snapshot.
    pub fn begin_tick(&self, room_id: &str) -> TickGate {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return TickGate::Gone;
        };
        if !room.is_playing {
            return TickGate::Idle;
        }
        if let Some(energy) = room.current_inputs.get(&Role::Energy).cloned() {
            if let Some(density) = energy.density {
                room.set_density(density);
            }
            if let Some(brightness) = energy.brightness {
                room.set_brightness(brightness);
            }
        }
        TickGate::Run(TickInputs {
            inputs: room.current_inputs.clone(),
            bpm: room.bpm,
            density: room.density,
            brightness: room.brightness,
        })
    }

    /// Atomically rewrite the knobs through `f(density, brightness)`,
    /// clamping on write. Returns the values actually stored.
    pub fn update_knobs_with(
        &self,
        room_id: &str,
        f: impl FnOnce(f64, f64) -> (f64, f64),
    ) -> Option<(f64, f64)> {
        let mut room = self.rooms.get_mut(room_id)?;
        let (density, brightness) = f(room.density, room.brightness);
        room.set_density(density);
        room.set_brightness(brightness);
        Some((room.density, room.brightness))
    }

    pub fn set_playing(&self, room_id: &str, playing: bool) -> Option<u16> {
        let mut room = self.rooms.get_mut(room_id)?;
        room.is_playing = playing;
        Some(room.bpm)
    }

    pub fn is_playing(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|room| room.is_playing)
            .unwrap_or(false)
    }

    pub fn room_bpm(&self, room_id: &str) -> Option<u16> {
        self.rooms.get(room_id).map(|room| room.bpm)
    }

    pub fn host_check(&self, room_id: &str, user_id: Option<&str>) -> HostCheck {
        match self.rooms.get(room_id) {
            None => HostCheck::UnknownRoom,
            Some(room) if user_id == Some(room.host_id.as_str()) => HostCheck::Host,
            Some(_) => HostCheck::NotHost,
        }
    }

    pub fn snapshot(&self, room_id: &str, reasoning: Option<String>) -> Option<RoomSnapshot> {
        self.rooms.get(room_id).map(|room| room.snapshot(reasoning))
    }

    pub fn rooms_list(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .map(|entry| {
                let room = entry.value();
                RoomSummary {
                    room_id: entry.key().clone(),
                    room_name: room.room_name.clone(),
                    member_count: room.participants.len(),
                    is_playing: room.is_playing,
                    host_device: room.host_device.clone(),
                    roles_taken: room.participants.values().map(|p| p.role).collect(),
                }
            })
            .collect()
    }

    /// Stop the tick loop and purge all state for a room.
    pub fn destroy_room(&self, room_id: &str) {
        self.stop_tick_loop(room_id);
        if self.rooms.remove(room_id).is_some() {
            tracing::info!(room_id = %room_id, "room destroyed");
        }
    }

    pub fn stop_tick_loop(&self, room_id: &str) {
        if let Some((_, handle)) = self.ticks.remove(room_id) {
            handle.abort();
        }
    }

    // ── Fan-out ────────────────────────────────────────

    /// Send a JSON message to every socket in the room, reaping any socket
    /// whose queue is gone in the same pass.
    pub fn broadcast(&self, room_id: &str, message: &ServerMessage) {
        let text = serde_json::to_string(message).unwrap();
        let frame = Message::Text(text.into());
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.connections.retain(|_, tx| tx.send(frame.clone()).is_ok());
        }
    }

    /// Send raw audio bytes to every socket in the room.
    pub fn broadcast_bytes(&self, room_id: &str, data: Bytes) {
        let frame = Message::Binary(data);
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.connections.retain(|_, tx| tx.send(frame.clone()).is_ok());
        }
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.connections.len())
            .unwrap_or(0)
    }
}
