use std::time::{Duration, Instant};

use crate::types::entities::WeightedPrompt;

use super::{ConnectionId, Room, RoomStore};

/// A window that collects no quorum within this span expires.
pub const DROP_WINDOW_TIMEOUT: Duration = Duration::from_secs(10);
/// Countdown between quorum and the synchronised moment.
pub const DROP_FIRE_DELAY: Duration = Duration::from_secs(3);
/// On an incoming vote, a window older than this with no trigger is treated
/// as abandoned and replaced.
const STALE_WINDOW: Duration = Duration::from_millis(5500);
/// An expiry task only clears a window at least this old, so it cannot kill
/// a younger window that replaced the one it was scheduled for.
const EXPIRY_GRACE: Duration = Duration::from_millis(9500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Triggered { count: usize, needed: usize },
    Registered { count: usize, needed: usize },
    AlreadyVoted { count: usize, needed: usize },
}

impl Room {
    /// Required votes, recomputed per vote: half the room, rounded up.
    pub fn drop_threshold(&self) -> usize {
        self.participants.len().div_ceil(2).max(1)
    }

    /// Record a drop vote. Votes dedup on `connection_id` rather than the
    /// client-supplied `user_id`, which may be shared across tabs.
    pub fn record_drop(&mut self, connection_id: ConnectionId, user_id: Option<&str>) -> DropOutcome {
        self.record_drop_at(connection_id, user_id, Instant::now())
    }

    pub(crate) fn record_drop_at(
        &mut self,
        connection_id: ConnectionId,
        user_id: Option<&str>,
        now: Instant,
    ) -> DropOutcome {
        if let Some(start) = self.drop_window_start {
            if now.duration_since(start) > STALE_WINDOW {
                self.drop_votes.clear();
                self.drop_window_start = None;
            }
        }

        let needed = self.drop_threshold();

        if self.drop_votes.contains_key(&connection_id) {
            return DropOutcome::AlreadyVoted {
                count: self.drop_votes.len(),
                needed,
            };
        }

        if self.drop_votes.is_empty() {
            self.drop_window_start = Some(now);
        }
        self.drop_votes.insert(connection_id, now);
        let count = self.drop_votes.len();

        let label = self.display_label(user_id);
        self.log_event("drop", format!("{label} voted drop ({count}/{needed})"));

        if count >= needed {
            self.drop_votes.clear();
            self.drop_window_start = None;
            self.log_event("drop", "drop triggered".to_string());
            return DropOutcome::Triggered { count, needed };
        }

        DropOutcome::Registered { count, needed }
    }

    pub(crate) fn expire_window_at(&mut self, now: Instant) -> Option<usize> {
        let start = self.drop_window_start?;
        if now.duration_since(start) < EXPIRY_GRACE || self.drop_votes.is_empty() {
            return None;
        }
        self.drop_votes.clear();
        self.drop_window_start = None;
        Some(self.drop_threshold())
    }
}

impl RoomStore {
    pub fn record_drop(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        user_id: Option<&str>,
    ) -> Option<DropOutcome> {
        let mut room = self.rooms.get_mut(room_id)?;
        let outcome = room.record_drop(connection_id, user_id);
        tracing::info!(room_id = %room_id, connection_id = %connection_id, outcome = ?outcome, "drop vote");
        Some(outcome)
    }

    /// Clear an expired window. Returns the recomputed threshold when a
    /// full-aged window with pending votes was actually cleared, so the
    /// caller can announce the reset.
    pub fn expire_drop_window(&self, room_id: &str) -> Option<usize> {
        let mut room = self.rooms.get_mut(room_id)?;
        room.expire_window_at(Instant::now())
    }
}

/// Fixed prompt pair forced upstream when a drop fires.
pub fn drop_prompts() -> Vec<WeightedPrompt> {
    vec![
        WeightedPrompt::new(
            "massive bass drop with thundering sub-bass, distorted 808 kick, building tension release, crowd energy explosion",
            0.7,
        ),
        WeightedPrompt::new(
            "intense electronic drop with rapid-fire hi-hats, aggressive synth stabs, maximum energy peak moment",
            0.3,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn store_with_participants(n: usize) -> (RoomStore, String) {
        let store = RoomStore::new();
        let room_id = store.create_room("user-0", "dev", "");
        for i in 0..n {
            store.join_room(
                &room_id,
                &format!("user-{i}"),
                "",
                Uuid::now_v7(),
                mpsc::unbounded_channel().0,
            );
        }
        (store, room_id)
    }

    #[test]
    fn quorum_sequence_for_five_participants() {
        let (store, room_id) = store_with_participants(5);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let c = Uuid::now_v7();

        assert_eq!(
            store.record_drop(&room_id, a, Some("user-0")),
            Some(DropOutcome::Registered { count: 1, needed: 3 })
        );
        assert_eq!(
            store.record_drop(&room_id, b, Some("user-1")),
            Some(DropOutcome::Registered { count: 2, needed: 3 })
        );
        assert_eq!(
            store.record_drop(&room_id, c, Some("user-2")),
            Some(DropOutcome::Triggered { count: 3, needed: 3 })
        );
    }

    #[test]
    fn duplicate_connection_cannot_double_vote() {
        let (store, room_id) = store_with_participants(5);
        let a = Uuid::now_v7();
        store.record_drop(&room_id, a, Some("user-0"));
        assert_eq!(
            store.record_drop(&room_id, a, Some("user-0")),
            Some(DropOutcome::AlreadyVoted { count: 1, needed: 3 })
        );
    }

    #[test]
    fn shared_user_id_still_counts_per_connection() {
        let (store, room_id) = store_with_participants(4);
        assert_eq!(
            store.record_drop(&room_id, Uuid::now_v7(), Some("user-0")),
            Some(DropOutcome::Registered { count: 1, needed: 2 })
        );
        assert_eq!(
            store.record_drop(&room_id, Uuid::now_v7(), Some("user-0")),
            Some(DropOutcome::Triggered { count: 2, needed: 2 })
        );
    }

    #[test]
    fn lone_participant_triggers_instantly() {
        let (store, room_id) = store_with_participants(1);
        assert_eq!(
            store.record_drop(&room_id, Uuid::now_v7(), Some("user-0")),
            Some(DropOutcome::Triggered { count: 1, needed: 1 })
        );
    }

    #[test]
    fn trigger_opens_a_fresh_window() {
        let (store, room_id) = store_with_participants(1);
        let a = Uuid::now_v7();
        assert!(matches!(
            store.record_drop(&room_id, a, None),
            Some(DropOutcome::Triggered { .. })
        ));
        // The window was cleared, so the same connection can vote again.
        assert!(matches!(
            store.record_drop(&room_id, a, None),
            Some(DropOutcome::Triggered { .. })
        ));
    }

    #[test]
    fn stale_window_is_replaced_by_the_incoming_vote() {
        let (store, room_id) = store_with_participants(5);
        let t0 = Instant::now();
        let mut room = store.rooms.get_mut(&room_id).unwrap();
        room.record_drop_at(Uuid::now_v7(), None, t0);
        room.record_drop_at(Uuid::now_v7(), None, t0 + Duration::from_secs(2));
        assert_eq!(room.drop_votes.len(), 2);

        // Six seconds in, the window is stale; this vote starts a new one.
        let outcome = room.record_drop_at(Uuid::now_v7(), None, t0 + Duration::from_secs(6));
        assert_eq!(outcome, DropOutcome::Registered { count: 1, needed: 3 });
        assert!(room.drop_window_start.is_some());
    }

    #[test]
    fn expiry_clears_only_a_full_aged_window() {
        let (store, room_id) = store_with_participants(5);
        assert_eq!(store.expire_drop_window(&room_id), None);

        let t0 = Instant::now();
        let mut room = store.rooms.get_mut(&room_id).unwrap();
        room.record_drop_at(Uuid::now_v7(), None, t0);

        // A younger window survives a stray expiry pass.
        assert_eq!(room.expire_window_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(room.drop_votes.len(), 1);

        assert_eq!(room.expire_window_at(t0 + DROP_WINDOW_TIMEOUT), Some(3));
        assert!(room.drop_votes.is_empty());
        assert_eq!(room.expire_window_at(t0 + DROP_WINDOW_TIMEOUT), None);
    }

    #[test]
    fn drop_prompt_weights() {
        let prompts = drop_prompts();
        assert_eq!(prompts.len(), 2);
        assert!((prompts[0].weight - 0.7).abs() < 1e-9);
        assert!((prompts[1].weight - 0.3).abs() < 1e-9);
    }
}
