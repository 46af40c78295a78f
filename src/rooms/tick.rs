use std::time::Duration;

use tokio::time::sleep;

use crate::error::OracleError;
use crate::state::AppState;
use crate::types::messages::ServerMessage;

use super::{TickGate, TickInputs};

pub const TICK_INTERVAL: Duration = Duration::from_secs(4);
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Start the per-room arbitration tick. A no-op when one is already running;
/// `RoomStore::stop_tick_loop` (or room destruction) cancels it.
pub fn start_tick_loop(state: &AppState, room_id: &str) {
    if state.rooms.ticks.contains_key(room_id) {
        return;
    }
    let handle = tokio::spawn(tick_loop(state.clone(), room_id.to_string()));
    state.rooms.ticks.insert(room_id.to_string(), handle);
    tracing::info!(room_id = %room_id, "tick loop started");
}

async fn tick_loop(state: AppState, room_id: String) {
    let mut consecutive_errors: u32 = 0;
    loop {
        sleep(TICK_INTERVAL).await;
        if !tick_once(&state, &room_id, &mut consecutive_errors).await {
            break;
        }
    }
    tracing::debug!(room_id = %room_id, "tick loop exited");
}

/// One tick pass. Returns false when the room is gone and the loop should
/// exit. A failed arbitration applies nothing, so the room's prompts and
/// knobs stay exactly as the previous tick left them; the third consecutive
/// failure announces a stream error and starts the count over.
pub(crate) async fn tick_once(
    state: &AppState,
    room_id: &str,
    consecutive_errors: &mut u32,
) -> bool {
    match state.rooms.begin_tick(room_id) {
        TickGate::Gone => return false,
        TickGate::Idle => return true,
        TickGate::Run(tick) => {
            match run_tick(state, room_id, tick).await {
                Ok(()) => *consecutive_errors = 0,
                Err(e) => {
                    *consecutive_errors += 1;
                    tracing::warn!(
                        room_id = %room_id,
                        error = %e,
                        consecutive = *consecutive_errors,
                        "tick arbitration failed"
                    );
                    if *consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        state.rooms.broadcast(
                            room_id,
                            &ServerMessage::StreamError {
                                message: "Music stream interrupted. Try restarting.".into(),
                            },
                        );
                        *consecutive_errors = 0;
                    }
                }
            }
            // Consumed either way, so stale payloads don't re-trigger
            // arbitration next tick.
            state.rooms.clear_inputs(room_id);
        }
    }
    true
}

async fn run_tick(state: &AppState, room_id: &str, tick: TickInputs) -> Result<(), OracleError> {
    let result = state
        .arbitrator
        .arbitrate(room_id, &tick.inputs, tick.bpm, tick.density, tick.brightness)
        .await?;

    if let Err(e) = state
        .audio
        .update_prompts(
            room_id,
            &result.prompts,
            result.bpm,
            result.density,
            result.brightness,
        )
        .await
    {
        tracing::warn!(room_id = %room_id, error = %e, "upstream prompt update failed, audio continues on prior config");
    }

    state.rooms.update_after_arbitration(
        room_id,
        result.prompts,
        result.bpm,
        result.density,
        result.brightness,
    );

    if let Some(snapshot) = state.rooms.snapshot(room_id, Some(result.reasoning)) {
        state.rooms.broadcast(room_id, &ServerMessage::StateUpdate(snapshot));
    }
    Ok(())
}
