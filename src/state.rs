use std::sync::Arc;

use crate::rooms::RoomStore;
use crate::services::arbitrator::Arbitrator;
use crate::services::audio::AudioService;

/// Components constructed once at startup and shared with every connection
/// handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomStore>,
    pub arbitrator: Arc<Arbitrator>,
    pub audio: Arc<AudioService>,
}
