use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::gateway::connection::handle_connection;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
}

async fn health_check() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "status": "ok", "service": "crowdsynth-backend" }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum_test::TestServer;

    use crate::rooms::RoomStore;
    use crate::services::arbitrator::{Arbitrator, GeminiOracle};
    use crate::services::audio::{AudioService, LyriaConnector};
    use crate::state::AppState;

    fn test_state() -> AppState {
        let rooms = Arc::new(RoomStore::new());
        AppState {
            rooms: rooms.clone(),
            arbitrator: Arc::new(Arbitrator::new(Arc::new(GeminiOracle::new(
                "test-key".into(),
            )))),
            audio: Arc::new(AudioService::new(
                Arc::new(LyriaConnector::new("test-key".into())),
                rooms,
            )),
        }
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let server = TestServer::new(super::router().with_state(test_state())).unwrap();
        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "crowdsynth-backend");
    }
}
