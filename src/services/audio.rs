use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::AudioError;
use crate::rooms::RoomStore;
use crate::types::entities::WeightedPrompt;

/// Largest bpm movement pushed upstream in one update; the remaining
/// distance to the arbitrator's target is covered on later ticks.
pub const MAX_BPM_STEP: u16 = 10;

const UPSTREAM_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateMusic";
const UPSTREAM_MODEL: &str = "models/lyria-realtime-exp";
const SEED_PROMPT: &str = "ambient electronic music with soft synth pads";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub bpm: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    pub temperature: f64,
}

/// One frame pulled from the upstream receive stream.
#[derive(Debug, Default, Clone)]
pub struct SessionFrame {
    pub audio_chunks: Vec<Bytes>,
    pub filtered_prompt: Option<String>,
}

/// Live duplex session with the generative-audio service.
#[async_trait]
pub trait MusicSession: Send + Sync {
    async fn set_music_generation_config(&self, config: GenerationConfig) -> Result<(), AudioError>;
    async fn set_weighted_prompts(&self, prompts: &[WeightedPrompt]) -> Result<(), AudioError>;
    async fn reset_context(&self) -> Result<(), AudioError>;
    async fn play(&self) -> Result<(), AudioError>;
    async fn stop(&self) -> Result<(), AudioError>;
    /// Next frame from the receive stream; `None` when the stream ends.
    async fn next_frame(&self) -> Result<Option<SessionFrame>, AudioError>;
}

#[async_trait]
pub trait MusicConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MusicSession>, AudioError>;
}

// ── Lyria realtime implementation ──────────────────────

pub struct LyriaConnector {
    api_key: String,
}

impl LyriaConnector {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl MusicConnector for LyriaConnector {
    async fn connect(&self) -> Result<Arc<dyn MusicSession>, AudioError> {
        let url = format!("{UPSTREAM_ENDPOINT}?key={}", self.api_key);
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (sink, source) = stream.split();
        let session = LyriaSession {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
        };
        session
            .send(&serde_json::json!({ "setup": { "model": UPSTREAM_MODEL } }))
            .await?;
        Ok(Arc::new(session))
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct LyriaSession {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
}

impl LyriaSession {
    async fn send(&self, message: &serde_json::Value) -> Result<(), AudioError> {
        let text = serde_json::to_string(message)?;
        self.sink.lock().await.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UpstreamFrame {
    server_content: Option<UpstreamContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UpstreamContent {
    audio_chunks: Vec<UpstreamChunk>,
    filtered_prompt: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    data: String,
}

#[async_trait]
impl MusicSession for LyriaSession {
    async fn set_music_generation_config(&self, config: GenerationConfig) -> Result<(), AudioError> {
        self.send(&serde_json::json!({ "musicGenerationConfig": config }))
            .await
    }

    async fn set_weighted_prompts(&self, prompts: &[WeightedPrompt]) -> Result<(), AudioError> {
        self.send(&serde_json::json!({ "weightedPrompts": prompts }))
            .await
    }

    async fn reset_context(&self) -> Result<(), AudioError> {
        self.send(&serde_json::json!({ "playbackControl": "RESET_CONTEXT" }))
            .await
    }

    async fn play(&self) -> Result<(), AudioError> {
        self.send(&serde_json::json!({ "playbackControl": "PLAY" }))
            .await
    }

    async fn stop(&self) -> Result<(), AudioError> {
        self.send(&serde_json::json!({ "playbackControl": "STOP" }))
            .await
    }

    async fn next_frame(&self) -> Result<Option<SessionFrame>, AudioError> {
        let mut source = self.source.lock().await;
        loop {
            let Some(message) = source.next().await else {
                return Ok(None);
            };
            match message? {
                WsMessage::Text(text) => {
                    let frame: UpstreamFrame = serde_json::from_str(text.as_str())?;
                    let Some(content) = frame.server_content else {
                        continue;
                    };
                    let mut chunks = Vec::new();
                    for chunk in content.audio_chunks {
                        if chunk.data.is_empty() {
                            continue;
                        }
                        match BASE64.decode(chunk.data.as_bytes()) {
                            Ok(bytes) => chunks.push(Bytes::from(bytes)),
                            Err(e) => tracing::warn!(error = %e, "undecodable audio chunk"),
                        }
                    }
                    let filtered = content.filtered_prompt.map(|v| v.to_string());
                    if chunks.is_empty() && filtered.is_none() {
                        continue;
                    }
                    return Ok(Some(SessionFrame {
                        audio_chunks: chunks,
                        filtered_prompt: filtered,
                    }));
                }
                WsMessage::Close(_) => return Err(AudioError::SessionClosed),
                _ => continue,
            }
        }
    }
}

// ── Per-room session management ────────────────────────

/// Tuning state remembered between updates. Guarded by an async mutex so tick
/// updates, applause overlays and drop pushes each apply as one full
/// configuration.
#[derive(Debug, Clone)]
struct Tuning {
    bpm: u16,
    target_bpm: u16,
    last_prompts: Vec<WeightedPrompt>,
}

struct SessionHandle {
    session: Arc<dyn MusicSession>,
    relay: JoinHandle<()>,
    tuning: Arc<Mutex<Tuning>>,
}

/// Owns one upstream streaming session per playing room and relays its audio
/// frames into the room's broadcast fan-out.
pub struct AudioService {
    connector: Arc<dyn MusicConnector>,
    rooms: Arc<RoomStore>,
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl AudioService {
    pub fn new(connector: Arc<dyn MusicConnector>, rooms: Arc<RoomStore>) -> Self {
        Self {
            connector,
            rooms,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.sessions.contains_key(room_id)
    }

    /// Open the upstream session for a room and start relaying audio.
    /// A no-op when a session already exists.
    pub async fn start_session(&self, room_id: &str, initial_bpm: u16) -> Result<(), AudioError> {
        if self.is_active(room_id) {
            tracing::debug!(room_id = %room_id, "session already active");
            return Ok(());
        }

        let session = self.connector.connect().await?;
        session
            .set_music_generation_config(GenerationConfig {
                bpm: initial_bpm,
                density: None,
                brightness: None,
                temperature: 1.0,
            })
            .await?;
        let seed = vec![WeightedPrompt::new(SEED_PROMPT, 1.0)];
        session.set_weighted_prompts(&seed).await?;
        session.play().await?;

        let relay = tokio::spawn(relay_loop(
            room_id.to_string(),
            session.clone(),
            self.rooms.clone(),
            self.sessions.clone(),
        ));

        self.sessions.insert(
            room_id.to_string(),
            SessionHandle {
                session,
                relay,
                tuning: Arc::new(Mutex::new(Tuning {
                    bpm: initial_bpm,
                    target_bpm: initial_bpm,
                    last_prompts: seed,
                })),
            },
        );
        tracing::info!(room_id = %room_id, bpm = initial_bpm, "upstream session started");
        Ok(())
    }

    /// Cancel the relay and close the upstream session. Tolerates rooms with
    /// no session.
    pub async fn stop_session(&self, room_id: &str) {
        let Some((_, handle)) = self.sessions.remove(room_id) else {
            return;
        };
        handle.relay.abort();
        if let Err(e) = handle.session.stop().await {
            tracing::warn!(room_id = %room_id, error = %e, "upstream stop failed");
        }
        tracing::info!(room_id = %room_id, "upstream session stopped");
    }

    /// Push a fresh configuration and prompt set upstream. The bpm moves at
    /// most [`MAX_BPM_STEP`] toward the requested target, and any actual bpm
    /// change resets the upstream context first (upstream contract).
    pub async fn update_prompts(
        &self,
        room_id: &str,
        prompts: &[WeightedPrompt],
        bpm: u16,
        density: f64,
        brightness: f64,
    ) -> Result<(), AudioError> {
        let Some((session, tuning)) = self.handle(room_id) else {
            tracing::debug!(room_id = %room_id, "no session for prompt update");
            return Ok(());
        };

        let mut tuning = tuning.lock().await;
        tuning.target_bpm = bpm;

        let last_bpm = tuning.bpm;
        let stepped = step_bpm(last_bpm, bpm);
        if stepped != last_bpm {
            tracing::debug!(
                room_id = %room_id,
                from = last_bpm,
                to = stepped,
                target = bpm,
                "bpm transition, resetting upstream context"
            );
            session.reset_context().await?;
        }

        session
            .set_music_generation_config(GenerationConfig {
                bpm: stepped,
                density: Some(density),
                brightness: Some(brightness),
                temperature: 1.0,
            })
            .await?;
        tuning.bpm = stepped;

        session.set_weighted_prompts(prompts).await?;
        tuning.last_prompts = prompts.to_vec();

        Ok(())
    }

    /// Prepend a crowd-energy overlay to the last base prompt and push it
    /// upstream immediately, leaving the bpm untouched. The remembered base
    /// prompts are not replaced, so the next overlay builds on the same base.
    pub async fn apply_overlay(
        &self,
        room_id: &str,
        overlay_text: &str,
        intensity: f64,
        density: f64,
        brightness: f64,
    ) -> Result<(), AudioError> {
        let Some((session, tuning)) = self.handle(room_id) else {
            return Ok(());
        };

        let tuning = tuning.lock().await;
        let Some(base) = tuning.last_prompts.first().cloned() else {
            return Ok(());
        };

        let overlay_weight = (0.25 + 0.5 * intensity).min(0.7);
        let prompts = vec![
            WeightedPrompt::new(overlay_text, overlay_weight),
            WeightedPrompt::new(base.text, 1.0 - overlay_weight),
        ];

        session
            .set_music_generation_config(GenerationConfig {
                bpm: tuning.bpm,
                density: Some(density),
                brightness: Some(brightness),
                temperature: 1.0,
            })
            .await?;
        session.set_weighted_prompts(&prompts).await?;
        Ok(())
    }

    fn handle(&self, room_id: &str) -> Option<(Arc<dyn MusicSession>, Arc<Mutex<Tuning>>)> {
        self.sessions
            .get(room_id)
            .map(|handle| (handle.session.clone(), handle.tuning.clone()))
    }
}

/// Step from `current` toward `target`, moving at most [`MAX_BPM_STEP`].
pub(crate) fn step_bpm(current: u16, target: u16) -> u16 {
    if target > current {
        current + (target - current).min(MAX_BPM_STEP)
    } else {
        current - (current - target).min(MAX_BPM_STEP)
    }
}

/// Pumps upstream frames into the room broadcast until the stream ends or
/// errors; an erroring stream evicts the session handle so the host can
/// restart, while the room itself stays up.
async fn relay_loop(
    room_id: String,
    session: Arc<dyn MusicSession>,
    rooms: Arc<RoomStore>,
    sessions: Arc<DashMap<String, SessionHandle>>,
) {
    tracing::debug!(room_id = %room_id, "audio relay started");
    loop {
        match session.next_frame().await {
            Ok(Some(frame)) => {
                for chunk in frame.audio_chunks {
                    rooms.broadcast_bytes(&room_id, chunk);
                }
                if let Some(filtered) = frame.filtered_prompt {
                    tracing::warn!(room_id = %room_id, prompt = %filtered, "upstream filtered a prompt");
                }
            }
            Ok(None) => {
                tracing::info!(room_id = %room_id, "upstream stream ended");
                break;
            }
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %e, "audio relay failed, evicting session");
                break;
            }
        }
    }
    sessions.remove(&room_id);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SessionCall {
        Config {
            bpm: u16,
            density: Option<f64>,
            brightness: Option<f64>,
        },
        Prompts(Vec<WeightedPrompt>),
        ResetContext,
        Play,
        Stop,
    }

    type FrameResult = Result<Option<SessionFrame>, AudioError>;

    /// Scripted session: records every control call and replays frames fed
    /// through the paired sender.
    pub struct MockSession {
        calls: StdMutex<Vec<SessionCall>>,
        frames: Mutex<mpsc::UnboundedReceiver<FrameResult>>,
        pub fail_config: AtomicBool,
    }

    impl MockSession {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<FrameResult>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    calls: StdMutex::new(Vec::new()),
                    frames: Mutex::new(rx),
                    fail_config: AtomicBool::new(false),
                }),
                tx,
            )
        }

        pub fn take_calls(&self) -> Vec<SessionCall> {
            std::mem::take(&mut self.calls.lock().unwrap())
        }

        fn record(&self, call: SessionCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl MusicSession for MockSession {
        async fn set_music_generation_config(
            &self,
            config: GenerationConfig,
        ) -> Result<(), AudioError> {
            if self.fail_config.load(Ordering::SeqCst) {
                return Err(AudioError::SessionClosed);
            }
            self.record(SessionCall::Config {
                bpm: config.bpm,
                density: config.density,
                brightness: config.brightness,
            });
            Ok(())
        }

        async fn set_weighted_prompts(&self, prompts: &[WeightedPrompt]) -> Result<(), AudioError> {
            self.record(SessionCall::Prompts(prompts.to_vec()));
            Ok(())
        }

        async fn reset_context(&self) -> Result<(), AudioError> {
            self.record(SessionCall::ResetContext);
            Ok(())
        }

        async fn play(&self) -> Result<(), AudioError> {
            self.record(SessionCall::Play);
            Ok(())
        }

        async fn stop(&self) -> Result<(), AudioError> {
            self.record(SessionCall::Stop);
            Ok(())
        }

        async fn next_frame(&self) -> Result<Option<SessionFrame>, AudioError> {
            match self.frames.lock().await.recv().await {
                Some(result) => result,
                None => Ok(None),
            }
        }
    }

    pub struct MockConnector {
        pub session: Arc<MockSession>,
        pub connects: AtomicUsize,
    }

    impl MockConnector {
        pub fn new(session: Arc<MockSession>) -> Arc<Self> {
            Arc::new(Self {
                session,
                connects: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MusicConnector for MockConnector {
        async fn connect(&self) -> Result<Arc<dyn MusicSession>, AudioError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.session.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use uuid::Uuid;

    use super::testing::{MockConnector, MockSession, SessionCall};
    use super::*;

    fn service(session: Arc<MockSession>) -> (AudioService, Arc<RoomStore>) {
        let rooms = Arc::new(RoomStore::new());
        (
            AudioService::new(MockConnector::new(session), rooms.clone()),
            rooms,
        )
    }

    #[test]
    fn step_bpm_moves_at_most_ten() {
        assert_eq!(step_bpm(100, 140), 110);
        assert_eq!(step_bpm(140, 100), 130);
        assert_eq!(step_bpm(100, 105), 105);
        assert_eq!(step_bpm(100, 100), 100);
    }

    #[tokio::test]
    async fn start_session_configures_seeds_and_plays() {
        let (session, _frames) = MockSession::new();
        let (service, _rooms) = service(session.clone());

        service.start_session("R1", 100).await.unwrap();

        let calls = session.take_calls();
        assert_eq!(
            calls[0],
            SessionCall::Config {
                bpm: 100,
                density: None,
                brightness: None
            }
        );
        assert!(matches!(&calls[1], SessionCall::Prompts(p) if p[0].text == SEED_PROMPT));
        assert_eq!(calls[2], SessionCall::Play);
        assert!(service.is_active("R1"));
    }

    #[tokio::test]
    async fn start_session_is_idempotent() {
        let (session, _frames) = MockSession::new();
        let connector = MockConnector::new(session);
        let service = AudioService::new(connector.clone(), Arc::new(RoomStore::new()));

        service.start_session("R1", 100).await.unwrap();
        service.start_session("R1", 100).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bpm_smoothing_walks_to_the_target() {
        let (session, _frames) = MockSession::new();
        let (service, _rooms) = service(session.clone());
        service.start_session("R1", 100).await.unwrap();
        session.take_calls();

        let prompts = vec![WeightedPrompt::new("driving techno", 1.0)];
        for expected in [110u16, 120, 130, 140] {
            service
                .update_prompts("R1", &prompts, 140, 0.6, 0.4)
                .await
                .unwrap();
            let calls = session.take_calls();
            assert_eq!(calls[0], SessionCall::ResetContext, "step to {expected}");
            assert_eq!(
                calls[1],
                SessionCall::Config {
                    bpm: expected,
                    density: Some(0.6),
                    brightness: Some(0.4)
                }
            );
            assert!(matches!(&calls[2], SessionCall::Prompts(p) if p == &prompts));
        }

        // At the target no further context reset happens.
        service
            .update_prompts("R1", &prompts, 140, 0.6, 0.4)
            .await
            .unwrap();
        let calls = session.take_calls();
        assert!(!calls.contains(&SessionCall::ResetContext));
    }

    #[tokio::test]
    async fn failed_update_keeps_prior_bpm() {
        let (session, _frames) = MockSession::new();
        let (service, _rooms) = service(session.clone());
        service.start_session("R1", 100).await.unwrap();
        session.take_calls();

        session.fail_config.store(true, Ordering::SeqCst);
        let prompts = vec![WeightedPrompt::new("x", 1.0)];
        assert!(service
            .update_prompts("R1", &prompts, 140, 0.5, 0.5)
            .await
            .is_err());

        session.fail_config.store(false, Ordering::SeqCst);
        service
            .update_prompts("R1", &prompts, 140, 0.5, 0.5)
            .await
            .unwrap();
        let calls = session.take_calls();
        // Still stepping from 100, not from a half-applied 110.
        assert!(calls.contains(&SessionCall::Config {
            bpm: 110,
            density: Some(0.5),
            brightness: Some(0.5)
        }));
    }

    #[tokio::test]
    async fn overlay_reuses_the_base_prompt_without_touching_bpm() {
        let (session, _frames) = MockSession::new();
        let (service, _rooms) = service(session.clone());
        service.start_session("R1", 100).await.unwrap();

        let base = vec![WeightedPrompt::new("warm lo-fi groove", 1.0)];
        service
            .update_prompts("R1", &base, 100, 0.5, 0.5)
            .await
            .unwrap();
        session.take_calls();

        service
            .apply_overlay("R1", "surging crowd energy", 1.0, 0.8, 0.6)
            .await
            .unwrap();

        let calls = session.take_calls();
        assert!(!calls.contains(&SessionCall::ResetContext));
        assert_eq!(
            calls[0],
            SessionCall::Config {
                bpm: 100,
                density: Some(0.8),
                brightness: Some(0.6)
            }
        );
        match &calls[1] {
            SessionCall::Prompts(prompts) => {
                assert_eq!(prompts.len(), 2);
                assert_eq!(prompts[0].text, "surging crowd energy");
                assert!((prompts[0].weight - 0.7).abs() < 1e-9);
                assert_eq!(prompts[1].text, "warm lo-fi groove");
                assert!((prompts[1].weight - 0.3).abs() < 1e-9);
            }
            other => panic!("unexpected call: {other:?}"),
        }

        // A later overlay still builds on the tick's base prompt.
        service
            .apply_overlay("R1", "soft mellow textures", 0.0, 0.3, 0.3)
            .await
            .unwrap();
        let calls = session.take_calls();
        match &calls[1] {
            SessionCall::Prompts(prompts) => assert_eq!(prompts[1].text, "warm lo-fi groove"),
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_without_session_is_a_noop() {
        let (session, _frames) = MockSession::new();
        let (service, _rooms) = service(session.clone());
        service
            .update_prompts("NOPE", &[WeightedPrompt::new("x", 1.0)], 120, 0.5, 0.5)
            .await
            .unwrap();
        assert!(session.take_calls().is_empty());
    }

    #[tokio::test]
    async fn stop_session_tolerates_absent_rooms() {
        let (session, _frames) = MockSession::new();
        let (service, _rooms) = service(session);
        service.stop_session("NOPE").await;
    }

    #[tokio::test]
    async fn relay_broadcasts_chunks_and_evicts_on_error() {
        let (session, frames) = MockSession::new();
        let (service, rooms) = service(session.clone());

        let room_id = rooms.create_room("host", "dev", "");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        rooms.register_connection(&room_id, Uuid::now_v7(), tx);

        service.start_session(&room_id, 100).await.unwrap();

        frames
            .send(Ok(Some(SessionFrame {
                audio_chunks: vec![Bytes::from_static(b"pcm")],
                filtered_prompt: None,
            })))
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("relay should forward audio")
            .unwrap();
        match frame {
            axum::extract::ws::Message::Binary(data) => assert_eq!(&data[..], b"pcm"),
            other => panic!("unexpected frame: {other:?}"),
        }

        frames.send(Err(AudioError::SessionClosed)).unwrap();
        for _ in 0..100 {
            if !service.is_active(&room_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!service.is_active(&room_id));
        // The room itself survives for a restart.
        assert!(rooms.snapshot(&room_id, None).is_some());
    }
}
