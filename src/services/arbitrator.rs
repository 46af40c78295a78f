use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::OracleError;
use crate::types::entities::{ArbitrationResult, InputPayload, Role, WeightedPrompt};

const ORACLE_MODEL: &str = "gemini-2.5-flash";
const ORACLE_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const ARBITRATION_SYSTEM_PROMPT: &str = r#"
You are a real-time music director for a crowd-controlled generative music system.
Every few seconds you receive inputs from multiple people each controlling a different
dimension of the music. Your job is to synthesize their inputs into 2-3 weighted
prompts that:
1. Honor the dominant crowd preference
2. Blend conflicting inputs musically coherently
3. Maintain energy continuity - don't flip completely from one style to another in one step
4. Keep prompts descriptive: include genre, instruments, mood, and energy level

Always return ONLY valid JSON - no markdown, no backticks, no explanation outside JSON.
Exact format:
{
  "prompts": [
    { "text": "...", "weight": 0.6 },
    { "text": "...", "weight": 0.4 }
  ],
  "bpm": 100,
  "density": 0.5,
  "brightness": 0.5,
  "reasoning": "one sentence"
}

Rules:
- 2 or 3 prompts max
- Weights must sum exactly to 1.0
- bpm must be an integer between 60 and 160
- density must be a decimal float between 0.0 and 1.0 (e.g. 0.7, not "High")
- brightness must be a decimal float between 0.0 and 1.0 (e.g. 0.3, not "Low")
- Prompt text should be evocative and musical (e.g. "dark trap beat with heavy 808s and eerie synths")
"#;

const DEFAULT_PROMPT: &str = "ambient electronic music with soft synth pads";

fn default_result() -> ArbitrationResult {
    ArbitrationResult {
        prompts: vec![WeightedPrompt::new(DEFAULT_PROMPT, 1.0)],
        bpm: 100,
        density: 0.5,
        brightness: 0.5,
        reasoning: "Default fallback".into(),
    }
}

/// One request/response round with the external arbitrator.
#[async_trait]
pub trait ArbitrationOracle: Send + Sync {
    async fn generate(&self, system_instruction: &str, user_text: &str)
        -> Result<String, OracleError>;
}

// ── Gemini implementation ──────────────────────────────

pub struct GeminiOracle {
    http: reqwest::Client,
    api_key: String,
}

impl GeminiOracle {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ArbitrationOracle for GeminiOracle {
    async fn generate(
        &self,
        system_instruction: &str,
        user_text: &str,
    ) -> Result<String, OracleError> {
        let url = format!("{ORACLE_ENDPOINT}/models/{ORACLE_MODEL}:generateContent");
        let body = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_text }] }],
            "generationConfig": { "temperature": 0.7, "maxOutputTokens": 2000 },
        });

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GenerateContentResponse>()
            .await?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(OracleError::EmptyResponse);
        }
        Ok(text)
    }
}

// ── Arbitration client ─────────────────────────────────

/// Turns a snapshot of crowd inputs into weighted prompts plus musical knobs,
/// caching the previous result per room for continuity and fallback.
pub struct Arbitrator {
    oracle: Arc<dyn ArbitrationOracle>,
    last_results: DashMap<String, ArbitrationResult>,
}

impl Arbitrator {
    pub fn new(oracle: Arc<dyn ArbitrationOracle>) -> Self {
        Self {
            oracle,
            last_results: DashMap::new(),
        }
    }

    /// Drop the cached result for a destroyed room.
    pub fn forget_room(&self, room_id: &str) {
        self.last_results.remove(room_id);
    }

    /// Arbitrate one tick's inputs. Parse trouble retries once and then falls
    /// back to the previous result; a transport error surfaces to the caller.
    pub async fn arbitrate(
        &self,
        room_id: &str,
        inputs: &BTreeMap<Role, InputPayload>,
        bpm: u16,
        density: f64,
        brightness: f64,
    ) -> Result<ArbitrationResult, OracleError> {
        let previous = self.last_results.get(room_id).map(|r| r.clone());

        if inputs.is_empty() {
            return Ok(previous.unwrap_or_else(default_result));
        }

        let user_text = format_inputs(inputs, bpm, density, brightness, previous.as_ref());

        let mut parsed = None;
        for attempt in 0..2u8 {
            let raw = self
                .oracle
                .generate(ARBITRATION_SYSTEM_PROMPT, &user_text)
                .await?;
            match parse_arbitration(&raw) {
                Ok(result) => {
                    parsed = Some(result);
                    break;
                }
                Err(e) => {
                    tracing::warn!(room_id = %room_id, attempt, error = %e, "arbitration reply did not parse");
                }
            }
        }

        let mut result = match parsed {
            Some(result) => result,
            None => previous.unwrap_or_else(default_result),
        };

        // The drummer's tempo wins outright when present.
        if let Some(drummer_bpm) = inputs.get(&Role::Drummer).and_then(|p| p.bpm) {
            result.bpm = clamp_bpm(drummer_bpm);
            tracing::debug!(room_id = %room_id, bpm = result.bpm, "bpm locked to drummer input");
        }

        self.last_results.insert(room_id.to_string(), result.clone());
        tracing::info!(room_id = %room_id, bpm = result.bpm, reasoning = %result.reasoning, "arbitration complete");
        Ok(result)
    }
}

fn clamp_bpm(bpm: i64) -> u16 {
    bpm.clamp(60, 200) as u16
}

#[derive(Debug, Deserialize)]
struct RawArbitration {
    prompts: Vec<WeightedPrompt>,
    bpm: i64,
    density: f64,
    brightness: f64,
    #[serde(default)]
    reasoning: String,
}

fn parse_arbitration(raw: &str) -> anyhow::Result<ArbitrationResult> {
    let data: RawArbitration = serde_json::from_str(strip_code_fences(raw))?;
    if data.prompts.is_empty() {
        anyhow::bail!("no prompts in arbitration reply");
    }

    let mut prompts = data.prompts;
    let total: f64 = prompts.iter().map(|p| p.weight).sum();
    if total > 0.0 {
        for p in &mut prompts {
            p.weight = (p.weight / total * 1000.0).round() / 1000.0;
        }
    }

    Ok(ArbitrationResult {
        prompts,
        bpm: clamp_bpm(data.bpm),
        density: data.density.clamp(0.0, 1.0),
        brightness: data.brightness.clamp(0.0, 1.0),
        reasoning: data.reasoning,
    })
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}

fn format_inputs(
    inputs: &BTreeMap<Role, InputPayload>,
    bpm: u16,
    density: f64,
    brightness: f64,
    previous: Option<&ArbitrationResult>,
) -> String {
    let mut lines = vec!["Current crowd inputs:".to_string()];
    for (role, payload) in inputs {
        lines.push(format!("  - {role}: {}", payload.summary()));
    }
    lines.push(format!(
        "\nCurrent music state: BPM={bpm}, density={density:.2}, brightness={brightness:.2}"
    ));
    if let Some(previous) = previous {
        lines.push("\nPrevious prompts (maintain continuity from these):".to_string());
        for p in &previous.prompts {
            lines.push(format!("  - \"{}\" (weight {:.2})", p.text, p.weight));
        }
    }
    lines.push("\nSynthesize 2-3 new weighted prompts that smoothly evolve from the previous ones.".to_string());
    lines.join("\n")
}
