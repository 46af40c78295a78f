use serde::{Deserialize, Serialize};

// ── Roles ──────────────────────────────────────────────

/// The five crowd-control roles. The first four are exclusive within a room;
/// any number of participants may hold `Energy` once the primaries are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Drummer,
    VibeSetter,
    GenreDj,
    Instrumentalist,
    Energy,
}

impl Role {
    /// Assignment order for newcomers; `Energy` is the overflow role.
    pub const PRIMARY: [Role; 4] = [
        Role::Drummer,
        Role::VibeSetter,
        Role::GenreDj,
        Role::Instrumentalist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Drummer => "drummer",
            Role::VibeSetter => "vibe_setter",
            Role::GenreDj => "genre_dj",
            Role::Instrumentalist => "instrumentalist",
            Role::Energy => "energy",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "drummer" => Some(Role::Drummer),
            "vibe_setter" => Some(Role::VibeSetter),
            "genre_dj" => Some(Role::GenreDj),
            "instrumentalist" => Some(Role::Instrumentalist),
            "energy" => Some(Role::Energy),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Crowd inputs ───────────────────────────────────────

/// Sparse per-role control payload. Only the fields relevant to the sender's
/// role are read; unknown keys are dropped at parse time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
}

impl InputPayload {
    /// Short human-readable summary for timelines and oracle input lines.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(bpm) = self.bpm {
            parts.push(format!("bpm: {bpm}"));
        }
        if let Some(mood) = &self.mood {
            parts.push(format!("mood: {mood}"));
        }
        if let Some(genre) = &self.genre {
            parts.push(format!("genre: {genre}"));
        }
        if let Some(instrument) = &self.instrument {
            parts.push(format!("instrument: {instrument}"));
        }
        if let Some(density) = self.density {
            parts.push(format!("density: {density}"));
        }
        if let Some(brightness) = self.brightness {
            parts.push(format!("brightness: {brightness}"));
        }
        if let Some(custom) = &self.custom_prompt {
            parts.push(format!("\"{custom}\""));
        }
        parts.join(", ")
    }
}

// ── Arbitration ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPrompt {
    pub text: String,
    pub weight: f64,
}

impl WeightedPrompt {
    pub fn new(text: impl Into<String>, weight: f64) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

/// One round of input arbitration: the weighted prompt set plus the musical
/// knobs the crowd has converged on.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitrationResult {
    pub prompts: Vec<WeightedPrompt>,
    pub bpm: u16,
    pub density: f64,
    pub brightness: f64,
    pub reasoning: String,
}

// ── Room records ───────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub role: Role,
    pub display_name: String,
    pub is_host: bool,
}

/// Timestamped room event, kept in a bounded ring per room.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    pub time: f64,
    pub source: String,
    pub text: String,
}

/// Lobby listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room_id: String,
    pub room_name: String,
    pub member_count: usize,
    pub is_playing: bool,
    pub host_device: String,
    pub roles_taken: Vec<Role>,
}

// ── Applause ───────────────────────────────────────────

/// Discrete crowd-applause intensity band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Zone {
    High,
    Mid,
    Low,
}
