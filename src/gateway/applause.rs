use crate::types::entities::Zone;

const HIGH_THRESHOLD: f64 = 0.55;
const LOW_THRESHOLD: f64 = 0.25;
/// LOW-zone decay never pulls the knobs below this.
const LOW_FLOOR: f64 = 0.05;

pub const HIGH_OVERLAY_PROMPT: &str =
    "explosive crowd energy with driving percussion, soaring leads, and euphoric builds";
pub const LOW_OVERLAY_PROMPT: &str =
    "soft mellow textures with gentle pads, sparse percussion, and a hushed atmosphere";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApplauseReading {
    pub volume: f64,
    pub clap_rate: f64,
    pub intensity: f64,
    pub zone: Zone,
}

/// Fold microphone volume and clap rate into one intensity and zone. The
/// square root lifts quiet rooms so soft applause still registers.
pub fn classify(volume: f64, clap_rate: f64) -> ApplauseReading {
    let volume = volume.clamp(0.0, 1.0);
    let clap_rate = clap_rate.clamp(0.0, 1.0);
    let vol_signal = volume.sqrt();
    let intensity = 0.5 * vol_signal + 0.5 * clap_rate;
    let zone = if intensity > HIGH_THRESHOLD {
        Zone::High
    } else if intensity < LOW_THRESHOLD {
        Zone::Low
    } else {
        Zone::Mid
    };
    ApplauseReading {
        volume,
        clap_rate,
        intensity,
        zone,
    }
}

/// Per-zone knob rules. HIGH lifts both knobs with the intensity, LOW decays
/// them toward a floor, MID eases them toward the intensity.
pub fn adjust_knobs(reading: ApplauseReading, density: f64, brightness: f64) -> (f64, f64) {
    match reading.zone {
        Zone::High => (
            (density + 0.10 + 0.10 * reading.intensity).min(1.0),
            (brightness + 0.06 + 0.06 * reading.intensity).min(1.0),
        ),
        Zone::Low => (
            (density - 0.07).max(LOW_FLOOR),
            (brightness - 0.04).max(LOW_FLOOR),
        ),
        Zone::Mid => (
            (0.85 * density + 0.15 * reading.intensity).clamp(0.0, 1.0),
            (0.90 * brightness + 0.10 * reading.intensity).clamp(0.0, 1.0),
        ),
    }
}

/// Overlay prompt pushed between ticks; MID applause only nudges the knobs.
pub fn overlay_prompt(zone: Zone) -> Option<&'static str> {
    match zone {
        Zone::High => Some(HIGH_OVERLAY_PROMPT),
        Zone::Low => Some(LOW_OVERLAY_PROMPT),
        Zone::Mid => None,
    }
}
