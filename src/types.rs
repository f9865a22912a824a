// src/types.rs

//! Core data model shared between the control surface and the audio engine.
//! Everything here is plain serializable state; the live DSP counterparts
//! live in `channel.rs`, `eq.rs` and friends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instantaneous level measurement for a channel or the master bus.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioLevel {
    pub peak: f32,
    pub rms: f32,
    pub clipping: bool,
}

impl AudioLevel {
    pub fn silent() -> Self {
        Self::default()
    }
}

/// Three-band tone control settings. Gains are in dB, frequencies in Hz.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct EqSettings {
    pub enabled: bool,
    pub low_gain: f32,
    pub mid_gain: f32,
    pub high_gain: f32,
    pub low_freq: f32,
    pub mid_freq: f32,
    pub high_freq: f32,
}

impl Default for EqSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            low_gain: 0.0,
            mid_gain: 0.0,
            high_gain: 0.0,
            low_freq: 200.0,
            mid_freq: 1000.0,
            high_freq: 8000.0,
        }
    }
}

/// Filter shape of a single parametric EQ band.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BandKind {
    Highpass,
    Lowpass,
    Bandpass,
    Lowshelf,
    Highshelf,
    Peaking,
    Notch,
}

impl BandKind {
    pub const ALL: [BandKind; 7] = [
        BandKind::Highpass,
        BandKind::Lowpass,
        BandKind::Bandpass,
        BandKind::Lowshelf,
        BandKind::Highshelf,
        BandKind::Peaking,
        BandKind::Notch,
    ];
}

impl fmt::Display for BandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandKind::Highpass => write!(f, "High Pass"),
            BandKind::Lowpass => write!(f, "Low Pass"),
            BandKind::Bandpass => write!(f, "Band Pass"),
            BandKind::Lowshelf => write!(f, "Low Shelf"),
            BandKind::Highshelf => write!(f, "High Shelf"),
            BandKind::Peaking => write!(f, "Peaking"),
            BandKind::Notch => write!(f, "Notch"),
        }
    }
}

/// One parametric EQ band. Frequency 20..20000 Hz, gain roughly +/-15 dB,
/// Q 0.1..10.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EqBand {
    pub id: String,
    pub kind: BandKind,
    pub frequency: f32,
    pub gain: f32,
    pub q: f32,
    pub enabled: bool,
}

impl EqBand {
    pub fn new(id: impl Into<String>, kind: BandKind, frequency: f32) -> Self {
        Self {
            id: id.into(),
            kind,
            frequency,
            gain: 0.0,
            q: 0.7,
            enabled: true,
        }
    }
}

/// The insert effect types a channel chain can host.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Reverb,
    Delay,
    Compressor,
    Distortion,
    Chorus,
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectKind::Reverb => write!(f, "Reverb"),
            EffectKind::Delay => write!(f, "Delay"),
            EffectKind::Compressor => write!(f, "Compressor"),
            EffectKind::Distortion => write!(f, "Distortion"),
            EffectKind::Chorus => write!(f, "Chorus"),
        }
    }
}

/// Serializable description of one insert effect: its type plus a bag of
/// named parameter values. The live processor is built from this recipe.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Effect {
    pub id: String,
    pub kind: EffectKind,
    pub enabled: bool,
    pub parameters: std::collections::BTreeMap<String, f32>,
}

impl Effect {
    pub fn new(id: impl Into<String>, kind: EffectKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            parameters: std::collections::BTreeMap::new(),
        }
    }
}

/// An ordered chain of insert effects plus the overall send/return mix.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct EffectChainSettings {
    pub effects: Vec<Effect>,
    pub wet_dry_mix: f32,
}

/// Where a channel pulls its signal from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputSource {
    Microphone { device_id: String },
    File { path: String },
}

/// Full state of one mixer channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AudioChannel {
    pub id: String,
    pub name: String,
    pub gain: f32,
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
    pub eq: EqSettings,
    pub effects: EffectChainSettings,
    pub input_source: Option<InputSource>,
    pub level: AudioLevel,
}

impl Default for AudioChannel {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            gain: 0.75,
            pan: 0.0,
            muted: false,
            solo: false,
            eq: EqSettings::default(),
            effects: EffectChainSettings::default(),
            input_source: None,
            level: AudioLevel::silent(),
        }
    }
}

impl AudioChannel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A partial update to a channel; `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct ChannelUpdate {
    pub gain: Option<f32>,
    pub pan: Option<f32>,
    pub muted: Option<bool>,
    pub solo: Option<bool>,
    pub eq: Option<EqSettings>,
    pub wet_dry_mix: Option<f32>,
}

/// Master-bus limiter settings.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct LimiterSettings {
    pub enabled: bool,
    /// Threshold in dB.
    pub threshold: f32,
    pub ratio: f32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: -3.0,
            ratio: 4.0,
        }
    }
}

/// Master bus state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MasterSection {
    pub main_gain: f32,
    pub headphone_gain: f32,
    pub muted: bool,
    pub level: AudioLevel,
    pub limiter: LimiterSettings,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            main_gain: 0.8,
            headphone_gain: 0.7,
            muted: false,
            level: AudioLevel::silent(),
            limiter: LimiterSettings::default(),
        }
    }
}

/// Everything a project file stores: the mixer layout plus engine config.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectSettings {
    pub name: String,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub channels: Vec<AudioChannel>,
    pub master: MasterSection,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        let now = chrono::Utc::now();
        Self {
            name: "Untitled Project".to_string(),
            sample_rate: 44100,
            buffer_size: 512,
            channels: (1..=4)
                .map(|i| AudioChannel::new(format!("channel-{}", i), format!("Channel {}", i)))
                .collect(),
            master: MasterSection::default(),
            created_at: now,
            modified_at: now,
        }
    }
}

pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-6).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trip() {
        for db in [-60.0, -12.0, -3.0, 0.0, 6.0] {
            let lin = db_to_linear(db);
            assert!((linear_to_db(lin) - db).abs() < 1e-3);
        }
    }

    #[test]
    fn channel_defaults_match_project_template() {
        let ch = AudioChannel::new("channel-1", "Channel 1");
        assert_eq!(ch.gain, 0.75);
        assert_eq!(ch.pan, 0.0);
        assert!(ch.eq.enabled);
        assert_eq!(ch.eq.high_freq, 8000.0);
        assert!(ch.effects.effects.is_empty());
    }

    #[test]
    fn project_settings_json_round_trip() {
        let project = ProjectSettings::default();
        let json = serde_json::to_string(&project).unwrap();
        let back: ProjectSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channels.len(), 4);
        assert_eq!(back, project);
    }
}
