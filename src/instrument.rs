// src/instrument.rs

//! Virtual instruments: a polyphonic subtractive synthesizer with ADSR
//! envelopes, per-voice filters, oldest-first voice stealing, and a preset
//! system that rides the same parameter path as live control changes.

use crate::error::EngineError;
use crate::midi::MidiMessage;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::fmt;

/// Polyphony ceiling per instrument.
pub const MAX_VOICES: usize = 16;

// Extra release margin before a voice is torn down, in seconds.
const RELEASE_CLEANUP_MARGIN: f32 = 0.1;

// Equal-tempered note frequencies, A4 = 440 Hz.
static NOTE_FREQ: Lazy<[f32; 128]> = Lazy::new(|| {
    let mut table = [0.0f32; 128];
    for (note, slot) in table.iter_mut().enumerate() {
        *slot = 440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0);
    }
    table
});

pub fn note_to_frequency(note: u8) -> f32 {
    NOTE_FREQ[(note as usize).min(127)]
}

// --- Envelope ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AdsrSettings {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrSettings {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.3,
            sustain: 0.7,
            release: 0.5,
        }
    }
}

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum AdsrState {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Linear ADSR. Retriggering restarts the attack from the current level so
/// stolen or re-gated voices never click.
#[derive(Clone, Copy, Debug)]
pub struct Adsr {
    pub settings: AdsrSettings,
    pub state: AdsrState,
    current_level: f32,
    sample_rate: f32,
}

impl Adsr {
    pub fn new(settings: AdsrSettings, sample_rate: f32) -> Self {
        Self {
            settings,
            state: AdsrState::Idle,
            current_level: 0.0,
            sample_rate,
        }
    }

    pub fn set_settings(&mut self, settings: AdsrSettings) {
        self.settings = settings;
    }

    pub fn note_on(&mut self) {
        self.state = AdsrState::Attack;
    }

    pub fn note_off(&mut self) {
        if self.state != AdsrState::Idle {
            self.state = AdsrState::Release;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == AdsrState::Idle
    }

    pub fn level(&self) -> f32 {
        self.current_level
    }

    pub fn process(&mut self) -> f32 {
        match self.state {
            AdsrState::Idle => 0.0,
            AdsrState::Attack => {
                if self.settings.attack > 0.0 {
                    let attack_rate = 1.0 / (self.settings.attack * self.sample_rate);
                    self.current_level += attack_rate;
                } else {
                    self.current_level = 1.0;
                }
                if self.current_level >= 1.0 {
                    self.current_level = 1.0;
                    self.state = AdsrState::Decay;
                }
                self.current_level
            }
            AdsrState::Decay => {
                if self.settings.decay > 0.0 {
                    let decay_rate =
                        (1.0 - self.settings.sustain) / (self.settings.decay * self.sample_rate);
                    self.current_level -= decay_rate;
                } else {
                    self.current_level = self.settings.sustain;
                }
                if self.current_level <= self.settings.sustain {
                    self.current_level = self.settings.sustain;
                    self.state = AdsrState::Sustain;
                }
                self.current_level
            }
            AdsrState::Sustain => self.settings.sustain,
            AdsrState::Release => {
                if self.settings.release > 0.0 {
                    let release_rate =
                        self.current_level / (self.settings.release * self.sample_rate);
                    self.current_level -= release_rate;
                } else {
                    self.current_level = 0.0;
                }
                if self.current_level <= 0.0 {
                    self.current_level = 0.0;
                    self.state = AdsrState::Idle;
                }
                self.current_level
            }
        }
    }
}

// --- Voice building blocks ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum Waveform {
    Sawtooth,
    Triangle,
    Square,
    Sine,
}

impl Waveform {
    pub const ALL: [Waveform; 4] = [
        Waveform::Sawtooth,
        Waveform::Triangle,
        Waveform::Square,
        Waveform::Sine,
    ];

    fn from_normalized(value: f32) -> Self {
        let index = (value.clamp(0.0, 1.0) * 3.0).floor() as usize;
        Self::ALL[index.min(3)]
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Waveform::Sawtooth => write!(f, "Sawtooth"),
            Waveform::Triangle => write!(f, "Triangle"),
            Waveform::Square => write!(f, "Square"),
            Waveform::Sine => write!(f, "Sine"),
        }
    }
}

/// State-variable lowpass, one per voice.
#[derive(Clone, Copy, Debug, Default)]
struct VoiceFilter {
    z1: f32,
    z2: f32,
}

impl VoiceFilter {
    #[inline]
    fn process(&mut self, input: f32, cutoff_hz: f32, resonance: f32, sample_rate: f32) -> f32 {
        let g = (std::f32::consts::PI * cutoff_hz.clamp(20.0, sample_rate * 0.45) / sample_rate)
            .tan();
        // Map resonance 0.1..30 into a k damping factor below self-oscillation.
        let k = 2.0 - 2.0 * (resonance / 30.0).clamp(0.0, 0.99);

        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        let a3 = g * a2;

        let v3 = input - self.z2;
        let v1 = a1 * self.z1 + a2 * v3;
        let v2 = self.z2 + a2 * self.z1 + a3 * v3;
        self.z1 = 2.0 * v1 - self.z1;
        self.z2 = 2.0 * v2 - self.z2;
        v2
    }
}

/// One sounding note: oscillator -> filter -> envelope gain.
pub struct Voice {
    pub id: String,
    pub note: u8,
    pub velocity: u8,
    /// Sample-clock time of the (latest) trigger.
    pub started_at: u64,
    sequence: u64,
    phase: f32,
    waveform: Waveform,
    cutoff_hz: f32,
    resonance: f32,
    detune_cents: f32,
    filter: VoiceFilter,
    adsr: Adsr,
    /// Sample-clock deadline after which a released voice is torn down.
    release_deadline: Option<u64>,
}

impl Voice {
    fn is_held(&self) -> bool {
        self.release_deadline.is_none()
    }

    #[inline]
    fn render(&mut self, sample_rate: f32) -> f32 {
        let detune_factor = 2.0_f32.powf(self.detune_cents / 1200.0);
        let freq = note_to_frequency(self.note) * detune_factor;
        self.phase = (self.phase + freq / sample_rate).fract();

        let raw = match self.waveform {
            Waveform::Sine => (self.phase * TAU).sin(),
            Waveform::Sawtooth => 2.0 * self.phase - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * (self.phase - 0.5).abs(),
            Waveform::Square => {
                if self.phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        };

        let filtered = self
            .filter
            .process(raw, self.cutoff_hz, self.resonance, sample_rate);
        filtered * self.adsr.process() * (self.velocity as f32 / 127.0)
    }
}

// --- Synthesizer ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SynthParams {
    pub oscillator: Waveform,
    pub filter_frequency: f32,
    pub filter_resonance: f32,
    pub envelope: AdsrSettings,
    pub volume: f32,
    pub detune: f32,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self {
            oscillator: Waveform::Sawtooth,
            filter_frequency: 2000.0,
            filter_resonance: 1.0,
            envelope: AdsrSettings::default(),
            volume: 0.3,
            detune: 0.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InstrumentPreset {
    pub id: String,
    pub name: String,
    /// Normalized 0..1 values, applied through `update_parameter`.
    pub parameters: BTreeMap<String, f32>,
}

fn preset(id: &str, name: &str, values: &[(&str, f32)]) -> InstrumentPreset {
    InstrumentPreset {
        id: id.to_string(),
        name: name.to_string(),
        parameters: values
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
    }
}

pub struct SynthesizerInstrument {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub current_preset: Option<String>,
    params: SynthParams,
    presets: Vec<InstrumentPreset>,
    voices: Vec<Voice>,
    sample_rate: f32,
    sample_clock: u64,
    next_voice_seq: u64,
}

impl SynthesizerInstrument {
    pub fn new(id: impl Into<String>, name: impl Into<String>, sample_rate: f32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            current_preset: None,
            params: SynthParams::default(),
            presets: vec![
                preset(
                    "lead",
                    "Lead Synth",
                    &[
                        ("oscillator_type", 0.0),
                        ("filter_frequency", 0.35),
                        ("filter_resonance", 0.063),
                        ("attack", 0.005),
                        ("decay", 0.1),
                        ("sustain", 0.8),
                        ("release", 0.1),
                        ("volume", 0.4),
                    ],
                ),
                preset(
                    "pad",
                    "Warm Pad",
                    &[
                        ("oscillator_type", 0.34),
                        ("filter_frequency", 0.16),
                        ("filter_resonance", 0.013),
                        ("attack", 0.25),
                        ("decay", 0.4),
                        ("sustain", 0.9),
                        ("release", 0.5),
                        ("volume", 0.3),
                    ],
                ),
                preset(
                    "bass",
                    "Bass Synth",
                    &[
                        ("oscillator_type", 0.67),
                        ("filter_frequency", 0.075),
                        ("filter_resonance", 0.097),
                        ("attack", 0.0005),
                        ("decay", 0.05),
                        ("sustain", 0.6),
                        ("release", 0.067),
                        ("volume", 0.5),
                    ],
                ),
                preset(
                    "pluck",
                    "Pluck",
                    &[
                        ("oscillator_type", 0.0),
                        ("filter_frequency", 0.475),
                        ("filter_resonance", 0.03),
                        ("attack", 0.0005),
                        ("decay", 0.025),
                        ("sustain", 0.1),
                        ("release", 0.033),
                        ("volume", 0.4),
                    ],
                ),
            ],
            voices: Vec::with_capacity(MAX_VOICES),
            sample_rate,
            sample_clock: 0,
            next_voice_seq: 0,
        }
    }

    pub fn params(&self) -> &SynthParams {
        &self.params
    }

    pub fn presets(&self) -> &[InstrumentPreset] {
        &self.presets
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn active_notes(&self) -> Vec<u8> {
        self.voices.iter().map(|v| v.note).collect()
    }

    pub fn process_midi(&mut self, message: &MidiMessage) {
        if !self.enabled {
            return;
        }
        match message {
            MidiMessage::NoteOn { note, velocity, .. } => self.note_on(*note, *velocity),
            MidiMessage::NoteOff { note, .. } => self.note_off(*note),
            MidiMessage::ControlChange {
                controller, value, ..
            } => self.handle_control_change(*controller, *value),
            _ => {}
        }
    }

    pub fn note_on(&mut self, note: u8, velocity: u8) {
        // Re-trigger an existing voice for this pitch: cancel any pending
        // release teardown instead of racing it with a fresh voice.
        if let Some(voice) = self.voices.iter_mut().find(|v| v.note == note) {
            voice.release_deadline = None;
            voice.velocity = velocity;
            voice.started_at = self.sample_clock;
            voice.adsr.set_settings(self.params.envelope);
            voice.adsr.note_on();
            return;
        }

        if self.voices.len() >= MAX_VOICES {
            self.steal_oldest_voice();
        }

        let mut adsr = Adsr::new(self.params.envelope, self.sample_rate);
        adsr.note_on();
        self.next_voice_seq += 1;
        self.voices.push(Voice {
            id: format!("voice_{}_{}", note, self.next_voice_seq),
            note,
            velocity,
            started_at: self.sample_clock,
            sequence: self.next_voice_seq,
            phase: 0.0,
            waveform: self.params.oscillator,
            cutoff_hz: self.params.filter_frequency,
            resonance: self.params.filter_resonance,
            detune_cents: self.params.detune,
            filter: VoiceFilter::default(),
            adsr,
            release_deadline: None,
        });
    }

    pub fn note_off(&mut self, note: u8) {
        let release = self.params.envelope.release;
        let deadline = self.sample_clock
            + ((release + RELEASE_CLEANUP_MARGIN) * self.sample_rate) as u64;
        if let Some(voice) = self.voices.iter_mut().find(|v| v.note == note && v.is_held()) {
            voice.adsr.note_off();
            voice.release_deadline = Some(deadline);
        }
    }

    fn steal_oldest_voice(&mut self) {
        if let Some(oldest) = self
            .voices
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| (v.started_at, v.sequence))
            .map(|(i, _)| i)
        {
            self.voices.remove(oldest);
        }
    }

    fn handle_control_change(&mut self, controller: u8, value: u8) {
        let normalized = value as f32 / 127.0;
        match controller {
            // Mod wheel: detune offset across all sounding voices.
            1 => {
                let detune = self.params.detune + normalized * 50.0;
                for voice in self.voices.iter_mut() {
                    voice.detune_cents = detune;
                }
            }
            7 => {
                self.params.volume = normalized;
            }
            74 => {
                self.params.filter_frequency = 200.0 + normalized * 8000.0;
                for voice in self.voices.iter_mut() {
                    voice.cutoff_hz = self.params.filter_frequency;
                }
            }
            71 => {
                self.params.filter_resonance = 0.1 + normalized * 30.0;
                for voice in self.voices.iter_mut() {
                    voice.resonance = self.params.filter_resonance;
                }
            }
            _ => {}
        }
    }

    /// The single parameter path shared by knobs, MIDI mappings, and
    /// presets. `value` is normalized 0..1.
    pub fn update_parameter(&mut self, parameter: &str, value: f32) {
        let value = value.clamp(0.0, 1.0);
        match parameter {
            "oscillator_type" => {
                self.params.oscillator = Waveform::from_normalized(value);
            }
            "filter_frequency" => {
                self.params.filter_frequency = 200.0 + value * 8000.0;
                for voice in self.voices.iter_mut() {
                    voice.cutoff_hz = self.params.filter_frequency;
                }
            }
            "filter_resonance" => {
                self.params.filter_resonance = 0.1 + value * 30.0;
                for voice in self.voices.iter_mut() {
                    voice.resonance = self.params.filter_resonance;
                }
            }
            "attack" => self.params.envelope.attack = value * 2.0,
            "decay" => self.params.envelope.decay = value * 2.0,
            "sustain" => self.params.envelope.sustain = value,
            "release" => self.params.envelope.release = value * 3.0,
            "volume" => self.params.volume = value,
            "detune" => {
                self.params.detune = (value - 0.5) * 100.0;
                for voice in self.voices.iter_mut() {
                    voice.detune_cents = self.params.detune;
                }
            }
            _ => {}
        }
    }

    pub fn load_preset(&mut self, preset_id: &str) -> bool {
        let Some(preset) = self.presets.iter().find(|p| p.id == preset_id).cloned() else {
            return false;
        };
        for (parameter, value) in &preset.parameters {
            self.update_parameter(parameter, *value);
        }
        self.current_preset = Some(preset_id.to_string());
        true
    }

    /// Render and sum all voices into `buffer`, then reap voices whose
    /// release window has elapsed.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            self.sample_clock += 1;
            let mut mix = 0.0;
            for voice in self.voices.iter_mut() {
                mix += voice.render(self.sample_rate);
            }
            *sample += mix * self.params.volume;
        }

        let clock = self.sample_clock;
        self.voices.retain(|voice| {
            let deadline_passed = voice.release_deadline.map_or(false, |d| clock >= d);
            !(deadline_passed || (!voice.is_held() && voice.adsr.is_idle()))
        });
    }

    pub fn all_notes_off(&mut self) {
        let notes: Vec<u8> = self
            .voices
            .iter()
            .filter(|v| v.is_held())
            .map(|v| v.note)
            .collect();
        for note in notes {
            self.note_off(note);
        }
    }
}

// --- Engine ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Synthesizer,
    Sampler,
    DrumMachine,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::Synthesizer => write!(f, "synthesizer"),
            InstrumentKind::Sampler => write!(f, "sampler"),
            InstrumentKind::DrumMachine => write!(f, "drum_machine"),
        }
    }
}

/// Registry of virtual instruments, summed onto a common output bus.
pub struct VirtualInstrumentEngine {
    instruments: BTreeMap<String, SynthesizerInstrument>,
    sample_rate: f32,
    next_id: u64,
}

impl VirtualInstrumentEngine {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            instruments: BTreeMap::new(),
            sample_rate,
            next_id: 0,
        }
    }

    /// Only synthesizers exist today; sampler and drum machine requests
    /// are rejected outright.
    pub fn create_instrument(
        &mut self,
        kind: InstrumentKind,
        name: impl Into<String>,
    ) -> Result<String, EngineError> {
        match kind {
            InstrumentKind::Synthesizer => {
                self.next_id += 1;
                let id = format!("instrument_{}", self.next_id);
                self.instruments.insert(
                    id.clone(),
                    SynthesizerInstrument::new(id.clone(), name, self.sample_rate),
                );
                Ok(id)
            }
            other => Err(EngineError::UnsupportedFormat(format!(
                "instrument type {}",
                other
            ))),
        }
    }

    /// Register a synthesizer under a caller-chosen id (the control
    /// facade allocates ids so it can return them synchronously).
    pub fn insert_synthesizer(&mut self, instrument_id: String, name: impl Into<String>) {
        self.instruments.insert(
            instrument_id.clone(),
            SynthesizerInstrument::new(instrument_id, name, self.sample_rate),
        );
    }

    pub fn remove_instrument(&mut self, instrument_id: &str) {
        self.instruments.remove(instrument_id);
    }

    pub fn instrument(&self, instrument_id: &str) -> Option<&SynthesizerInstrument> {
        self.instruments.get(instrument_id)
    }

    pub fn instrument_mut(&mut self, instrument_id: &str) -> Option<&mut SynthesizerInstrument> {
        self.instruments.get_mut(instrument_id)
    }

    pub fn instrument_ids(&self) -> Vec<String> {
        self.instruments.keys().cloned().collect()
    }

    pub fn process_midi(&mut self, instrument_id: &str, message: &MidiMessage) {
        if let Some(instrument) = self.instruments.get_mut(instrument_id) {
            instrument.process_midi(message);
        }
    }

    pub fn update_parameter(&mut self, instrument_id: &str, parameter: &str, value: f32) {
        if let Some(instrument) = self.instruments.get_mut(instrument_id) {
            instrument.update_parameter(parameter, value);
        }
    }

    pub fn load_preset(&mut self, instrument_id: &str, preset_id: &str) -> bool {
        self.instruments
            .get_mut(instrument_id)
            .map_or(false, |i| i.load_preset(preset_id))
    }

    /// Sum every instrument into the bus.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for instrument in self.instruments.values_mut() {
            instrument.process_block(buffer);
        }
    }

    pub fn shutdown(&mut self) {
        for instrument in self.instruments.values_mut() {
            instrument.all_notes_off();
        }
        self.instruments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn synth() -> SynthesizerInstrument {
        SynthesizerInstrument::new("instrument_1", "Test Synth", SR)
    }

    fn run_block(synth: &mut SynthesizerInstrument, samples: usize) -> Vec<f32> {
        let mut buffer = vec![0.0f32; samples];
        synth.process_block(&mut buffer);
        buffer
    }

    #[test]
    fn note_frequencies_are_tempered() {
        assert!((note_to_frequency(69) - 440.0).abs() < 1e-3);
        assert!((note_to_frequency(81) - 880.0).abs() < 1e-2);
        assert!((note_to_frequency(60) - 261.63).abs() < 0.1);
    }

    #[test]
    fn voice_count_never_exceeds_the_polyphony_limit() {
        let mut synth = synth();
        for note in 0..24u8 {
            synth.note_on(note, 100);
        }
        assert_eq!(synth.active_voice_count(), MAX_VOICES);

        // Oldest voices (lowest notes, triggered first) were stolen.
        let notes = synth.active_notes();
        assert!(!notes.contains(&0));
        assert!(!notes.contains(&7));
        assert!(notes.contains(&8));
        assert!(notes.contains(&23));
    }

    #[test]
    fn stealing_removes_the_oldest_by_start_time() {
        let mut synth = synth();
        synth.note_on(60, 100);
        run_block(&mut synth, 64);
        for note in 61..76u8 {
            synth.note_on(note, 100);
        }
        assert_eq!(synth.active_voice_count(), MAX_VOICES);

        synth.note_on(80, 100);
        assert!(
            !synth.active_notes().contains(&60),
            "note 60 was the oldest and must be stolen"
        );
    }

    #[test]
    fn released_voice_is_torn_down_after_the_release_time() {
        let mut synth = synth();
        synth.update_parameter("release", 0.1 / 3.0); // 100 ms release
        synth.note_on(60, 100);
        run_block(&mut synth, 1024);

        synth.note_off(60);
        assert_eq!(synth.active_voice_count(), 1, "voice lingers in release");

        // Render past release + margin; deferred cleanup reaps it.
        run_block(&mut synth, (0.3 * SR) as usize);
        assert_eq!(synth.active_voice_count(), 0);
    }

    #[test]
    fn retrigger_cancels_pending_disposal() {
        let mut synth = synth();
        synth.note_on(60, 100);
        run_block(&mut synth, 256);
        synth.note_off(60);

        // Re-trigger before the release window elapses.
        synth.note_on(60, 90);
        assert_eq!(synth.active_voice_count(), 1);

        // The voice survives well past the original release deadline.
        run_block(&mut synth, (1.0 * SR) as usize);
        assert_eq!(synth.active_voice_count(), 1);
        assert_eq!(synth.active_notes(), vec![60]);
    }

    #[test]
    fn envelope_walks_through_its_stages() {
        let settings = AdsrSettings {
            attack: 0.01,
            decay: 0.01,
            sustain: 0.5,
            release: 0.01,
        };
        let mut adsr = Adsr::new(settings, SR);
        adsr.note_on();
        assert_eq!(adsr.state, AdsrState::Attack);

        // Run through attack to the peak.
        let mut peak = 0.0f32;
        for _ in 0..(0.05 * SR) as usize {
            peak = peak.max(adsr.process());
        }
        assert!((peak - 1.0).abs() < 1e-3);
        assert_eq!(adsr.state, AdsrState::Sustain);
        assert!((adsr.process() - 0.5).abs() < 1e-3);

        adsr.note_off();
        assert_eq!(adsr.state, AdsrState::Release);
        for _ in 0..(0.05 * SR) as usize {
            adsr.process();
        }
        assert!(adsr.is_idle());
    }

    #[test]
    fn rendered_audio_is_nonzero_while_held() {
        let mut synth = synth();
        synth.note_on(69, 127);
        let buffer = run_block(&mut synth, 4096);
        let energy: f32 = buffer.iter().map(|s| s * s).sum();
        assert!(energy > 0.0);
    }

    #[test]
    fn control_changes_update_params_and_voices() {
        let mut synth = synth();
        synth.note_on(60, 100);

        synth.process_midi(&MidiMessage::ControlChange {
            channel: 1,
            controller: 74,
            value: 127,
        });
        assert!((synth.params().filter_frequency - 8200.0).abs() < 1.0);

        synth.process_midi(&MidiMessage::ControlChange {
            channel: 1,
            controller: 71,
            value: 127,
        });
        assert!((synth.params().filter_resonance - 30.1).abs() < 0.1);

        synth.process_midi(&MidiMessage::ControlChange {
            channel: 1,
            controller: 7,
            value: 64,
        });
        assert!((synth.params().volume - 64.0 / 127.0).abs() < 1e-4);
    }

    #[test]
    fn presets_ride_the_update_parameter_path() {
        let mut synth = synth();
        assert!(synth.load_preset("bass"));
        assert_eq!(synth.current_preset.as_deref(), Some("bass"));
        assert_eq!(synth.params().oscillator, Waveform::Square);
        // filter_frequency = 200 + 0.075 * 8000
        assert!((synth.params().filter_frequency - 800.0).abs() < 1.0);
        assert!((synth.params().envelope.sustain - 0.6).abs() < 1e-4);

        assert!(!synth.load_preset("missing"));
    }

    #[test]
    fn engine_only_builds_synthesizers() {
        let mut engine = VirtualInstrumentEngine::new(SR);
        let id = engine
            .create_instrument(InstrumentKind::Synthesizer, "Lead")
            .unwrap();
        assert!(engine.instrument(&id).is_some());

        for kind in [InstrumentKind::Sampler, InstrumentKind::DrumMachine] {
            let err = engine.create_instrument(kind, "Nope").unwrap_err();
            assert!(matches!(err, EngineError::UnsupportedFormat(_)));
        }
    }

    #[test]
    fn engine_routes_midi_by_instrument_id() {
        let mut engine = VirtualInstrumentEngine::new(SR);
        let id = engine
            .create_instrument(InstrumentKind::Synthesizer, "Lead")
            .unwrap();
        engine.process_midi(
            &id,
            &MidiMessage::NoteOn {
                channel: 1,
                note: 64,
                velocity: 100,
            },
        );
        assert_eq!(engine.instrument(&id).unwrap().active_voice_count(), 1);

        let mut buffer = vec![0.0f32; 512];
        engine.process_block(&mut buffer);
        assert!(buffer.iter().any(|&s| s != 0.0));
    }
}
