// src/eq.rs

//! Channel tone shaping: the fixed 3-band EQ every channel carries, and the
//! N-band parametric EQ with response estimation for the analyzer display.

use crate::analyzer::{AnalysisTap, SpectrumAnalyzer, SpectrumData};
use crate::biquad::{Biquad, Coefficients};
use crate::types::{BandKind, EqBand, EqSettings};

// Gain smoothing advances once per block; keeps EQ moves click-free without
// recomputing coefficients per sample.
const GAIN_SMOOTHING: f32 = 0.6;
const GAIN_EPSILON: f32 = 0.005;

/// High/mid/low shelf-and-peak tone control, one per channel.
pub struct ThreeBandEq {
    settings: EqSettings,
    low: Biquad,
    mid: Biquad,
    high: Biquad,
    smoothed_low: f32,
    smoothed_mid: f32,
    smoothed_high: f32,
    sample_rate: f32,
}

impl ThreeBandEq {
    pub fn new(settings: EqSettings, sample_rate: f32) -> Self {
        let mut eq = Self {
            settings,
            low: Biquad::passthrough(),
            mid: Biquad::passthrough(),
            high: Biquad::passthrough(),
            smoothed_low: settings.low_gain,
            smoothed_mid: settings.mid_gain,
            smoothed_high: settings.high_gain,
            sample_rate,
        };
        eq.retune();
        eq
    }

    pub fn settings(&self) -> &EqSettings {
        &self.settings
    }

    pub fn update_settings(&mut self, settings: EqSettings) {
        self.settings = settings;
        // Gains ramp via the per-block smoother; frequency moves retune now.
        self.retune();
    }

    fn retune(&mut self) {
        let s = &self.settings;
        self.low.set_coefficients(Coefficients::from_band(
            BandKind::Lowshelf,
            s.low_freq,
            self.smoothed_low,
            0.707,
            self.sample_rate,
        ));
        self.mid.set_coefficients(Coefficients::from_band(
            BandKind::Peaking,
            s.mid_freq,
            self.smoothed_mid,
            1.0,
            self.sample_rate,
        ));
        self.high.set_coefficients(Coefficients::from_band(
            BandKind::Highshelf,
            s.high_freq,
            self.smoothed_high,
            0.707,
            self.sample_rate,
        ));
    }

    pub fn process_block(&mut self, buffer: &mut [f32]) {
        if !self.settings.enabled {
            return;
        }

        let mut moved = false;
        for (smoothed, target) in [
            (&mut self.smoothed_low, self.settings.low_gain),
            (&mut self.smoothed_mid, self.settings.mid_gain),
            (&mut self.smoothed_high, self.settings.high_gain),
        ] {
            if (*smoothed - target).abs() > GAIN_EPSILON {
                *smoothed = GAIN_SMOOTHING * *smoothed + (1.0 - GAIN_SMOOTHING) * target;
                moved = true;
            }
        }
        if moved {
            self.retune();
        }

        self.low.process_block(buffer);
        self.mid.process_block(buffer);
        self.high.process_block(buffer);
    }

    pub fn reset(&mut self) {
        self.low.reset();
        self.mid.reset();
        self.high.reset();
    }
}

/// Partial update for one parametric band.
#[derive(Clone, Debug, Default)]
pub struct BandUpdate {
    pub kind: Option<BandKind>,
    pub frequency: Option<f32>,
    pub gain: Option<f32>,
    pub q: Option<f32>,
    pub enabled: Option<bool>,
}

/// Combined response of the parametric EQ, for plotting.
#[derive(Debug, Clone)]
pub struct EqAnalysis {
    pub frequencies: Vec<f32>,
    /// Combined magnitude in dB per queried frequency.
    pub magnitudes: Vec<f32>,
    /// Summed phase in radians per queried frequency.
    pub phases: Vec<f32>,
}

struct BandStage {
    band: EqBand,
    filter: Biquad,
}

impl BandStage {
    fn new(band: EqBand, sample_rate: f32) -> Self {
        let filter = Biquad::new(Coefficients::from_band(
            band.kind,
            band.frequency,
            band.gain,
            band.q,
            sample_rate,
        ));
        Self { band, filter }
    }

    fn retune(&mut self, sample_rate: f32) {
        self.filter.set_coefficients(Coefficients::from_band(
            self.band.kind,
            self.band.frequency,
            self.band.gain,
            self.band.q,
            sample_rate,
        ));
    }
}

/// N-band parametric EQ. Bands are kept sorted ascending by center
/// frequency and processed as a serial chain; the analysis tap hangs off
/// the output for the spectrum display.
pub struct AdvancedEqProcessor {
    sample_rate: f32,
    stages: Vec<BandStage>,
    bypassed: bool,
    tap: AnalysisTap,
    analyzer: SpectrumAnalyzer,
}

impl AdvancedEqProcessor {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            stages: Vec::new(),
            bypassed: false,
            tap: AnalysisTap::new(),
            analyzer: SpectrumAnalyzer::new(sample_rate),
        }
    }

    pub fn add_band(&mut self, band: EqBand) {
        self.stages.push(BandStage::new(band, self.sample_rate));
        self.rebuild_chain();
    }

    pub fn update_band(&mut self, band_id: &str, updates: &BandUpdate) {
        let Some(stage) = self.stages.iter_mut().find(|s| s.band.id == band_id) else {
            return;
        };
        let mut needs_sort = false;
        if let Some(kind) = updates.kind {
            stage.band.kind = kind;
        }
        if let Some(frequency) = updates.frequency {
            needs_sort = stage.band.frequency != frequency;
            stage.band.frequency = frequency;
        }
        if let Some(gain) = updates.gain {
            stage.band.gain = gain;
        }
        if let Some(q) = updates.q {
            stage.band.q = q;
        }
        if let Some(enabled) = updates.enabled {
            stage.band.enabled = enabled;
        }
        stage.retune(self.sample_rate);
        if needs_sort {
            self.rebuild_chain();
        }
    }

    pub fn remove_band(&mut self, band_id: &str) {
        self.stages.retain(|s| s.band.id != band_id);
        self.rebuild_chain();
    }

    pub fn set_bypassed(&mut self, bypassed: bool) {
        self.bypassed = bypassed;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn bands(&self) -> Vec<EqBand> {
        self.stages.iter().map(|s| s.band.clone()).collect()
    }

    /// Center frequencies in processing order; used to verify chain order.
    pub fn chain_frequencies(&self) -> Vec<f32> {
        self.stages.iter().map(|s| s.band.frequency).collect()
    }

    fn rebuild_chain(&mut self) {
        self.stages
            .sort_by(|a, b| a.band.frequency.total_cmp(&b.band.frequency));
    }

    /// Run a block through the chain. Bypass leaves the buffer dry but
    /// still feeds the analysis tap, so toggling is instant and click-free.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        if !self.bypassed {
            for stage in self.stages.iter_mut() {
                if stage.band.enabled {
                    stage.filter.process_block(buffer);
                }
            }
        }
        self.tap.push_block(buffer);
    }

    /// Combined response across enabled bands: magnitudes multiply, phases
    /// sum. Uses exact biquad transfer-function evaluation.
    pub fn frequency_response(&self, frequencies: &[f32]) -> EqAnalysis {
        let mut magnitudes = Vec::with_capacity(frequencies.len());
        let mut phases = Vec::with_capacity(frequencies.len());
        for &freq in frequencies {
            let mut magnitude = 1.0f32;
            let mut phase = 0.0f32;
            for stage in &self.stages {
                if !stage.band.enabled {
                    continue;
                }
                let (m, p) = stage
                    .filter
                    .coefficients()
                    .response_at(freq, self.sample_rate);
                magnitude *= m;
                phase += p;
            }
            magnitudes.push(20.0 * magnitude.max(1e-9).log10());
            phases.push(phase);
        }
        EqAnalysis {
            frequencies: frequencies.to_vec(),
            magnitudes,
            phases,
        }
    }

    /// Live spectrum of the EQ output.
    pub fn spectrum_data(&mut self) -> SpectrumData {
        self.analyzer.spectrum(&self.tap)
    }

    pub fn reset(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.filter.reset();
        }
        self.tap.reset();
    }

    /// Factory band sets for common sources.
    pub fn preset(name: &str) -> Vec<EqBand> {
        match name {
            "vocal" => vec![
                EqBand {
                    id: "vocal-hp".into(),
                    kind: BandKind::Highpass,
                    frequency: 80.0,
                    gain: 0.0,
                    q: 0.7,
                    enabled: true,
                },
                EqBand {
                    id: "vocal-presence".into(),
                    kind: BandKind::Peaking,
                    frequency: 2500.0,
                    gain: 3.0,
                    q: 1.5,
                    enabled: true,
                },
                EqBand {
                    id: "vocal-air".into(),
                    kind: BandKind::Highshelf,
                    frequency: 10000.0,
                    gain: 2.0,
                    q: 0.7,
                    enabled: true,
                },
            ],
            "bass" => vec![
                EqBand {
                    id: "bass-sub".into(),
                    kind: BandKind::Lowshelf,
                    frequency: 60.0,
                    gain: 2.0,
                    q: 0.7,
                    enabled: true,
                },
                EqBand {
                    id: "bass-punch".into(),
                    kind: BandKind::Peaking,
                    frequency: 100.0,
                    gain: 3.0,
                    q: 1.2,
                    enabled: true,
                },
                EqBand {
                    id: "bass-hp".into(),
                    kind: BandKind::Highpass,
                    frequency: 40.0,
                    gain: 0.0,
                    q: 0.7,
                    enabled: true,
                },
            ],
            "drums" => vec![
                EqBand {
                    id: "drums-kick".into(),
                    kind: BandKind::Peaking,
                    frequency: 60.0,
                    gain: 3.0,
                    q: 1.0,
                    enabled: true,
                },
                EqBand {
                    id: "drums-snare".into(),
                    kind: BandKind::Peaking,
                    frequency: 200.0,
                    gain: 2.0,
                    q: 1.5,
                    enabled: true,
                },
                EqBand {
                    id: "drums-presence".into(),
                    kind: BandKind::Peaking,
                    frequency: 5000.0,
                    gain: 2.0,
                    q: 1.2,
                    enabled: true,
                },
                EqBand {
                    id: "drums-air".into(),
                    kind: BandKind::Highshelf,
                    frequency: 12000.0,
                    gain: 3.0,
                    q: 0.7,
                    enabled: true,
                },
            ],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn band(id: &str, freq: f32) -> EqBand {
        EqBand::new(id, BandKind::Peaking, freq)
    }

    #[test]
    fn bands_always_chain_ascending_by_frequency() {
        let mut eq = AdvancedEqProcessor::new(SR);
        eq.add_band(band("b1", 5000.0));
        eq.add_band(band("b2", 100.0));
        eq.add_band(band("b3", 1000.0));
        assert_eq!(eq.chain_frequencies(), vec![100.0, 1000.0, 5000.0]);

        // Moving a band re-sorts the chain.
        eq.update_band(
            "b2",
            &BandUpdate {
                frequency: Some(12000.0),
                ..Default::default()
            },
        );
        assert_eq!(eq.chain_frequencies(), vec![1000.0, 5000.0, 12000.0]);

        eq.remove_band("b3");
        assert_eq!(eq.chain_frequencies(), vec![5000.0, 12000.0]);
    }

    #[test]
    fn response_combines_only_enabled_bands() {
        let mut eq = AdvancedEqProcessor::new(SR);
        let mut boost = band("boost", 1000.0);
        boost.gain = 6.0;
        boost.q = 1.0;
        eq.add_band(boost);

        let analysis = eq.frequency_response(&[1000.0]);
        assert!((analysis.magnitudes[0] - 6.0).abs() < 0.2);

        eq.update_band(
            "boost",
            &BandUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        );
        let analysis = eq.frequency_response(&[1000.0]);
        assert!(analysis.magnitudes[0].abs() < 1e-3);
    }

    #[test]
    fn stacked_bands_multiply_magnitudes() {
        let mut eq = AdvancedEqProcessor::new(SR);
        for (id, gain) in [("a", 3.0), ("b", 3.0)] {
            let mut b = band(id, 1000.0);
            b.gain = gain;
            b.q = 1.0;
            eq.add_band(b);
        }
        // Two +3 dB peaks at the same center combine to ~+6 dB.
        let analysis = eq.frequency_response(&[1000.0]);
        assert!((analysis.magnitudes[0] - 6.0).abs() < 0.3);
    }

    #[test]
    fn bypass_leaves_signal_untouched() {
        let mut eq = AdvancedEqProcessor::new(SR);
        let mut b = band("cut", 1000.0);
        b.gain = -12.0;
        eq.add_band(b);
        eq.set_bypassed(true);

        let original: Vec<f32> = (0..256).map(|i| (i as f32 * 0.14).sin()).collect();
        let mut buffer = original.clone();
        eq.process_block(&mut buffer);
        assert_eq!(buffer, original);
    }

    #[test]
    fn three_band_disabled_is_transparent() {
        let mut settings = EqSettings::default();
        settings.enabled = false;
        settings.low_gain = 12.0;
        let mut eq = ThreeBandEq::new(settings, SR);

        let original: Vec<f32> = (0..128).map(|i| (i as f32 * 0.2).sin()).collect();
        let mut buffer = original.clone();
        eq.process_block(&mut buffer);
        assert_eq!(buffer, original);
    }

    #[test]
    fn three_band_boost_raises_low_frequencies() {
        let mut settings = EqSettings::default();
        settings.low_gain = 12.0;
        let mut eq = ThreeBandEq::new(settings, SR);

        // 50 Hz sine, well inside the low shelf.
        let freq = 50.0;
        let mut buffer: Vec<f32> = (0..8192)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SR).sin() * 0.25)
            .collect();
        eq.process_block(&mut buffer);
        let peak = buffer[4096..].iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        assert!(peak > 0.5, "low shelf boost applied: {}", peak);
    }

    #[test]
    fn presets_are_valid_band_sets() {
        for name in ["vocal", "bass", "drums"] {
            let bands = AdvancedEqProcessor::preset(name);
            assert!(!bands.is_empty(), "{} preset exists", name);
            for b in &bands {
                assert!(b.frequency >= 20.0 && b.frequency <= 20000.0);
                assert!(b.q >= 0.1 && b.q <= 10.0);
            }
        }
        assert!(AdvancedEqProcessor::preset("nope").is_empty());
    }
}
