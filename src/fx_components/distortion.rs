// src/fx_components/distortion.rs

//! Waveshaper distortion with 4x oversampling and a post-shaper tone
//! filter. Fully wet, like the compressor.

use crate::biquad::{Biquad, Coefficients};
use crate::fx_components::EffectProcessor;
use crate::types::{BandKind, EffectKind};
use std::collections::BTreeMap;
use std::f32::consts::PI;

/// Resolution of the shaping curve lookup table.
const CURVE_SAMPLES: usize = 44100;

const OVERSAMPLE: usize = 4;

pub struct Distortion {
    sample_rate: f32,
    drive: f32,
    tone: f32,
    level: f32,
    curve: Vec<f32>,
    tone_filter: Biquad,
    last_input: f32,
}

impl Distortion {
    pub fn new(sample_rate: f32) -> Self {
        let tone = 2000.0;
        let mut distortion = Self {
            sample_rate,
            drive: 50.0,
            tone,
            level: 0.5,
            curve: vec![0.0; CURVE_SAMPLES],
            tone_filter: Biquad::new(Coefficients::from_band(
                BandKind::Lowpass,
                tone,
                0.0,
                0.707,
                sample_rate,
            )),
            last_input: 0.0,
        };
        distortion.generate_curve();
        distortion
    }

    fn generate_curve(&mut self) {
        let deg = PI / 180.0;
        let amount = self.drive;
        for (i, slot) in self.curve.iter_mut().enumerate() {
            let x = (i as f32 * 2.0) / CURVE_SAMPLES as f32 - 1.0;
            *slot = ((3.0 + amount) * x * 20.0 * deg) / (PI + amount * x.abs());
        }
    }

    #[inline]
    fn shape(&self, x: f32) -> f32 {
        let clamped = x.clamp(-1.0, 1.0);
        let pos = (clamped + 1.0) * 0.5 * (CURVE_SAMPLES - 1) as f32;
        let index = pos.floor() as usize;
        let fraction = pos.fract();
        let next = (index + 1).min(CURVE_SAMPLES - 1);
        self.curve[index] + fraction * (self.curve[next] - self.curve[index])
    }
}

impl EffectProcessor for Distortion {
    fn kind(&self) -> EffectKind {
        EffectKind::Distortion
    }

    fn update_parameters(&mut self, parameters: &BTreeMap<String, f32>) {
        if let Some(&drive) = parameters.get("drive") {
            let drive = drive.clamp(0.0, 100.0);
            if drive != self.drive {
                self.drive = drive;
                self.generate_curve();
            }
        }
        if let Some(&tone) = parameters.get("tone") {
            self.tone = tone.clamp(200.0, 12000.0);
            self.tone_filter.set_coefficients(Coefficients::from_band(
                BandKind::Lowpass,
                self.tone,
                0.0,
                0.707,
                self.sample_rate,
            ));
        }
        if let Some(&level) = parameters.get("level") {
            self.level = level.clamp(0.0, 1.0);
        }
    }

    fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let input = *sample;
            // 4x oversampled shaping: interpolate between the previous and
            // current input, shape each sub-sample, average on the way down.
            let mut accumulated = 0.0;
            for step in 1..=OVERSAMPLE {
                let t = step as f32 / OVERSAMPLE as f32;
                let interpolated = self.last_input + (input - self.last_input) * t;
                accumulated += self.shape(interpolated);
            }
            self.last_input = input;
            let shaped = accumulated / OVERSAMPLE as f32;
            *sample = self.tone_filter.process(shaped) * self.level;
        }
    }

    fn reset(&mut self) {
        self.tone_filter.reset();
        self.last_input = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_matches_the_shaping_formula() {
        let distortion = Distortion::new(44100.0);
        let deg = PI / 180.0;
        let drive = 50.0;
        for &x in &[-0.9f32, -0.3, 0.0, 0.4, 0.8] {
            let expected = ((3.0 + drive) * x * 20.0 * deg) / (PI + drive * x.abs());
            let actual = distortion.shape(x);
            assert!(
                (actual - expected).abs() < 1e-3,
                "shape({}) = {} vs {}",
                x,
                actual,
                expected
            );
        }
    }

    #[test]
    fn curve_is_odd_symmetric() {
        let distortion = Distortion::new(44100.0);
        for &x in &[0.1f32, 0.5, 0.9] {
            assert!((distortion.shape(x) + distortion.shape(-x)).abs() < 1e-3);
        }
    }

    #[test]
    fn more_drive_flattens_loud_samples_harder() {
        let mut soft = Distortion::new(44100.0);
        let mut hard = Distortion::new(44100.0);
        let mut params = BTreeMap::new();
        params.insert("drive".to_string(), 5.0);
        soft.update_parameters(&params);
        params.insert("drive".to_string(), 95.0);
        hard.update_parameters(&params);

        // Compression ratio of loud vs quiet shaping grows with drive.
        let soft_ratio = soft.shape(1.0) / soft.shape(0.1);
        let hard_ratio = hard.shape(1.0) / hard.shape(0.1);
        assert!(hard_ratio < soft_ratio);
    }

    #[test]
    fn output_level_scales_the_result() {
        let mut distortion = Distortion::new(44100.0);
        let mut params = BTreeMap::new();
        params.insert("level".to_string(), 0.0);
        distortion.update_parameters(&params);

        let mut block: Vec<f32> = (0..512).map(|i| (i as f32 * 0.3).sin()).collect();
        distortion.process_block(&mut block);
        assert!(block.iter().all(|&s| s == 0.0));
    }
}
