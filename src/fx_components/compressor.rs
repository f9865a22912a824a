// src/fx_components/compressor.rs

//! Dynamics compressor: envelope follower driving a soft-knee gain curve.
//! Fully wet; there is deliberately no dry path.

use crate::fx_components::EffectProcessor;
use crate::types::{db_to_linear, linear_to_db, EffectKind};
use std::collections::BTreeMap;

pub struct Compressor {
    sample_rate: f32,
    threshold_db: f32,
    ratio: f32,
    attack: f32,
    release: f32,
    knee_db: f32,

    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

fn time_coeff(seconds: f32, sample_rate: f32) -> f32 {
    (-(1.0 / (seconds.max(1e-4) * sample_rate))).exp()
}

impl Compressor {
    pub fn new(sample_rate: f32) -> Self {
        let attack = 0.003;
        let release = 0.25;
        Self {
            sample_rate,
            threshold_db: -24.0,
            ratio: 4.0,
            attack,
            release,
            knee_db: 30.0,
            attack_coeff: time_coeff(attack, sample_rate),
            release_coeff: time_coeff(release, sample_rate),
            envelope: 0.0,
        }
    }

    /// Static gain curve: dB of gain reduction for a given envelope level.
    fn gain_reduction_db(&self, level_db: f32) -> f32 {
        let over = level_db - self.threshold_db;
        let knee = self.knee_db;
        let slope = 1.0 / self.ratio - 1.0;
        if knee <= 0.0 {
            // Hard knee.
            return if over > 0.0 { slope * over } else { 0.0 };
        }
        if 2.0 * over < -knee {
            0.0
        } else if 2.0 * over.abs() <= knee {
            // Quadratic interpolation through the knee region.
            slope * (over + knee / 2.0).powi(2) / (2.0 * knee)
        } else {
            slope * over
        }
    }
}

impl EffectProcessor for Compressor {
    fn kind(&self) -> EffectKind {
        EffectKind::Compressor
    }

    fn update_parameters(&mut self, parameters: &BTreeMap<String, f32>) {
        if let Some(&threshold) = parameters.get("threshold") {
            self.threshold_db = threshold.clamp(-60.0, 0.0);
        }
        if let Some(&ratio) = parameters.get("ratio") {
            self.ratio = ratio.clamp(1.0, 20.0);
        }
        if let Some(&attack) = parameters.get("attack") {
            self.attack = attack.clamp(0.0001, 1.0);
            self.attack_coeff = time_coeff(self.attack, self.sample_rate);
        }
        if let Some(&release) = parameters.get("release") {
            self.release = release.clamp(0.001, 2.0);
            self.release_coeff = time_coeff(self.release, self.sample_rate);
        }
        if let Some(&knee) = parameters.get("knee") {
            self.knee_db = knee.clamp(0.0, 40.0);
        }
    }

    fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let input_abs = sample.abs();
            self.envelope = if input_abs > self.envelope {
                self.attack_coeff * (self.envelope - input_abs) + input_abs
            } else {
                self.release_coeff * (self.envelope - input_abs) + input_abs
            };
            self.envelope = self.envelope.max(1e-6);

            let reduction = self.gain_reduction_db(linear_to_db(self.envelope));
            *sample *= db_to_linear(reduction);
        }
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(threshold: f32, ratio: f32, knee: f32) -> Compressor {
        let mut comp = Compressor::new(44100.0);
        let mut params = BTreeMap::new();
        params.insert("threshold".to_string(), threshold);
        params.insert("ratio".to_string(), ratio);
        params.insert("knee".to_string(), knee);
        params.insert("attack".to_string(), 0.0005);
        params.insert("release".to_string(), 0.1);
        comp.update_parameters(&params);
        comp
    }

    #[test]
    fn signals_below_threshold_pass_unchanged() {
        let mut comp = configured(-12.0, 4.0, 0.0);
        // -30 dBFS, far below threshold and outside any knee.
        let level = db_to_linear(-30.0);
        let mut block = vec![level; 8192];
        comp.process_block(&mut block);
        let out = block[8000];
        assert!((out - level).abs() / level < 0.02, "unity below threshold");
    }

    #[test]
    fn signals_above_threshold_are_reduced_by_the_ratio() {
        let mut comp = configured(-24.0, 4.0, 0.0);
        // 0 dBFS input, 24 dB over threshold: expect ~ -18 dB of reduction
        // ((1/4 - 1) * 24) once the envelope settles.
        let mut block = vec![1.0f32; 44100];
        comp.process_block(&mut block);
        let out_db = linear_to_db(block[44000]);
        assert!((out_db + 18.0).abs() < 1.0, "ratio applied: {}", out_db);
    }

    #[test]
    fn higher_ratio_reduces_more() {
        let mut gentle = configured(-24.0, 2.0, 0.0);
        let mut firm = configured(-24.0, 8.0, 0.0);
        let mut a = vec![1.0f32; 22050];
        let mut b = vec![1.0f32; 22050];
        gentle.process_block(&mut a);
        firm.process_block(&mut b);
        assert!(b[22000] < a[22000]);
    }

    #[test]
    fn knee_softens_the_transition() {
        let comp_hard = configured(-24.0, 4.0, 0.0);
        let comp_soft = configured(-24.0, 4.0, 12.0);
        // Right at threshold: hard knee does nothing, soft knee already bends.
        assert_eq!(comp_hard.gain_reduction_db(-24.0), 0.0);
        assert!(comp_soft.gain_reduction_db(-24.0) < 0.0);
    }
}
