// src/fx_components/delay.rs

//! Feedback delay with a tone filter inside the feedback loop.

use crate::biquad::{Biquad, Coefficients};
use crate::fx_components::EffectProcessor;
use crate::types::{BandKind, EffectKind};
use std::collections::BTreeMap;

/// Longest supported delay time.
const MAX_DELAY_SECONDS: f32 = 2.0;

// Feedback must stay below unity so every echo decays.
const MAX_FEEDBACK: f32 = 0.95;

// ~5 ms ramps; fast enough that time changes settle within a beat.
const SMOOTHING_COEFF: f32 = 0.995;

pub struct Delay {
    sample_rate: f32,
    buffer: Vec<f32>,
    write_pos: usize,

    delay_time: f32,
    feedback: f32,
    wet_level: f32,
    dry_level: f32,
    filter_freq: f32,

    tone_filter: Biquad,
    smoothed_delay_samples: f32,
    smoothed_feedback: f32,
}

impl Delay {
    pub fn new(sample_rate: f32) -> Self {
        let max_samples = (MAX_DELAY_SECONDS * sample_rate).ceil() as usize;
        let delay_time = 0.25;
        let filter_freq = 2000.0;
        Self {
            sample_rate,
            buffer: vec![0.0; max_samples.max(1)],
            write_pos: 0,
            delay_time,
            feedback: 0.3,
            wet_level: 0.3,
            dry_level: 0.7,
            filter_freq,
            tone_filter: Biquad::new(Coefficients::from_band(
                BandKind::Lowpass,
                filter_freq,
                0.0,
                0.707,
                sample_rate,
            )),
            smoothed_delay_samples: delay_time * sample_rate,
            smoothed_feedback: 0.3,
        }
    }

    #[inline]
    fn read_interpolated(&self, delay_samples: f32) -> f32 {
        let len = self.buffer.len() as f32;
        let read_pos = (self.write_pos as f32 - delay_samples + len) % len;
        let index1 = read_pos.floor() as usize;
        let index2 = (index1 + 1) % self.buffer.len();
        let fraction = read_pos.fract();
        let sample1 = self.buffer[index1];
        let sample2 = self.buffer[index2];
        sample1 + fraction * (sample2 - sample1)
    }
}

impl EffectProcessor for Delay {
    fn kind(&self) -> EffectKind {
        EffectKind::Delay
    }

    fn update_parameters(&mut self, parameters: &BTreeMap<String, f32>) {
        if let Some(&time) = parameters.get("delay_time") {
            self.delay_time = time.clamp(0.001, MAX_DELAY_SECONDS);
        }
        if let Some(&feedback) = parameters.get("feedback") {
            self.feedback = feedback.clamp(0.0, MAX_FEEDBACK);
        }
        if let Some(&wet) = parameters.get("wet_level") {
            self.wet_level = wet.clamp(0.0, 1.0);
        }
        if let Some(&dry) = parameters.get("dry_level") {
            self.dry_level = dry.clamp(0.0, 1.0);
        }
        if let Some(&freq) = parameters.get("filter_freq") {
            self.filter_freq = freq.clamp(100.0, 18000.0);
            self.tone_filter.set_coefficients(Coefficients::from_band(
                BandKind::Lowpass,
                self.filter_freq,
                0.0,
                0.707,
                self.sample_rate,
            ));
        }
    }

    fn process_block(&mut self, buffer: &mut [f32]) {
        let target_delay_samples = self.delay_time * self.sample_rate;
        for sample in buffer.iter_mut() {
            // Smooth time and feedback moves to avoid clicks and pitch jumps.
            self.smoothed_delay_samples = SMOOTHING_COEFF * self.smoothed_delay_samples
                + (1.0 - SMOOTHING_COEFF) * target_delay_samples;
            self.smoothed_feedback = SMOOTHING_COEFF * self.smoothed_feedback
                + (1.0 - SMOOTHING_COEFF) * self.feedback;

            let input = *sample;
            let delayed = self.read_interpolated(self.smoothed_delay_samples);
            let filtered = self.tone_filter.process(delayed);

            let write_sample = input + filtered * self.smoothed_feedback;
            self.buffer[self.write_pos] = write_sample.clamp(-1.0, 1.0);
            self.write_pos = (self.write_pos + 1) % self.buffer.len();

            *sample = input * self.dry_level + delayed * self.wet_level;
        }
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
        self.tone_filter.reset();
        self.smoothed_delay_samples = self.delay_time * self.sample_rate;
        self.smoothed_feedback = self.feedback;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_arrives_after_the_delay_time() {
        let sr = 44100.0;
        let mut delay = Delay::new(sr);
        let mut params = BTreeMap::new();
        params.insert("delay_time".to_string(), 0.1);
        params.insert("wet_level".to_string(), 1.0);
        params.insert("dry_level".to_string(), 0.0);
        params.insert("feedback".to_string(), 0.0);
        delay.update_parameters(&params);

        let delay_samples = (0.1 * sr) as usize;
        let mut block = vec![0.0f32; delay_samples + 1000];
        block[0] = 1.0;
        delay.process_block(&mut block);

        // Echo energy shows up around the configured time, not before.
        let before: f32 = block[..delay_samples - 100].iter().map(|s| s.abs()).sum();
        let around: f32 = block[delay_samples - 100..delay_samples + 100]
            .iter()
            .map(|s| s.abs())
            .sum();
        assert!(before < 1e-3, "no output before the echo: {}", before);
        assert!(around > 0.1, "echo present: {}", around);
    }

    #[test]
    fn feedback_is_clamped_below_unity() {
        let mut delay = Delay::new(44100.0);
        let mut params = BTreeMap::new();
        params.insert("feedback".to_string(), 1.5);
        delay.update_parameters(&params);
        assert!(delay.feedback <= MAX_FEEDBACK);
    }

    #[test]
    fn feedback_tail_decays() {
        let sr = 8000.0;
        let mut delay = Delay::new(sr);
        let mut params = BTreeMap::new();
        params.insert("delay_time".to_string(), 0.05);
        params.insert("feedback".to_string(), 0.95);
        params.insert("wet_level".to_string(), 1.0);
        params.insert("dry_level".to_string(), 0.0);
        delay.update_parameters(&params);

        let mut block = vec![0.0f32; 8000];
        block[0] = 1.0;
        delay.process_block(&mut block);

        // Run several seconds of silence; the loop must bleed out.
        let mut peak = 0.0f32;
        for _ in 0..20 {
            let mut silence = vec![0.0f32; 8000];
            delay.process_block(&mut silence);
            peak = silence.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        }
        assert!(peak < 0.05, "echo loop decays: {}", peak);
    }
}
