// src/fx_components/reverb.rs

//! Convolution reverb driven by a synthetically generated impulse response.
//!
//! The impulse is exponentially decaying white noise whose length scales
//! with `room_size` (up to 4 seconds) and whose decay envelope follows
//! `(1 - i/len)^(damping * 10)`. Changing either parameter regenerates the
//! impulse. The convolution itself runs as uniform-partition overlap-save
//! FFT so the per-sample cost stays bounded for long impulses.

use crate::fx_components::EffectProcessor;
use crate::types::EffectKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Partition length in samples; FFT frames are twice this.
const PARTITION: usize = 1024;
const FFT_SIZE: usize = 2 * PARTITION;

// Fixed noise seed keeps impulse regeneration deterministic for a given
// (room_size, damping) pair.
const IMPULSE_SEED: u64 = 0x5eed_1e57;

struct PartitionedConvolver {
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// Frequency-domain impulse partitions.
    partitions: Vec<Vec<Complex<f32>>>,
    /// Frequency-domain delay line of past input frames, newest first.
    fdl: VecDeque<Vec<Complex<f32>>>,
    prev_frame: Vec<f32>,
    in_frame: Vec<f32>,
    in_fill: usize,
    out_queue: VecDeque<f32>,
    spectrum: Vec<Complex<f32>>,
    accumulator: Vec<Complex<f32>>,
}

impl PartitionedConvolver {
    fn new() -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            ifft: planner.plan_fft_inverse(FFT_SIZE),
            partitions: Vec::new(),
            fdl: VecDeque::new(),
            prev_frame: vec![0.0; PARTITION],
            in_frame: vec![0.0; PARTITION],
            in_fill: 0,
            out_queue: VecDeque::new(),
            spectrum: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            accumulator: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    fn set_impulse(&mut self, impulse: &[f32]) {
        self.partitions.clear();
        for chunk in impulse.chunks(PARTITION) {
            let mut buffer = vec![Complex::new(0.0, 0.0); FFT_SIZE];
            for (slot, &sample) in buffer.iter_mut().zip(chunk.iter()) {
                *slot = Complex::new(sample, 0.0);
            }
            self.fft.process(&mut buffer);
            self.partitions.push(buffer);
        }
        self.clear_state();
    }

    fn clear_state(&mut self) {
        self.fdl.clear();
        self.prev_frame.fill(0.0);
        self.in_frame.fill(0.0);
        self.in_fill = 0;
        self.out_queue.clear();
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        self.in_frame[self.in_fill] = input;
        self.in_fill += 1;
        if self.in_fill == PARTITION {
            self.advance_frame();
            self.in_fill = 0;
        }
        self.out_queue.pop_front().unwrap_or(0.0)
    }

    fn advance_frame(&mut self) {
        // Overlap-save frame: previous partition followed by the new one.
        for i in 0..PARTITION {
            self.spectrum[i] = Complex::new(self.prev_frame[i], 0.0);
            self.spectrum[PARTITION + i] = Complex::new(self.in_frame[i], 0.0);
        }
        self.fft.process(&mut self.spectrum);

        self.fdl.push_front(self.spectrum.clone());
        self.fdl.truncate(self.partitions.len().max(1));

        self.accumulator.fill(Complex::new(0.0, 0.0));
        for (frame, partition) in self.fdl.iter().zip(self.partitions.iter()) {
            for i in 0..FFT_SIZE {
                self.accumulator[i] += frame[i] * partition[i];
            }
        }
        self.ifft.process(&mut self.accumulator);

        // Discard the first half (circular wrap); the rest is valid output.
        let norm = 1.0 / FFT_SIZE as f32;
        for i in PARTITION..FFT_SIZE {
            self.out_queue.push_back(self.accumulator[i].re * norm);
        }

        self.prev_frame.copy_from_slice(&self.in_frame);
    }
}

pub struct Reverb {
    sample_rate: f32,
    room_size: f32,
    damping: f32,
    wet_level: f32,
    dry_level: f32,
    convolver: PartitionedConvolver,
}

impl Reverb {
    pub fn new(sample_rate: f32) -> Self {
        let mut reverb = Self {
            sample_rate,
            room_size: 0.5,
            damping: 0.5,
            wet_level: 0.3,
            dry_level: 0.7,
            convolver: PartitionedConvolver::new(),
        };
        reverb.generate_impulse();
        reverb
    }

    fn generate_impulse(&mut self) {
        // Up to 4 seconds of decaying noise.
        let length = ((self.sample_rate * self.room_size * 4.0) as usize).max(PARTITION);
        let mut rng = StdRng::seed_from_u64(IMPULSE_SEED);
        let exponent = self.damping * 10.0;
        let mut impulse = Vec::with_capacity(length);
        for i in 0..length {
            let decay = (1.0 - i as f32 / length as f32).powf(exponent);
            impulse.push((rng.gen::<f32>() * 2.0 - 1.0) * decay);
        }
        self.convolver.set_impulse(&impulse);
    }

    #[cfg(test)]
    pub(crate) fn impulse_partition_count(&self) -> usize {
        self.convolver.partitions.len()
    }
}

impl EffectProcessor for Reverb {
    fn kind(&self) -> EffectKind {
        EffectKind::Reverb
    }

    fn update_parameters(&mut self, parameters: &BTreeMap<String, f32>) {
        if let Some(&wet) = parameters.get("wet_level") {
            self.wet_level = wet.clamp(0.0, 1.0);
        }
        if let Some(&dry) = parameters.get("dry_level") {
            self.dry_level = dry.clamp(0.0, 1.0);
        }

        let mut regenerate = false;
        if let Some(&size) = parameters.get("room_size") {
            let size = size.clamp(0.05, 1.0);
            regenerate |= size != self.room_size;
            self.room_size = size;
        }
        if let Some(&damping) = parameters.get("damping") {
            let damping = damping.clamp(0.0, 1.0);
            regenerate |= damping != self.damping;
            self.damping = damping;
        }
        if regenerate {
            self.generate_impulse();
        }
    }

    fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let dry = *sample;
            let wet = self.convolver.process(dry);
            *sample = dry * self.dry_level + wet * self.wet_level;
        }
    }

    fn reset(&mut self) {
        self.convolver.clear_state();
    }
}
