// src/analyzer.rs

//! Analysis taps: every channel (and the master bus) writes its
//! post-processing samples into a small ring buffer, from which peak/RMS
//! levels and FFT spectrum snapshots are computed.

use crate::types::AudioLevel;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Samples kept for level/spectrum analysis, matching a 2048-point FFT.
pub const ANALYSIS_WINDOW: usize = 2048;

const CLIP_THRESHOLD: f32 = 0.99;

/// Ring buffer of the most recent output samples for one signal point.
#[derive(Debug, Clone)]
pub struct AnalysisTap {
    window: Vec<f32>,
    write_pos: usize,
    filled: usize,
}

impl AnalysisTap {
    pub fn new() -> Self {
        Self {
            window: vec![0.0; ANALYSIS_WINDOW],
            write_pos: 0,
            filled: 0,
        }
    }

    #[inline]
    pub fn push_block(&mut self, block: &[f32]) {
        for &sample in block {
            self.window[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.window.len();
        }
        self.filled = (self.filled + block.len()).min(self.window.len());
    }

    /// Peak / RMS over the captured window. Peak is clamped to [0, 1] for
    /// metering; clipping trips at 0.99 before the clamp.
    pub fn level(&self) -> AudioLevel {
        if self.filled == 0 {
            return AudioLevel::silent();
        }
        let mut peak = 0.0f32;
        let mut sum_squares = 0.0f32;
        for &sample in &self.window[..self.filled] {
            let abs = sample.abs();
            if abs > peak {
                peak = abs;
            }
            sum_squares += sample * sample;
        }
        let rms = (sum_squares / self.filled as f32).sqrt();
        AudioLevel {
            peak: peak.min(1.0),
            rms: rms.min(1.0),
            clipping: peak >= CLIP_THRESHOLD,
        }
    }

    /// Copy the window oldest-to-newest into `out` (resized to fit).
    pub fn copy_ordered(&self, out: &mut Vec<f32>) {
        out.clear();
        out.reserve(self.window.len());
        let len = self.window.len();
        for i in 0..len {
            out.push(self.window[(self.write_pos + i) % len]);
        }
    }

    pub fn reset(&mut self) {
        self.window.fill(0.0);
        self.write_pos = 0;
        self.filled = 0;
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new()
    }
}

/// Magnitude-per-bin snapshot for spectrum displays.
#[derive(Debug, Clone)]
pub struct SpectrumData {
    pub frequencies: Vec<f32>,
    /// Magnitudes in dBFS.
    pub magnitudes: Vec<f32>,
}

/// Hann-windowed forward FFT over an analysis tap.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    ordered: Vec<f32>,
    sample_rate: f32,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: f32) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(ANALYSIS_WINDOW);
        let hann = (0..ANALYSIS_WINDOW)
            .map(|i| {
                let phase = i as f32 / (ANALYSIS_WINDOW - 1) as f32;
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * phase).cos()
            })
            .collect();
        Self {
            fft,
            hann,
            scratch: vec![Complex::new(0.0, 0.0); ANALYSIS_WINDOW],
            ordered: Vec::with_capacity(ANALYSIS_WINDOW),
            sample_rate,
        }
    }

    /// Bin count of the produced spectrum (half the FFT size).
    pub fn bin_count(&self) -> usize {
        ANALYSIS_WINDOW / 2
    }

    pub fn spectrum(&mut self, tap: &AnalysisTap) -> SpectrumData {
        tap.copy_ordered(&mut self.ordered);
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = Complex::new(self.ordered[i] * self.hann[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let bins = self.bin_count();
        let nyquist = self.sample_rate / 2.0;
        let scale = 2.0 / ANALYSIS_WINDOW as f32;
        let mut frequencies = Vec::with_capacity(bins);
        let mut magnitudes = Vec::with_capacity(bins);
        for i in 0..bins {
            frequencies.push(i as f32 / bins as f32 * nyquist);
            let magnitude = self.scratch[i].norm() * scale;
            magnitudes.push(20.0 * magnitude.max(1e-9).log10());
        }
        SpectrumData {
            frequencies,
            magnitudes,
        }
    }
}

// Meter scaler mirrors the level atomics used across the engine.
const METER_SCALER: f32 = 1_000_000.0;

/// Lock-free level meter shared between the audio thread (writer) and the
/// level-monitor thread (reader).
#[derive(Debug, Clone)]
pub struct SharedMeter {
    peak: Arc<AtomicU32>,
    rms: Arc<AtomicU32>,
}

impl SharedMeter {
    pub fn new() -> Self {
        Self {
            peak: Arc::new(AtomicU32::new(0)),
            rms: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn store(&self, level: AudioLevel) {
        self.peak
            .store((level.peak * METER_SCALER) as u32, Ordering::Relaxed);
        self.rms
            .store((level.rms * METER_SCALER) as u32, Ordering::Relaxed);
    }

    pub fn load(&self) -> AudioLevel {
        let peak = self.peak.load(Ordering::Relaxed) as f32 / METER_SCALER;
        let rms = self.rms.load(Ordering::Relaxed) as f32 / METER_SCALER;
        AudioLevel {
            peak,
            rms,
            clipping: peak >= CLIP_THRESHOLD,
        }
    }
}

impl Default for SharedMeter {
    fn default() -> Self {
        Self::new()
    }
}
