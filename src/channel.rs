// src/channel.rs

//! One mixer channel's signal path:
//! `source -> 3-band EQ -> parametric EQ -> effect chain -> pan -> gain -> analysis tap`.

use crate::analyzer::{AnalysisTap, SharedMeter};
use crate::effects::EffectChain;
use crate::eq::{AdvancedEqProcessor, ThreeBandEq};
use crate::error::EngineError;
use crate::param::{SharedParam, Smoothed};
use crate::types::{AudioChannel, AudioLevel, ChannelUpdate};
use ringbuf::HeapConsumer;
use std::sync::Arc;

/// The single active input feeding a channel.
pub enum ChannelSource {
    /// Live hardware input, delivered over an SPSC ring from the device
    /// layer's input stream.
    Stream {
        device_id: String,
        consumer: HeapConsumer<f32>,
    },
    /// A loaded file buffer, optionally looped.
    Buffer {
        data: Arc<Vec<f32>>,
        position: usize,
        looping: bool,
    },
}

pub struct ChannelProcessor {
    id: String,
    state: AudioChannel,
    eq: ThreeBandEq,
    advanced_eq: AdvancedEqProcessor,
    chain: EffectChain,
    gain: Smoothed,
    pan: Smoothed,
    /// 1.0 when audible, 0.0 when muted or silenced by another solo;
    /// smoothed so mute toggles never click.
    audibility: Smoothed,
    tap: AnalysisTap,
    meter: SharedMeter,
    source: Option<ChannelSource>,
    scratch: Vec<f32>,
}

impl ChannelProcessor {
    pub fn new(
        channel: AudioChannel,
        meter: SharedMeter,
        sample_rate: f32,
    ) -> Result<Self, EngineError> {
        let chain = EffectChain::from_settings(&channel.effects, sample_rate)?;
        let gain = Smoothed::new(SharedParam::new(channel.gain));
        let pan = Smoothed::new(SharedParam::with_offset(channel.pan, 1.0));
        let audibility = Smoothed::new(SharedParam::new(if channel.muted { 0.0 } else { 1.0 }));
        let eq = ThreeBandEq::new(channel.eq, sample_rate);

        Ok(Self {
            id: channel.id.clone(),
            eq,
            advanced_eq: AdvancedEqProcessor::new(sample_rate),
            chain,
            gain,
            pan,
            audibility,
            tap: AnalysisTap::new(),
            meter,
            source: None,
            scratch: Vec::new(),
            state: channel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &AudioChannel {
        &self.state
    }

    pub fn is_muted(&self) -> bool {
        self.state.muted
    }

    pub fn is_soloed(&self) -> bool {
        self.state.solo
    }

    /// Apply a partial settings update. Gain/pan/mute changes land in the
    /// shared params and ramp on the audio side; they never step.
    pub fn update_settings(&mut self, updates: &ChannelUpdate) {
        if let Some(gain) = updates.gain {
            self.state.gain = gain.clamp(0.0, 1.0);
            self.gain.shared().set(self.state.gain);
        }
        if let Some(pan) = updates.pan {
            self.state.pan = pan.clamp(-1.0, 1.0);
            self.pan.shared().set(self.state.pan);
        }
        if let Some(muted) = updates.muted {
            self.state.muted = muted;
        }
        if let Some(solo) = updates.solo {
            self.state.solo = solo;
        }
        if let Some(eq) = updates.eq {
            self.state.eq = eq;
            self.eq.update_settings(eq);
        }
        if let Some(mix) = updates.wet_dry_mix {
            self.state.effects.wet_dry_mix = mix;
            self.chain.set_wet_dry_mix(mix);
        }
    }

    /// Called once per block by the engine after resolving the solo group.
    pub fn set_audible(&mut self, audible: bool) {
        let target = if audible && !self.state.muted { 1.0 } else { 0.0 };
        self.audibility.shared().set(target);
    }

    /// Attach a live input. Any previous source (stream or buffer) is
    /// stopped and released first; a channel has exactly one source.
    pub fn connect_input_stream(&mut self, device_id: String, consumer: HeapConsumer<f32>) {
        self.stop();
        self.source = Some(ChannelSource::Stream {
            device_id,
            consumer,
        });
    }

    /// Play a loaded buffer, replacing whatever source was active.
    pub fn play_buffer(&mut self, data: Arc<Vec<f32>>, looping: bool) {
        self.stop();
        if data.is_empty() {
            return;
        }
        self.source = Some(ChannelSource::Buffer {
            data,
            position: 0,
            looping,
        });
    }

    /// Drop the active source, releasing the stream consumer or buffer.
    pub fn stop(&mut self) {
        self.source = None;
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn chain_mut(&mut self) -> &mut EffectChain {
        &mut self.chain
    }

    pub fn advanced_eq(&self) -> &AdvancedEqProcessor {
        &self.advanced_eq
    }

    pub fn advanced_eq_mut(&mut self) -> &mut AdvancedEqProcessor {
        &mut self.advanced_eq
    }

    /// Level of the latest analysis window (post-gain signal).
    pub fn level(&self) -> AudioLevel {
        self.tap.level()
    }

    fn fill_from_source(&mut self, num_samples: usize) {
        self.scratch.clear();
        self.scratch.resize(num_samples, 0.0);

        let mut finished = false;
        match self.source.as_mut() {
            None => {}
            Some(ChannelSource::Stream { consumer, .. }) => {
                let read = consumer.pop_slice(&mut self.scratch);
                // Underruns render as silence; the stream stays attached.
                self.scratch[read..].iter_mut().for_each(|s| *s = 0.0);
            }
            Some(ChannelSource::Buffer {
                data,
                position,
                looping,
            }) => {
                for slot in self.scratch.iter_mut() {
                    if *position >= data.len() {
                        if *looping {
                            *position = 0;
                        } else {
                            finished = true;
                            break;
                        }
                    }
                    *slot = data[*position];
                    *position += 1;
                }
            }
        }
        if finished {
            self.source = None;
        }
    }

    /// Render one block, mixing into the stereo master accumulators.
    /// Returns the post-gain mono signal for the recording tap.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) -> &[f32] {
        let num_samples = left.len().min(right.len());
        self.fill_from_source(num_samples);

        // Tone and effect stages run even without a source so delay and
        // reverb tails keep decaying into the mix.
        self.eq.process_block(&mut self.scratch);
        self.advanced_eq.process_block(&mut self.scratch);
        self.chain.process_block(&mut self.scratch);

        for i in 0..num_samples {
            let gain = self.gain.next_sample() * self.audibility.next_sample();
            let sample = self.scratch[i] * gain;
            self.scratch[i] = sample;

            // Constant-power pan.
            let angle = (self.pan.next_sample() + 1.0) * std::f32::consts::FRAC_PI_4;
            left[i] += sample * angle.cos();
            right[i] += sample * angle.sin();
        }

        self.tap.push_block(&self.scratch[..num_samples]);
        self.meter.store(self.tap.level());
        &self.scratch[..num_samples]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EqSettings;

    const SR: f32 = 44100.0;
    const BLOCK: usize = 512;

    fn full_scale_sine(len: usize) -> Arc<Vec<f32>> {
        Arc::new(
            (0..len)
                .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / SR).sin())
                .collect(),
        )
    }

    fn run_blocks(processor: &mut ChannelProcessor, blocks: usize) {
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for _ in 0..blocks {
            left.fill(0.0);
            right.fill(0.0);
            processor.process_block(&mut left, &mut right);
        }
    }

    fn test_channel(gain: f32) -> ChannelProcessor {
        let mut channel = AudioChannel::new("chan-1", "Channel 1");
        channel.gain = gain;
        channel.eq = EqSettings {
            enabled: false,
            ..EqSettings::default()
        };
        ChannelProcessor::new(channel, SharedMeter::new(), SR).unwrap()
    }

    #[test]
    fn gain_scales_the_measured_peak() {
        let mut processor = test_channel(0.75);
        processor.play_buffer(full_scale_sine(SR as usize), true);
        run_blocks(&mut processor, 40);
        let level = processor.level();
        assert!(
            (level.peak - 0.75).abs() < 0.03,
            "peak tracks gain: {}",
            level.peak
        );

        // Lowering the gain ramps the level down proportionally.
        processor.update_settings(&ChannelUpdate {
            gain: Some(0.3),
            ..Default::default()
        });
        run_blocks(&mut processor, 80);
        let level = processor.level();
        assert!(
            (level.peak - 0.3).abs() < 0.03,
            "peak follows gain change: {}",
            level.peak
        );
        assert!(level.rms <= level.peak);
        assert!(!level.clipping);
    }

    #[test]
    fn clipping_reported_at_full_scale() {
        let mut processor = test_channel(1.0);
        processor.play_buffer(full_scale_sine(SR as usize), true);
        run_blocks(&mut processor, 40);
        let level = processor.level();
        assert!(level.peak >= 0.99);
        assert!(level.clipping);
    }

    #[test]
    fn new_source_replaces_the_old_one() {
        let mut processor = test_channel(1.0);
        processor.play_buffer(full_scale_sine(1024), true);
        assert!(processor.has_source());

        // Connecting a second buffer implicitly stops the first.
        processor.play_buffer(full_scale_sine(2048), false);
        assert!(processor.has_source());

        processor.stop();
        assert!(!processor.has_source());
    }

    #[test]
    fn non_looping_buffer_releases_itself_at_the_end() {
        let mut processor = test_channel(1.0);
        processor.play_buffer(full_scale_sine(BLOCK / 2), false);
        run_blocks(&mut processor, 2);
        assert!(!processor.has_source(), "finished buffer is released");
    }

    #[test]
    fn muted_channel_ramps_to_silence() {
        let mut processor = test_channel(1.0);
        processor.play_buffer(full_scale_sine(SR as usize), true);
        processor.set_audible(true);
        run_blocks(&mut processor, 20);

        processor.update_settings(&ChannelUpdate {
            muted: Some(true),
            ..Default::default()
        });
        processor.set_audible(true);
        run_blocks(&mut processor, 100);
        let level = processor.level();
        assert!(level.peak < 0.01, "muted output: {}", level.peak);
    }

    #[test]
    fn operations_without_a_source_are_noops() {
        let mut processor = test_channel(0.8);
        // No source: stopping and processing are harmless.
        processor.stop();
        run_blocks(&mut processor, 4);
        assert_eq!(processor.level(), AudioLevel::silent());
    }

    #[test]
    fn pan_moves_energy_between_sides() {
        let mut processor = test_channel(1.0);
        processor.update_settings(&ChannelUpdate {
            pan: Some(-1.0),
            ..Default::default()
        });
        processor.play_buffer(full_scale_sine(SR as usize), true);

        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for _ in 0..80 {
            left.fill(0.0);
            right.fill(0.0);
            processor.process_block(&mut left, &mut right);
        }
        let left_energy: f32 = left.iter().map(|s| s * s).sum();
        let right_energy: f32 = right.iter().map(|s| s * s).sum();
        assert!(left_energy > right_energy * 50.0, "hard-left pan");
    }
}
