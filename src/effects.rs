// src/effects.rs

//! Per-channel insert chain: builds live processors from `Effect` recipes
//! and runs them serially with a send/return wet-dry mix around the whole
//! chain.

use crate::error::EngineError;
use crate::fx_components::{build_processor, EffectProcessor};
use crate::types::{Effect, EffectChainSettings};
use std::collections::BTreeMap;

struct ChainSlot {
    effect: Effect,
    processor: Box<dyn EffectProcessor>,
}

/// Ordered effect chain. Insertion order is processing order; rebuilding
/// the chain (add/remove) drops the removed processors, which releases all
/// of their internal buffers.
pub struct EffectChain {
    sample_rate: f32,
    slots: Vec<ChainSlot>,
    wet_dry_mix: f32,
    wet_buffer: Vec<f32>,
}

impl EffectChain {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            slots: Vec::new(),
            wet_dry_mix: 0.0,
            wet_buffer: Vec::new(),
        }
    }

    /// Build a chain from serialized settings, skipping nothing: an
    /// unsupported effect kind fails the whole build.
    pub fn from_settings(
        settings: &EffectChainSettings,
        sample_rate: f32,
    ) -> Result<Self, EngineError> {
        let mut chain = Self::new(sample_rate);
        chain.wet_dry_mix = settings.wet_dry_mix.clamp(0.0, 1.0);
        for effect in &settings.effects {
            chain.add_effect(effect.clone())?;
        }
        Ok(chain)
    }

    pub fn add_effect(&mut self, effect: Effect) -> Result<(), EngineError> {
        let mut processor = build_processor(effect.kind, self.sample_rate)?;
        processor.update_parameters(&effect.parameters);
        self.slots.push(ChainSlot { effect, processor });
        Ok(())
    }

    pub fn remove_effect(&mut self, effect_id: &str) {
        self.slots.retain(|slot| slot.effect.id != effect_id);
    }

    pub fn has_effect(&self, effect_id: &str) -> bool {
        self.slots.iter().any(|slot| slot.effect.id == effect_id)
    }

    pub fn update_effect_parameters(
        &mut self,
        effect_id: &str,
        parameters: &BTreeMap<String, f32>,
    ) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.effect.id == effect_id) {
            for (name, value) in parameters {
                slot.effect.parameters.insert(name.clone(), *value);
            }
            slot.processor.update_parameters(parameters);
            true
        } else {
            false
        }
    }

    pub fn set_effect_enabled(&mut self, effect_id: &str, enabled: bool) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.effect.id == effect_id) {
            slot.effect.enabled = enabled;
        }
    }

    pub fn set_wet_dry_mix(&mut self, mix: f32) {
        self.wet_dry_mix = mix.clamp(0.0, 1.0);
    }

    pub fn wet_dry_mix(&self) -> f32 {
        self.wet_dry_mix
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.slots.iter().map(|slot| slot.effect.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Send/return processing: the chain input is the dry signal scaled by
    /// the mix; the wet path always runs so effect tails keep decaying even
    /// while the mix knob sits low.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        if self.slots.is_empty() {
            return;
        }
        let wet_mix = self.wet_dry_mix;
        let dry_mix = 1.0 - wet_mix;

        self.wet_buffer.clear();
        self.wet_buffer.extend(buffer.iter().map(|s| s * wet_mix));

        for slot in self.slots.iter_mut() {
            if slot.effect.enabled {
                slot.processor.process_block(&mut self.wet_buffer);
            }
        }

        for (out, &wet) in buffer.iter_mut().zip(self.wet_buffer.iter()) {
            *out = *out * dry_mix + wet;
        }
    }

    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.processor.reset();
        }
    }
}
