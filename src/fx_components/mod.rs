// src/fx_components/mod.rs

// Declare all effect processor modules
pub mod compressor;
pub mod delay;
pub mod distortion;
pub mod reverb;

pub use compressor::Compressor;
pub use delay::Delay;
pub use distortion::Distortion;
pub use reverb::Reverb;

use crate::error::EngineError;
use crate::types::EffectKind;
use std::collections::BTreeMap;

/// A common interface for all insert effect processors in a channel chain.
///
/// Processors own their entire internal DSP state; dropping a box releases
/// everything. Reverb and delay blend wet/dry internally; compressor and
/// distortion are fully wet.
pub trait EffectProcessor: Send {
    fn kind(&self) -> EffectKind;

    /// Apply named parameter values. Unknown names are ignored so partial
    /// updates can be forwarded straight from the control surface.
    fn update_parameters(&mut self, parameters: &BTreeMap<String, f32>);

    /// Process one block in place.
    fn process_block(&mut self, buffer: &mut [f32]);

    /// Clear all internal delay/filter state (tails, envelopes).
    fn reset(&mut self);
}

impl std::fmt::Debug for dyn EffectProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectProcessor")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Build a processor for the requested effect type. Chorus has no DSP
/// implementation and is rejected before any construction happens.
pub fn build_processor(
    kind: EffectKind,
    sample_rate: f32,
) -> Result<Box<dyn EffectProcessor>, EngineError> {
    match kind {
        EffectKind::Reverb => Ok(Box::new(Reverb::new(sample_rate))),
        EffectKind::Delay => Ok(Box::new(Delay::new(sample_rate))),
        EffectKind::Compressor => Ok(Box::new(Compressor::new(sample_rate))),
        EffectKind::Distortion => Ok(Box::new(Distortion::new(sample_rate))),
        EffectKind::Chorus => Err(EngineError::UnsupportedFormat(format!(
            "effect type {}",
            kind
        ))),
    }
}
