// src/audio_io.rs

//! cpal output-stream plumbing: the audio engine moves into the output
//! callback, which drains commands and renders blocks for the device.

use crate::engine::AudioEngine;
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, Stream, StreamConfig};

pub fn init_and_run_output(
    output_device_name: Option<String>,
    requested_sample_rate: Option<u32>,
    requested_buffer_size: Option<u32>,
    engine: AudioEngine,
) -> Result<(Stream, u32, u32)> {
    let host = cpal::default_host();
    let output_device = if let Some(name) = &output_device_name {
        host.output_devices()?
            .find(|d| d.name().ok().as_ref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Output device not found: {}", name))?
    } else {
        host.default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No default output device"))?
    };
    println!("Using output device: {}", output_device.name()?);

    let default_output_config = output_device.default_output_config()?;
    let sample_format = default_output_config.sample_format();

    let mut final_config: StreamConfig = default_output_config.into();
    if let Some(sr) = requested_sample_rate {
        final_config.sample_rate = cpal::SampleRate(sr);
    }
    if let Some(bs) = requested_buffer_size {
        final_config.buffer_size = BufferSize::Fixed(bs);
    }

    let stream = match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(&output_device, &final_config, engine)?,
        SampleFormat::I16 => build_output_stream::<i16>(&output_device, &final_config, engine)?,
        SampleFormat::U16 => build_output_stream::<u16>(&output_device, &final_config, engine)?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };
    stream.play()?;

    let active_sr = final_config.sample_rate.0;
    let active_bs = match final_config.buffer_size {
        BufferSize::Fixed(size) => size,
        BufferSize::Default => 512,
    };
    println!(
        "Output stream running at {} Hz, {} sample buffers",
        active_sr, active_bs
    );
    Ok((stream, active_sr, active_bs))
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: AudioEngine,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let err_fn = |err| eprintln!("an error occurred on output stream: {}", err);

    let mut left: Vec<f32> = Vec::new();
    let mut right: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            engine.handle_commands();

            let num_samples = data.len() / channels;
            left.resize(num_samples, 0.0);
            right.resize(num_samples, 0.0);
            engine.process_block(&mut left, &mut right);

            for (i, frame) in data.chunks_mut(channels).enumerate() {
                match frame.len() {
                    0 => {}
                    1 => frame[0] = T::from_sample((left[i] + right[i]) * 0.5),
                    _ => {
                        frame[0] = T::from_sample(left[i]);
                        frame[1] = T::from_sample(right[i]);
                        for sample in frame.iter_mut().skip(2) {
                            *sample = T::from_sample(0.0f32);
                        }
                    }
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
