// src/device.rs

//! Audio device layer. The engine depends only on the `DeviceProvider`
//! contract; the cpal implementation enumerates hardware and pumps input
//! frames into an SPSC ring the channel drains from the audio callback.

use crate::error::EngineError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{HeapConsumer, HeapRb};

/// Input ring sized for roughly half a second at 48 kHz.
const INPUT_RING_CAPACITY: usize = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
}

/// An opened input: the consumer half of the sample ring plus the device
/// description for the connection event.
pub struct OpenedInput {
    pub device: AudioDeviceInfo,
    pub consumer: HeapConsumer<f32>,
}

impl std::fmt::Debug for OpenedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedInput")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// What the engine needs from an audio backend.
pub trait DeviceProvider {
    fn enumerate(&mut self) -> Result<Vec<AudioDeviceInfo>, EngineError>;
    fn open_input(&mut self, device_id: &str) -> Result<OpenedInput, EngineError>;
}

/// cpal-backed provider. Opened input streams are kept alive here; they
/// stop when the provider is dropped or the stream is replaced.
pub struct CpalDeviceProvider {
    host: cpal::Host,
    streams: Vec<cpal::Stream>,
}

impl CpalDeviceProvider {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            host: cpal::default_host(),
            streams: Vec::new(),
        })
    }

    fn find_input_device(&self, device_id: &str) -> Result<cpal::Device, EngineError> {
        if device_id == "default" {
            return self
                .host
                .default_input_device()
                .ok_or_else(|| EngineError::Device("no default input device".to_string()));
        }
        let mut devices = self
            .host
            .input_devices()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        devices
            .find(|d| d.name().ok().as_deref() == Some(device_id))
            .ok_or_else(|| EngineError::Device(format!("input device not found: {}", device_id)))
    }
}

impl DeviceProvider for CpalDeviceProvider {
    fn enumerate(&mut self) -> Result<Vec<AudioDeviceInfo>, EngineError> {
        let mut result = Vec::new();
        let inputs = self
            .host
            .input_devices()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        for device in inputs {
            if let Ok(name) = device.name() {
                result.push(AudioDeviceInfo {
                    id: name.clone(),
                    name,
                    kind: DeviceKind::Input,
                });
            }
        }
        let outputs = self
            .host
            .output_devices()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        for device in outputs {
            if let Ok(name) = device.name() {
                result.push(AudioDeviceInfo {
                    id: name.clone(),
                    name,
                    kind: DeviceKind::Output,
                });
            }
        }
        Ok(result)
    }

    fn open_input(&mut self, device_id: &str) -> Result<OpenedInput, EngineError> {
        let device = self.find_input_device(device_id)?;
        let config = device
            .default_input_config()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        let stream_config: cpal::StreamConfig = config.clone().into();
        let channels = stream_config.channels as usize;

        let ring = HeapRb::<f32>::new(INPUT_RING_CAPACITY);
        let (mut producer, consumer) = ring.split();

        let err_fn = |err| eprintln!("an error occurred on input stream: {}", err);
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        let mono = frame.iter().sum::<f32>() / channels as f32;
                        // Ring full: drop the sample rather than block.
                        producer.push(mono).ok();
                    }
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        let mono = frame
                            .iter()
                            .map(|&s| s as f32 / i16::MAX as f32)
                            .sum::<f32>()
                            / channels as f32;
                        producer.push(mono).ok();
                    }
                },
                err_fn,
                None,
            ),
            format => {
                return Err(EngineError::Device(format!(
                    "unsupported input sample format: {}",
                    format
                )))
            }
        }
        .map_err(|e| EngineError::Device(e.to_string()))?;

        stream
            .play()
            .map_err(|e| EngineError::Device(e.to_string()))?;
        self.streams.push(stream);

        let name = device.name().unwrap_or_else(|_| device_id.to_string());
        Ok(OpenedInput {
            device: AudioDeviceInfo {
                id: device_id.to_string(),
                name,
                kind: DeviceKind::Input,
            },
            consumer,
        })
    }
}

/// In-memory provider for tests: a fixed device list, and opened inputs
/// backed by a ring the test can feed.
#[cfg(test)]
pub struct MockDeviceProvider {
    pub devices: Vec<AudioDeviceInfo>,
    pub producers: Vec<(String, ringbuf::HeapProducer<f32>)>,
}

#[cfg(test)]
impl MockDeviceProvider {
    pub fn with_input(device_id: &str) -> Self {
        Self {
            devices: vec![AudioDeviceInfo {
                id: device_id.to_string(),
                name: device_id.to_string(),
                kind: DeviceKind::Input,
            }],
            producers: Vec::new(),
        }
    }
}

#[cfg(test)]
impl DeviceProvider for MockDeviceProvider {
    fn enumerate(&mut self) -> Result<Vec<AudioDeviceInfo>, EngineError> {
        Ok(self.devices.clone())
    }

    fn open_input(&mut self, device_id: &str) -> Result<OpenedInput, EngineError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.id == device_id && d.kind == DeviceKind::Input)
            .cloned()
            .ok_or_else(|| {
                EngineError::Device(format!("input device not found: {}", device_id))
            })?;
        let ring = HeapRb::<f32>::new(INPUT_RING_CAPACITY);
        let (producer, consumer) = ring.split();
        self.producers.push((device_id.to_string(), producer));
        Ok(OpenedInput { device, consumer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_rejects_unknown_devices() {
        let mut provider = MockDeviceProvider::with_input("mic-1");
        assert!(provider.open_input("mic-1").is_ok());
        let err = provider.open_input("missing").unwrap_err();
        assert!(matches!(err, EngineError::Device(_)));
    }

    #[test]
    fn mock_provider_streams_samples_through_the_ring() {
        let mut provider = MockDeviceProvider::with_input("mic-1");
        let mut opened = provider.open_input("mic-1").unwrap();
        let (_, producer) = provider.producers.last_mut().unwrap();
        for i in 0..64 {
            producer.push(i as f32).unwrap();
        }
        let mut buffer = vec![0.0f32; 64];
        let read = opened.consumer.pop_slice(&mut buffer);
        assert_eq!(read, 64);
        assert_eq!(buffer[10], 10.0);
    }
}
