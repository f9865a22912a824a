// src/engine.rs

//! The orchestrator. `AudioEngine` lives on the audio context: it drains
//! the command queue, renders every channel and instrument into the master
//! bus, feeds the recording taps, and writes the shared meters.
//! `EngineController` is the control-context facade the application (and
//! the MIDI engine) talk to.

use crate::analyzer::{AnalysisTap, SharedMeter};
use crate::channel::ChannelProcessor;
use crate::device::{AudioDeviceInfo, DeviceProvider};
use crate::eq::BandUpdate;
use crate::error::EngineError;
use crate::instrument::{InstrumentKind, VirtualInstrumentEngine};
use crate::midi::{MappingTarget, MidiEngine, MidiMessage, ParameterChange};
use crate::param::{SharedParam, Smoothed};
use crate::recording::{
    self, ExportOptions, RecordingConfig, RecordingEngine, RecordingSession,
};
use crate::types::{
    db_to_linear, AudioChannel, AudioLevel, ChannelUpdate, Effect, EffectKind, EqBand,
    LimiterSettings, MasterSection, ProjectSettings,
};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const COMMAND_QUEUE_CAPACITY: usize = 256;
const EVENT_QUEUE_CAPACITY: usize = 64;

/// One level-monitor tick per display refresh.
const MONITOR_INTERVAL: Duration = Duration::from_millis(16);

// --- Commands & events ---

/// Control-to-audio commands, drained at the top of each callback.
pub enum EngineCommand {
    CreateChannel {
        channel: AudioChannel,
        meter: SharedMeter,
    },
    UpdateChannel {
        channel_id: String,
        updates: ChannelUpdate,
    },
    RemoveChannel {
        channel_id: String,
    },
    ConnectInputStream {
        channel_id: String,
        device_id: String,
        consumer: HeapConsumer<f32>,
    },
    PlayBuffer {
        channel_id: String,
        data: Arc<Vec<f32>>,
        looping: bool,
    },
    StopChannel {
        channel_id: String,
    },
    AddEffect {
        channel_id: String,
        effect: Effect,
    },
    RemoveEffect {
        channel_id: String,
        effect_id: String,
    },
    UpdateEffectParameters {
        effect_id: String,
        parameters: BTreeMap<String, f32>,
    },
    SetEffectEnabled {
        effect_id: String,
        enabled: bool,
    },
    AddEqBand {
        channel_id: String,
        band: EqBand,
    },
    UpdateEqBand {
        channel_id: String,
        band_id: String,
        updates: BandUpdate,
    },
    RemoveEqBand {
        channel_id: String,
        band_id: String,
    },
    SetEqBypassed {
        channel_id: String,
        bypassed: bool,
    },
    SetMasterLimiter(LimiterSettings),
    CreateInstrument {
        instrument_id: String,
        name: String,
    },
    RemoveInstrument {
        instrument_id: String,
    },
    InstrumentMidi {
        instrument_id: String,
        message: MidiMessage,
    },
    UpdateInstrumentParameter {
        instrument_id: String,
        parameter: String,
        value: f32,
    },
    LoadInstrumentPreset {
        instrument_id: String,
        preset_id: String,
    },
    CreateRecordingSession {
        session_id: String,
        name: String,
        config: RecordingConfig,
    },
    StartRecording {
        session_id: String,
        channel_ids: Vec<String>,
    },
    StopRecording,
    PauseRecording,
    ResumeRecording,
    Shutdown,
}

/// Audio-to-control notifications.
pub enum EngineEvent {
    RecordingFinished(Box<RecordingSession>),
    Error(String),
}

/// Listener-facing engine events, emitted on the control context.
#[derive(Debug, Clone)]
pub enum AudioEngineEvent {
    LevelUpdate {
        channel_id: String,
        level: AudioLevel,
    },
    ClippingDetected {
        channel_id: String,
    },
    DeviceConnected {
        device: AudioDeviceInfo,
    },
    DeviceDisconnected {
        device_id: String,
    },
    RecordingFinished {
        session_id: String,
    },
    TransportControl {
        parameter: String,
        value: f32,
    },
    Error {
        message: String,
    },
}

type EventListener = Box<dyn Fn(&AudioEngineEvent) + Send + Sync>;
type ListenerMap = Arc<RwLock<BTreeMap<u64, EventListener>>>;
type MeterMap = Arc<RwLock<BTreeMap<String, SharedMeter>>>;

fn emit(listeners: &ListenerMap, event: &AudioEngineEvent) {
    if let Ok(listeners) = listeners.read() {
        for listener in listeners.values() {
            listener(event);
        }
    }
}

// --- Master limiter ---

/// Peak limiter on the master bus, one gain applied to both sides.
struct Limiter {
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl Limiter {
    fn new(sample_rate: f32) -> Self {
        let attack_ms = 0.01;
        let release_ms = 80.0;
        Self {
            attack_coeff: (-(1.0 / (attack_ms * 0.001 * sample_rate))).exp(),
            release_coeff: (-(1.0 / (release_ms * 0.001 * sample_rate))).exp(),
            envelope: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, left: &mut f32, right: &mut f32, threshold: f32) {
        let input_abs = left.abs().max(right.abs());
        self.envelope = if input_abs > self.envelope {
            self.attack_coeff * (self.envelope - input_abs) + input_abs
        } else {
            self.release_coeff * (self.envelope - input_abs) + input_abs
        };
        self.envelope = self.envelope.max(1e-6);

        if self.envelope > threshold {
            let gain = threshold / self.envelope;
            *left *= gain;
            *right *= gain;
        }
    }
}

// --- Audio-side engine ---

pub struct AudioEngine {
    sample_rate: f32,
    command_consumer: HeapConsumer<EngineCommand>,
    event_producer: HeapProducer<EngineEvent>,
    channels: BTreeMap<String, ChannelProcessor>,
    instruments: VirtualInstrumentEngine,
    instrument_bus: Vec<f32>,
    recording: RecordingEngine,
    master_gain: Smoothed,
    master_mute: Smoothed,
    limiter: Limiter,
    limiter_settings: LimiterSettings,
    master_tap: AnalysisTap,
    master_meter: SharedMeter,
    shutting_down: bool,
}

impl AudioEngine {
    /// Build the engine pair: the audio-side engine (move it into the
    /// output callback) and the control-side facade.
    pub fn create(sample_rate: f32, master: MasterSection) -> (AudioEngine, EngineController) {
        let command_rb = HeapRb::<EngineCommand>::new(COMMAND_QUEUE_CAPACITY);
        let (command_producer, command_consumer) = command_rb.split();
        let event_rb = HeapRb::<EngineEvent>::new(EVENT_QUEUE_CAPACITY);
        let (event_producer, event_consumer) = event_rb.split();

        let master_gain = SharedParam::new(master.main_gain);
        let master_mute = SharedParam::new(if master.muted { 0.0 } else { 1.0 });
        let master_meter = SharedMeter::new();

        let engine = AudioEngine {
            sample_rate,
            command_consumer,
            event_producer,
            channels: BTreeMap::new(),
            instruments: VirtualInstrumentEngine::new(sample_rate),
            instrument_bus: Vec::new(),
            recording: RecordingEngine::new(),
            master_gain: Smoothed::new(master_gain.clone()),
            master_mute: Smoothed::new(master_mute.clone()),
            limiter: Limiter::new(sample_rate),
            limiter_settings: master.limiter,
            master_tap: AnalysisTap::new(),
            master_meter: master_meter.clone(),
            shutting_down: false,
        };

        let controller = EngineController::new(
            sample_rate,
            command_producer,
            event_consumer,
            master,
            master_gain,
            master_mute,
            master_meter,
        );
        (engine, controller)
    }

    fn push_error(&mut self, message: String) {
        eprintln!("{}", message);
        self.event_producer.push(EngineEvent::Error(message)).ok();
    }

    /// Drain pending commands. Called once per audio callback, before
    /// rendering.
    pub fn handle_commands(&mut self) {
        while let Some(command) = self.command_consumer.pop() {
            match command {
                EngineCommand::CreateChannel { channel, meter } => {
                    let id = channel.id.clone();
                    match ChannelProcessor::new(channel, meter, self.sample_rate) {
                        Ok(processor) => {
                            self.channels.insert(id, processor);
                        }
                        Err(e) => self.push_error(format!("Failed to create channel: {}", e)),
                    }
                }
                EngineCommand::UpdateChannel {
                    channel_id,
                    updates,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.update_settings(&updates);
                    }
                }
                EngineCommand::RemoveChannel { channel_id } => {
                    // Dropping the processor releases its source, effects
                    // and EQ stages depth-first.
                    self.channels.remove(&channel_id);
                }
                EngineCommand::ConnectInputStream {
                    channel_id,
                    device_id,
                    consumer,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.connect_input_stream(device_id, consumer);
                    }
                }
                EngineCommand::PlayBuffer {
                    channel_id,
                    data,
                    looping,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.play_buffer(data, looping);
                    }
                }
                EngineCommand::StopChannel { channel_id } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.stop();
                    }
                }
                EngineCommand::AddEffect { channel_id, effect } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        if let Err(e) = channel.chain_mut().add_effect(effect) {
                            self.push_error(format!("Failed to add effect: {}", e));
                        }
                    }
                }
                EngineCommand::RemoveEffect {
                    channel_id,
                    effect_id,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.chain_mut().remove_effect(&effect_id);
                    }
                }
                EngineCommand::UpdateEffectParameters {
                    effect_id,
                    parameters,
                } => {
                    // Effects are addressed by id alone; find the chain
                    // that hosts this one.
                    for channel in self.channels.values_mut() {
                        if channel
                            .chain_mut()
                            .update_effect_parameters(&effect_id, &parameters)
                        {
                            break;
                        }
                    }
                }
                EngineCommand::SetEffectEnabled { effect_id, enabled } => {
                    for channel in self.channels.values_mut() {
                        if channel.chain_mut().has_effect(&effect_id) {
                            channel.chain_mut().set_effect_enabled(&effect_id, enabled);
                            break;
                        }
                    }
                }
                EngineCommand::AddEqBand { channel_id, band } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.advanced_eq_mut().add_band(band);
                    }
                }
                EngineCommand::UpdateEqBand {
                    channel_id,
                    band_id,
                    updates,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.advanced_eq_mut().update_band(&band_id, &updates);
                    }
                }
                EngineCommand::RemoveEqBand {
                    channel_id,
                    band_id,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.advanced_eq_mut().remove_band(&band_id);
                    }
                }
                EngineCommand::SetEqBypassed {
                    channel_id,
                    bypassed,
                } => {
                    if let Some(channel) = self.channels.get_mut(&channel_id) {
                        channel.advanced_eq_mut().set_bypassed(bypassed);
                    }
                }
                EngineCommand::SetMasterLimiter(settings) => {
                    self.limiter_settings = settings;
                }
                EngineCommand::CreateInstrument {
                    instrument_id,
                    name,
                } => {
                    self.instruments.insert_synthesizer(instrument_id, name);
                }
                EngineCommand::RemoveInstrument { instrument_id } => {
                    self.instruments.remove_instrument(&instrument_id);
                }
                EngineCommand::InstrumentMidi {
                    instrument_id,
                    message,
                } => {
                    self.instruments.process_midi(&instrument_id, &message);
                }
                EngineCommand::UpdateInstrumentParameter {
                    instrument_id,
                    parameter,
                    value,
                } => {
                    self.instruments
                        .update_parameter(&instrument_id, &parameter, value);
                }
                EngineCommand::LoadInstrumentPreset {
                    instrument_id,
                    preset_id,
                } => {
                    self.instruments.load_preset(&instrument_id, &preset_id);
                }
                EngineCommand::CreateRecordingSession {
                    session_id,
                    name,
                    config,
                } => {
                    self.recording
                        .create_session_with_id(session_id, name, &config);
                }
                EngineCommand::StartRecording {
                    session_id,
                    channel_ids,
                } => {
                    self.recording.start_recording(&session_id, &channel_ids);
                }
                EngineCommand::StopRecording => {
                    if let Some(session) = self.recording.stop_recording() {
                        self.event_producer
                            .push(EngineEvent::RecordingFinished(Box::new(session)))
                            .ok();
                    }
                }
                EngineCommand::PauseRecording => self.recording.pause_recording(),
                EngineCommand::ResumeRecording => self.recording.resume_recording(),
                EngineCommand::Shutdown => {
                    // Depth-first teardown: channels (sources, effects,
                    // bands) first, then subsystems, then the master stage.
                    self.channels.clear();
                    self.recording.shutdown();
                    self.instruments.shutdown();
                    self.master_tap.reset();
                    self.shutting_down = true;
                }
            }
        }
    }

    /// Render one block into the stereo output. Assumes `handle_commands`
    /// already ran this callback.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        let num_samples = left.len().min(right.len());
        left[..num_samples].fill(0.0);
        right[..num_samples].fill(0.0);
        if self.shutting_down {
            return;
        }

        // Solo group: any soloed channel silences the rest.
        let any_solo = self.channels.values().any(|c| c.is_soloed());

        let channels = &mut self.channels;
        let recording = &mut self.recording;
        for (channel_id, channel) in channels.iter_mut() {
            channel.set_audible(!any_solo || channel.is_soloed());
            let processed = channel.process_block(&mut left[..num_samples], &mut right[..num_samples]);
            recording.capture_block(channel_id, processed);
        }

        // Instruments render onto their own bus, then join the mix center.
        self.instrument_bus.clear();
        self.instrument_bus.resize(num_samples, 0.0);
        self.instruments.process_block(&mut self.instrument_bus);
        for i in 0..num_samples {
            left[i] += self.instrument_bus[i];
            right[i] += self.instrument_bus[i];
        }

        let limiter_threshold = db_to_linear(self.limiter_settings.threshold);
        for i in 0..num_samples {
            let gain = self.master_gain.next_sample() * self.master_mute.next_sample();
            left[i] *= gain;
            right[i] *= gain;
            if self.limiter_settings.enabled {
                self.limiter
                    .process(&mut left[i], &mut right[i], limiter_threshold);
            }
            // The master tap watches the mono sum.
            self.instrument_bus[i] = (left[i] + right[i]) * 0.5;
        }
        self.master_tap.push_block(&self.instrument_bus[..num_samples]);
        self.master_meter.store(self.master_tap.level());
    }

    pub fn master_level(&self) -> AudioLevel {
        self.master_tap.level()
    }

    pub fn channel(&self, channel_id: &str) -> Option<&ChannelProcessor> {
        self.channels.get(channel_id)
    }

    pub fn channel_mut(&mut self, channel_id: &str) -> Option<&mut ChannelProcessor> {
        self.channels.get_mut(channel_id)
    }

    pub fn instruments(&self) -> &VirtualInstrumentEngine {
        &self.instruments
    }
}

// --- Level monitor ---

/// Control-thread polling loop: once per tick it reads every shared meter
/// and fans the readings out to the listeners. Must be stopped on
/// shutdown or it will keep spinning against a torn-down engine.
struct LevelMonitor {
    handle: Option<JoinHandle<()>>,
    should_exit: Arc<AtomicBool>,
}

impl LevelMonitor {
    fn start(channel_meters: MeterMap, master_meter: SharedMeter, listeners: ListenerMap) -> Self {
        let should_exit = Arc::new(AtomicBool::new(false));
        let exit_flag = should_exit.clone();

        let handle = thread::spawn(move || {
            while !exit_flag.load(Ordering::Relaxed) {
                let master_level = master_meter.load();
                emit(
                    &listeners,
                    &AudioEngineEvent::LevelUpdate {
                        channel_id: "master".to_string(),
                        level: master_level,
                    },
                );
                if master_level.clipping {
                    emit(
                        &listeners,
                        &AudioEngineEvent::ClippingDetected {
                            channel_id: "master".to_string(),
                        },
                    );
                }

                if let Ok(meters) = channel_meters.read() {
                    for (channel_id, meter) in meters.iter() {
                        let level = meter.load();
                        emit(
                            &listeners,
                            &AudioEngineEvent::LevelUpdate {
                                channel_id: channel_id.clone(),
                                level,
                            },
                        );
                        if level.clipping {
                            emit(
                                &listeners,
                                &AudioEngineEvent::ClippingDetected {
                                    channel_id: channel_id.clone(),
                                },
                            );
                        }
                    }
                }
                thread::sleep(MONITOR_INTERVAL);
            }
        });

        Self {
            handle: Some(handle),
            should_exit,
        }
    }

    fn stop(&mut self) {
        self.should_exit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for LevelMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// --- Control-side facade ---

type SharedCommandProducer = Arc<Mutex<HeapProducer<EngineCommand>>>;

pub struct EngineController {
    sample_rate: f32,
    commands: SharedCommandProducer,
    events: HeapConsumer<EngineEvent>,
    channels: BTreeMap<String, AudioChannel>,
    channel_meters: MeterMap,
    master: MasterSection,
    master_gain: SharedParam,
    master_mute: SharedParam,
    master_meter: SharedMeter,
    listeners: ListenerMap,
    next_listener_id: u64,
    midi: MidiEngine,
    /// Instrument receiving live note input, if any.
    midi_note_target: Option<String>,
    monitor: Option<LevelMonitor>,
    finished_sessions: BTreeMap<String, RecordingSession>,
    next_session_id: u64,
    next_instrument_id: u64,
    shut_down: bool,
}

impl EngineController {
    #[allow(clippy::too_many_arguments)]
    fn new(
        sample_rate: f32,
        command_producer: HeapProducer<EngineCommand>,
        event_consumer: HeapConsumer<EngineEvent>,
        master: MasterSection,
        master_gain: SharedParam,
        master_mute: SharedParam,
        master_meter: SharedMeter,
    ) -> Self {
        let commands: SharedCommandProducer = Arc::new(Mutex::new(command_producer));
        let listeners: ListenerMap = Arc::new(RwLock::new(BTreeMap::new()));
        let channel_meters: MeterMap = Arc::new(RwLock::new(BTreeMap::new()));

        let mut midi = MidiEngine::new(Box::new(crate::midi::MemoryMappingStore::default()));
        Self::install_midi_routing(&mut midi, &commands, &master_gain, &listeners);

        let monitor = LevelMonitor::start(
            channel_meters.clone(),
            master_meter.clone(),
            listeners.clone(),
        );

        Self {
            sample_rate,
            commands,
            events: event_consumer,
            channels: BTreeMap::new(),
            channel_meters,
            master,
            master_gain,
            master_mute,
            master_meter,
            listeners,
            next_listener_id: 0,
            midi,
            midi_note_target: None,
            monitor: Some(monitor),
            finished_sessions: BTreeMap::new(),
            next_session_id: 0,
            next_instrument_id: 0,
            shut_down: false,
        }
    }

    /// Wire MIDI-mapped parameter changes to their targets.
    fn install_midi_routing(
        midi: &mut MidiEngine,
        commands: &SharedCommandProducer,
        master_gain: &SharedParam,
        listeners: &ListenerMap,
    ) {
        let commands = commands.clone();
        let master_gain = master_gain.clone();
        let listeners = listeners.clone();
        midi.add_parameter_sink(Box::new(move |change: &ParameterChange| {
            let command = match &change.target {
                MappingTarget::Channel(channel_id) => {
                    let mut updates = ChannelUpdate::default();
                    match change.parameter.as_str() {
                        "gain" => updates.gain = Some(change.value),
                        "pan" => updates.pan = Some(change.value.clamp(-1.0, 1.0)),
                        _ => return,
                    }
                    Some(EngineCommand::UpdateChannel {
                        channel_id: channel_id.clone(),
                        updates,
                    })
                }
                MappingTarget::Effect(effect_id) => {
                    let mut parameters = BTreeMap::new();
                    parameters.insert(change.parameter.clone(), change.value);
                    Some(EngineCommand::UpdateEffectParameters {
                        effect_id: effect_id.clone(),
                        parameters,
                    })
                }
                MappingTarget::Master => {
                    if change.parameter == "gain" {
                        master_gain.set(change.value.clamp(0.0, 1.0));
                    }
                    None
                }
                MappingTarget::Instrument(instrument_id) => {
                    Some(EngineCommand::UpdateInstrumentParameter {
                        instrument_id: instrument_id.clone(),
                        parameter: change.parameter.clone(),
                        value: change.value,
                    })
                }
                MappingTarget::Transport => {
                    emit(
                        &listeners,
                        &AudioEngineEvent::TransportControl {
                            parameter: change.parameter.clone(),
                            value: change.value,
                        },
                    );
                    None
                }
            };
            if let Some(command) = command {
                if let Ok(mut producer) = commands.lock() {
                    producer.push(command).ok();
                }
            }
        }));
    }

    fn guard(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.shut_down {
            Err(EngineError::NotInitialized(operation))
        } else {
            Ok(())
        }
    }

    fn send(&self, command: EngineCommand) {
        if let Ok(mut producer) = self.commands.lock() {
            producer.push(command).ok();
        }
    }

    // Channels

    pub fn create_channel(&mut self, channel: AudioChannel) -> Result<(), EngineError> {
        self.guard("create_channel")?;
        if channel
            .effects
            .effects
            .iter()
            .any(|e| e.kind == EffectKind::Chorus)
        {
            return Err(EngineError::UnsupportedFormat(
                "effect type Chorus".to_string(),
            ));
        }
        let meter = SharedMeter::new();
        if let Ok(mut meters) = self.channel_meters.write() {
            meters.insert(channel.id.clone(), meter.clone());
        }
        self.channels.insert(channel.id.clone(), channel.clone());
        self.send(EngineCommand::CreateChannel { channel, meter });
        Ok(())
    }

    pub fn update_channel(
        &mut self,
        channel_id: &str,
        updates: ChannelUpdate,
    ) -> Result<(), EngineError> {
        self.guard("update_channel")?;
        if let Some(state) = self.channels.get_mut(channel_id) {
            if let Some(gain) = updates.gain {
                state.gain = gain;
            }
            if let Some(pan) = updates.pan {
                state.pan = pan;
            }
            if let Some(muted) = updates.muted {
                state.muted = muted;
            }
            if let Some(solo) = updates.solo {
                state.solo = solo;
            }
            if let Some(eq) = updates.eq {
                state.eq = eq;
            }
            if let Some(mix) = updates.wet_dry_mix {
                state.effects.wet_dry_mix = mix;
            }
        }
        self.send(EngineCommand::UpdateChannel {
            channel_id: channel_id.to_string(),
            updates,
        });
        Ok(())
    }

    pub fn remove_channel(&mut self, channel_id: &str) -> Result<(), EngineError> {
        self.guard("remove_channel")?;
        self.channels.remove(channel_id);
        if let Ok(mut meters) = self.channel_meters.write() {
            meters.remove(channel_id);
        }
        self.send(EngineCommand::RemoveChannel {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn channel_level(&self, channel_id: &str) -> AudioLevel {
        self.channel_meters
            .read()
            .ok()
            .and_then(|meters| meters.get(channel_id).map(|m| m.load()))
            .unwrap_or_else(AudioLevel::silent)
    }

    pub fn master_level(&self) -> AudioLevel {
        self.master_meter.load()
    }

    // Sources

    /// Open the device through the provider and hand the stream consumer
    /// to the channel. Device failures surface here, synchronously.
    pub fn connect_microphone_input(
        &mut self,
        channel_id: &str,
        device_id: &str,
        provider: &mut dyn DeviceProvider,
    ) -> Result<(), EngineError> {
        self.guard("connect_microphone_input")?;
        let opened = provider.open_input(device_id)?;
        self.send(EngineCommand::ConnectInputStream {
            channel_id: channel_id.to_string(),
            device_id: device_id.to_string(),
            consumer: opened.consumer,
        });
        emit(
            &self.listeners,
            &AudioEngineEvent::DeviceConnected {
                device: opened.device,
            },
        );
        Ok(())
    }

    pub fn play_buffer(
        &mut self,
        channel_id: &str,
        data: Arc<Vec<f32>>,
        looping: bool,
    ) -> Result<(), EngineError> {
        self.guard("play_buffer")?;
        self.send(EngineCommand::PlayBuffer {
            channel_id: channel_id.to_string(),
            data,
            looping,
        });
        Ok(())
    }

    pub fn stop_channel(&mut self, channel_id: &str) -> Result<(), EngineError> {
        self.guard("stop_channel")?;
        self.send(EngineCommand::StopChannel {
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    // Effects

    pub fn add_effect(&mut self, channel_id: &str, effect: Effect) -> Result<(), EngineError> {
        self.guard("add_effect")?;
        if effect.kind == EffectKind::Chorus {
            return Err(EngineError::UnsupportedFormat(
                "effect type Chorus".to_string(),
            ));
        }
        if let Some(state) = self.channels.get_mut(channel_id) {
            state.effects.effects.push(effect.clone());
        }
        self.send(EngineCommand::AddEffect {
            channel_id: channel_id.to_string(),
            effect,
        });
        Ok(())
    }

    pub fn remove_effect(&mut self, channel_id: &str, effect_id: &str) -> Result<(), EngineError> {
        self.guard("remove_effect")?;
        if let Some(state) = self.channels.get_mut(channel_id) {
            state.effects.effects.retain(|e| e.id != effect_id);
        }
        self.send(EngineCommand::RemoveEffect {
            channel_id: channel_id.to_string(),
            effect_id: effect_id.to_string(),
        });
        Ok(())
    }

    pub fn update_effect_parameters(
        &mut self,
        effect_id: &str,
        parameters: BTreeMap<String, f32>,
    ) -> Result<(), EngineError> {
        self.guard("update_effect_parameters")?;
        self.send(EngineCommand::UpdateEffectParameters {
            effect_id: effect_id.to_string(),
            parameters,
        });
        Ok(())
    }

    // Parametric EQ

    pub fn add_eq_band(&mut self, channel_id: &str, band: EqBand) -> Result<(), EngineError> {
        self.guard("add_eq_band")?;
        self.send(EngineCommand::AddEqBand {
            channel_id: channel_id.to_string(),
            band,
        });
        Ok(())
    }

    pub fn update_eq_band(
        &mut self,
        channel_id: &str,
        band_id: &str,
        updates: BandUpdate,
    ) -> Result<(), EngineError> {
        self.guard("update_eq_band")?;
        self.send(EngineCommand::UpdateEqBand {
            channel_id: channel_id.to_string(),
            band_id: band_id.to_string(),
            updates,
        });
        Ok(())
    }

    pub fn remove_eq_band(&mut self, channel_id: &str, band_id: &str) -> Result<(), EngineError> {
        self.guard("remove_eq_band")?;
        self.send(EngineCommand::RemoveEqBand {
            channel_id: channel_id.to_string(),
            band_id: band_id.to_string(),
        });
        Ok(())
    }

    pub fn set_eq_bypassed(
        &mut self,
        channel_id: &str,
        bypassed: bool,
    ) -> Result<(), EngineError> {
        self.guard("set_eq_bypassed")?;
        self.send(EngineCommand::SetEqBypassed {
            channel_id: channel_id.to_string(),
            bypassed,
        });
        Ok(())
    }

    // Master

    pub fn set_master_gain(&mut self, gain: f32) -> Result<(), EngineError> {
        self.guard("set_master_gain")?;
        let gain = gain.clamp(0.0, 1.0);
        self.master.main_gain = gain;
        self.master_gain.set(gain);
        Ok(())
    }

    pub fn set_master_muted(&mut self, muted: bool) -> Result<(), EngineError> {
        self.guard("set_master_muted")?;
        self.master.muted = muted;
        self.master_mute.set(if muted { 0.0 } else { 1.0 });
        Ok(())
    }

    pub fn set_master_limiter(&mut self, limiter: LimiterSettings) -> Result<(), EngineError> {
        self.guard("set_master_limiter")?;
        self.master.limiter = limiter;
        self.send(EngineCommand::SetMasterLimiter(limiter));
        Ok(())
    }

    pub fn master_section(&self) -> &MasterSection {
        &self.master
    }

    // Instruments

    pub fn create_instrument(
        &mut self,
        kind: InstrumentKind,
        name: impl Into<String>,
    ) -> Result<String, EngineError> {
        self.guard("create_instrument")?;
        if kind != InstrumentKind::Synthesizer {
            return Err(EngineError::UnsupportedFormat(format!(
                "instrument type {}",
                kind
            )));
        }
        self.next_instrument_id += 1;
        let instrument_id = format!("instrument_{}", self.next_instrument_id);
        self.send(EngineCommand::CreateInstrument {
            instrument_id: instrument_id.clone(),
            name: name.into(),
        });
        Ok(instrument_id)
    }

    pub fn remove_instrument(&mut self, instrument_id: &str) -> Result<(), EngineError> {
        self.guard("remove_instrument")?;
        self.send(EngineCommand::RemoveInstrument {
            instrument_id: instrument_id.to_string(),
        });
        Ok(())
    }

    pub fn send_instrument_midi(
        &mut self,
        instrument_id: &str,
        message: MidiMessage,
    ) -> Result<(), EngineError> {
        self.guard("send_instrument_midi")?;
        self.send(EngineCommand::InstrumentMidi {
            instrument_id: instrument_id.to_string(),
            message,
        });
        Ok(())
    }

    pub fn load_instrument_preset(
        &mut self,
        instrument_id: &str,
        preset_id: &str,
    ) -> Result<(), EngineError> {
        self.guard("load_instrument_preset")?;
        self.send(EngineCommand::LoadInstrumentPreset {
            instrument_id: instrument_id.to_string(),
            preset_id: preset_id.to_string(),
        });
        Ok(())
    }

    // Recording

    pub fn create_recording_session(
        &mut self,
        name: impl Into<String>,
        config: RecordingConfig,
    ) -> Result<String, EngineError> {
        self.guard("create_recording_session")?;
        self.next_session_id += 1;
        let session_id = format!("session_{}", self.next_session_id);
        self.send(EngineCommand::CreateRecordingSession {
            session_id: session_id.clone(),
            name: name.into(),
            config,
        });
        Ok(session_id)
    }

    pub fn start_recording(
        &mut self,
        session_id: &str,
        channel_ids: Vec<String>,
    ) -> Result<(), EngineError> {
        self.guard("start_recording")?;
        self.send(EngineCommand::StartRecording {
            session_id: session_id.to_string(),
            channel_ids,
        });
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<(), EngineError> {
        self.guard("stop_recording")?;
        self.send(EngineCommand::StopRecording);
        Ok(())
    }

    pub fn pause_recording(&mut self) -> Result<(), EngineError> {
        self.guard("pause_recording")?;
        self.send(EngineCommand::PauseRecording);
        Ok(())
    }

    pub fn resume_recording(&mut self) -> Result<(), EngineError> {
        self.guard("resume_recording")?;
        self.send(EngineCommand::ResumeRecording);
        Ok(())
    }

    /// Drain audio-side events: finished sessions land in the local store
    /// and every event fans out to the listeners.
    pub fn poll_events(&mut self) {
        while let Some(event) = self.events.pop() {
            match event {
                EngineEvent::RecordingFinished(session) => {
                    let session_id = session.id.clone();
                    self.finished_sessions.insert(session_id.clone(), *session);
                    emit(
                        &self.listeners,
                        &AudioEngineEvent::RecordingFinished { session_id },
                    );
                }
                EngineEvent::Error(message) => {
                    emit(&self.listeners, &AudioEngineEvent::Error { message });
                }
            }
        }
    }

    pub fn finished_session(&self, session_id: &str) -> Option<&RecordingSession> {
        self.finished_sessions.get(session_id)
    }

    pub fn export_session(
        &self,
        session_id: &str,
        options: &ExportOptions,
    ) -> Result<Vec<u8>, anyhow::Error> {
        let session = self
            .finished_sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        recording::export_session(session, options)
    }

    pub fn export_track(
        &self,
        session_id: &str,
        track_id: &str,
        options: &ExportOptions,
    ) -> Result<Vec<u8>, anyhow::Error> {
        let session = self
            .finished_sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        recording::export_track(session, track_id, options)
    }

    // MIDI

    pub fn midi(&mut self) -> &mut MidiEngine {
        &mut self.midi
    }

    /// Entry point for messages arriving from a device connection.
    /// Learned mappings dispatch through the routing sink installed at
    /// construction; note traffic additionally reaches the armed
    /// instrument, independent of the mapping path.
    pub fn handle_midi_message(&mut self, device_id: &str, message: &MidiMessage) {
        self.midi.process_message(device_id, message);

        if let Some(instrument_id) = self.midi_note_target.clone() {
            match message {
                MidiMessage::NoteOn { .. }
                | MidiMessage::NoteOff { .. }
                | MidiMessage::ControlChange { .. } => {
                    self.send(EngineCommand::InstrumentMidi {
                        instrument_id,
                        message: message.clone(),
                    });
                }
                _ => {}
            }
        }
    }

    /// Route incoming note input to one instrument (or none).
    pub fn set_midi_note_target(&mut self, instrument_id: Option<String>) {
        self.midi_note_target = instrument_id;
    }

    pub fn start_midi_learn(
        &mut self,
        target: MappingTarget,
        parameter: impl Into<String>,
    ) -> Result<String, EngineError> {
        self.guard("start_midi_learn")?;
        Ok(self.midi.start_learn(target, parameter))
    }

    pub fn stop_midi_learn(&mut self) {
        self.midi.stop_learn();
    }

    // Listeners

    pub fn add_event_listener(&mut self, listener: EventListener) -> u64 {
        self.next_listener_id += 1;
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(self.next_listener_id, listener);
        }
        self.next_listener_id
    }

    pub fn remove_event_listener(&mut self, listener_id: u64) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.remove(&listener_id);
        }
    }

    // Project snapshot

    /// Capture the current mixer layout for persistence.
    pub fn snapshot_project(&self, name: &str) -> ProjectSettings {
        ProjectSettings {
            name: name.to_string(),
            sample_rate: self.sample_rate as u32,
            buffer_size: 512,
            channels: self.channels.values().cloned().collect(),
            master: self.master.clone(),
            created_at: chrono::Utc::now(),
            modified_at: chrono::Utc::now(),
        }
    }

    /// Recreate the mixer from a saved project: existing channels go away,
    /// saved channels and master state come back.
    pub fn apply_project(&mut self, project: &ProjectSettings) -> Result<(), EngineError> {
        self.guard("apply_project")?;
        for channel_id in self.channel_ids() {
            self.remove_channel(&channel_id)?;
        }
        for channel in &project.channels {
            self.create_channel(channel.clone())?;
        }
        self.set_master_gain(project.master.main_gain)?;
        self.set_master_muted(project.master.muted)?;
        self.set_master_limiter(project.master.limiter)?;
        Ok(())
    }

    /// Ordered teardown: monitor loop first, then the audio side, then
    /// MIDI and the listener registry. Safe to call twice.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.send(EngineCommand::Shutdown);
        self.midi.shutdown();
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.clear();
        }
        if let Ok(mut meters) = self.channel_meters.write() {
            meters.clear();
        }
        self.shut_down = true;
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::ResponseCurve;
    use std::sync::Mutex as StdMutex;

    const SR: f32 = 44100.0;
    const BLOCK: usize = 512;

    fn pump(engine: &mut AudioEngine, blocks: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for _ in 0..blocks {
            engine.handle_commands();
            engine.process_block(&mut left, &mut right);
        }
        (left, right)
    }

    fn sine_buffer(seconds: f32) -> Arc<Vec<f32>> {
        Arc::new(
            (0..(seconds * SR) as usize)
                .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / SR).sin())
                .collect(),
        )
    }

    fn engine_pair() -> (AudioEngine, EngineController) {
        AudioEngine::create(SR, MasterSection::default())
    }

    #[test]
    fn channel_lifecycle_round_trips_through_commands() {
        let (mut engine, mut controller) = engine_pair();
        let channel = AudioChannel::new("chan-1", "Channel 1");
        controller.create_channel(channel).unwrap();
        pump(&mut engine, 1);
        assert!(engine.channel("chan-1").is_some());

        controller.remove_channel("chan-1").unwrap();
        pump(&mut engine, 1);
        assert!(engine.channel("chan-1").is_none());
    }

    #[test]
    fn gain_change_is_reflected_in_channel_levels() {
        let (mut engine, mut controller) = engine_pair();
        let mut channel = AudioChannel::new("chan-1", "Channel 1");
        channel.gain = 0.75;
        channel.eq.enabled = false;
        controller.create_channel(channel).unwrap();
        controller
            .play_buffer("chan-1", sine_buffer(2.0), true)
            .unwrap();
        pump(&mut engine, 40);
        let level = engine.channel("chan-1").unwrap().level();
        assert!((level.peak - 0.75).abs() < 0.03);

        controller
            .update_channel(
                "chan-1",
                ChannelUpdate {
                    gain: Some(0.3),
                    ..Default::default()
                },
            )
            .unwrap();
        pump(&mut engine, 80);
        let level = engine.channel("chan-1").unwrap().level();
        assert!((level.peak - 0.3).abs() < 0.03, "peak: {}", level.peak);
        // The shared meter the monitor reads agrees.
        let meter_level = controller.channel_level("chan-1");
        assert!((meter_level.peak - level.peak).abs() < 1e-3);
    }

    #[test]
    fn solo_silences_the_other_channels() {
        let (mut engine, mut controller) = engine_pair();
        for id in ["chan-1", "chan-2"] {
            let mut channel = AudioChannel::new(id, id);
            channel.eq.enabled = false;
            channel.gain = 1.0;
            controller.create_channel(channel).unwrap();
            controller.play_buffer(id, sine_buffer(2.0), true).unwrap();
        }
        controller
            .update_channel(
                "chan-2",
                ChannelUpdate {
                    solo: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        pump(&mut engine, 100);
        let muted = engine.channel("chan-1").unwrap().level();
        let soloed = engine.channel("chan-2").unwrap().level();
        assert!(muted.peak < 0.02, "non-solo channel silent: {}", muted.peak);
        assert!(soloed.peak > 0.5, "solo channel plays: {}", soloed.peak);
    }

    #[test]
    fn recording_two_channels_produces_two_tracks() {
        let (mut engine, mut controller) = engine_pair();
        for id in ["chan-1", "chan-2"] {
            let mut channel = AudioChannel::new(id, id);
            channel.eq.enabled = false;
            controller.create_channel(channel).unwrap();
            controller.play_buffer(id, sine_buffer(2.0), true).unwrap();
        }

        let session_id = controller
            .create_recording_session("take 1", RecordingConfig::default())
            .unwrap();
        controller
            .start_recording(
                &session_id,
                vec!["chan-1".to_string(), "chan-2".to_string()],
            )
            .unwrap();
        pump(&mut engine, 10);
        controller.stop_recording().unwrap();
        pump(&mut engine, 1);
        controller.poll_events();

        let session = controller.finished_session(&session_id).expect("session");
        assert_eq!(session.tracks.len(), 2);
        for track in &session.tracks {
            assert_eq!(track.total_samples(), 10 * BLOCK);
        }
        assert!(session.duration >= 0.0);

        // And the session exports as a valid WAV.
        let bytes = controller
            .export_session(&session_id, &ExportOptions::default())
            .unwrap();
        let info = crate::recording::decode_wav_info(&bytes).unwrap();
        assert_eq!(info.sample_rate, 44100);
    }

    #[test]
    fn midi_learn_then_cc_steers_the_channel_gain() {
        let (mut engine, mut controller) = engine_pair();
        let mut channel = AudioChannel::new("chan-1", "Channel 1");
        channel.eq.enabled = false;
        controller.create_channel(channel).unwrap();

        controller
            .start_midi_learn(MappingTarget::Channel("chan-1".to_string()), "gain")
            .unwrap();
        controller.handle_midi_message(
            "dev",
            &MidiMessage::ControlChange {
                channel: 1,
                controller: 20,
                value: 64,
            },
        );
        // Mapping created with the observed controller and channel.
        let mappings = controller.midi().mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].controller, 20);
        assert_eq!(mappings[0].channel, 1);
        assert_eq!(mappings[0].curve, ResponseCurve::Linear);
        assert!(controller.midi().learn_session().is_none());

        // The next matching CC drives the gain through the routing sink.
        controller.handle_midi_message(
            "dev",
            &MidiMessage::ControlChange {
                channel: 1,
                controller: 20,
                value: 127,
            },
        );
        pump(&mut engine, 1);
        let state = engine.channel("chan-1").unwrap().state();
        assert!((state.gain - 1.0).abs() < 1e-3);
    }

    #[test]
    fn master_gain_scales_the_mix() {
        let (mut engine, mut controller) = engine_pair();
        let mut channel = AudioChannel::new("chan-1", "Channel 1");
        channel.eq.enabled = false;
        channel.gain = 1.0;
        // Defeat the limiter so the raw master gain is visible.
        controller
            .set_master_limiter(LimiterSettings {
                enabled: false,
                ..LimiterSettings::default()
            })
            .unwrap();
        controller.create_channel(channel).unwrap();
        controller
            .play_buffer("chan-1", sine_buffer(2.0), true)
            .unwrap();
        controller.set_master_gain(1.0).unwrap();
        pump(&mut engine, 40);
        let loud = engine.master_level();

        controller.set_master_gain(0.25).unwrap();
        pump(&mut engine, 80);
        let quiet = engine.master_level();
        assert!(
            quiet.peak < loud.peak * 0.5,
            "master gain reduces output: {} vs {}",
            quiet.peak,
            loud.peak
        );
    }

    #[test]
    fn limiter_caps_the_master_bus() {
        let (mut engine, mut controller) = engine_pair();
        let mut channel = AudioChannel::new("chan-1", "Channel 1");
        channel.eq.enabled = false;
        channel.gain = 1.0;
        controller.create_channel(channel).unwrap();
        controller
            .play_buffer("chan-1", sine_buffer(2.0), true)
            .unwrap();
        controller.set_master_gain(1.0).unwrap();
        controller
            .set_master_limiter(LimiterSettings {
                enabled: true,
                threshold: -6.0,
                ratio: 4.0,
            })
            .unwrap();
        pump(&mut engine, 100);
        let level = engine.master_level();
        let ceiling = db_to_linear(-6.0);
        assert!(
            level.peak <= ceiling * 1.1,
            "limited peak {} vs ceiling {}",
            level.peak,
            ceiling
        );
    }

    #[test]
    fn instrument_notes_reach_the_master_bus() {
        let (mut engine, mut controller) = engine_pair();
        let instrument_id = controller
            .create_instrument(InstrumentKind::Synthesizer, "Lead")
            .unwrap();
        controller
            .send_instrument_midi(
                &instrument_id,
                MidiMessage::NoteOn {
                    channel: 1,
                    note: 69,
                    velocity: 127,
                },
            )
            .unwrap();
        pump(&mut engine, 20);
        assert!(engine.master_level().peak > 0.0);

        assert!(matches!(
            controller.create_instrument(InstrumentKind::Sampler, "Nope"),
            Err(EngineError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn microphone_input_flows_through_the_channel() {
        let (mut engine, mut controller) = engine_pair();
        let mut channel = AudioChannel::new("chan-1", "Mic");
        channel.eq.enabled = false;
        channel.gain = 1.0;
        controller.create_channel(channel).unwrap();

        let mut provider = crate::device::MockDeviceProvider::with_input("mic-1");
        controller
            .connect_microphone_input("chan-1", "mic-1", &mut provider)
            .unwrap();
        // Unknown devices are a reported error, not a silent fallback.
        assert!(matches!(
            controller.connect_microphone_input("chan-1", "nope", &mut provider),
            Err(EngineError::Device(_))
        ));

        let (_, producer) = provider.producers.last_mut().unwrap();
        for _ in 0..(BLOCK * 8) {
            producer.push(0.5).unwrap();
        }
        pump(&mut engine, 4);
        let level = engine.channel("chan-1").unwrap().level();
        assert!(level.peak > 0.4, "live input metered: {}", level.peak);
    }

    #[test]
    fn note_target_routes_midi_into_an_instrument() {
        let (mut engine, mut controller) = engine_pair();
        let instrument_id = controller
            .create_instrument(InstrumentKind::Synthesizer, "Keys")
            .unwrap();
        controller.set_midi_note_target(Some(instrument_id.clone()));
        controller.handle_midi_message(
            "dev",
            &MidiMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 110,
            },
        );
        pump(&mut engine, 1);
        assert_eq!(
            engine
                .instruments()
                .instrument(&instrument_id)
                .unwrap()
                .active_voice_count(),
            1
        );
    }

    #[test]
    fn listeners_receive_level_updates_and_are_removable() {
        let (mut engine, mut controller) = engine_pair();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let id = controller.add_event_listener(Box::new(move |event| {
            if let AudioEngineEvent::LevelUpdate { channel_id, .. } = event {
                sink.lock().unwrap().push(channel_id.clone());
            }
        }));

        pump(&mut engine, 5);
        // The monitor thread ticks every ~16 ms.
        std::thread::sleep(Duration::from_millis(100));
        assert!(seen.lock().unwrap().iter().any(|id| id == "master"));

        controller.remove_event_listener(id);
        let before = seen.lock().unwrap().len();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(seen.lock().unwrap().len(), before);
    }

    #[test]
    fn shutdown_stops_the_monitor_and_blocks_further_use() {
        let (mut engine, mut controller) = engine_pair();
        controller
            .create_channel(AudioChannel::new("chan-1", "Channel 1"))
            .unwrap();
        pump(&mut engine, 2);

        controller.shutdown();
        pump(&mut engine, 2);
        assert!(engine.channel("chan-1").is_none(), "channels released");

        let err = controller
            .create_channel(AudioChannel::new("chan-2", "Channel 2"))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized(_)));
        // Idempotent.
        controller.shutdown();
    }

    #[test]
    fn project_snapshot_and_apply_round_trip() {
        let (mut engine, mut controller) = engine_pair();
        let mut channel = AudioChannel::new("chan-1", "Vox");
        channel.gain = 0.6;
        controller.create_channel(channel).unwrap();
        controller.set_master_gain(0.9).unwrap();

        let project = controller.snapshot_project("My Mix");
        assert_eq!(project.channels.len(), 1);
        assert_eq!(project.master.main_gain, 0.9);

        controller.apply_project(&project).unwrap();
        pump(&mut engine, 1);
        let state = engine.channel("chan-1").unwrap().state();
        assert_eq!(state.gain, 0.6);
        assert_eq!(state.name, "Vox");
    }
}
