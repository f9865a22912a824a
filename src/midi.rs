// src/midi.rs

//! MIDI: wire-format parsing, controller-to-parameter mapping with curve
//! shaping, the MIDI-learn state machine, and midir device plumbing.

use anyhow::Result;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiInputPort, MidiOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

const APP_NAME: &str = "Mixdeck";

/// How long a learn session stays armed before giving up.
pub const LEARN_TIMEOUT: Duration = Duration::from_secs(30);

// --- Message model ---

/// A parsed MIDI message. Channels are 1-16 as musicians count them.
#[derive(Debug, Clone, PartialEq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    PitchBend { channel: u8, value: u16 },
    Aftertouch { channel: u8, pressure: u8 },
    Sysex { data: Vec<u8> },
}

impl MidiMessage {
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::PitchBend { channel, .. }
            | MidiMessage::Aftertouch { channel, .. } => Some(*channel),
            MidiMessage::Sysex { .. } => None,
        }
    }
}

/// Parse a raw wire message. Note-on with velocity zero is a note-off.
pub fn parse_midi_message(data: &[u8]) -> Option<MidiMessage> {
    let status = *data.first()?;
    if status == 0xF0 {
        return Some(MidiMessage::Sysex {
            data: data.to_vec(),
        });
    }

    let channel = (status & 0x0F) + 1;
    match status & 0xF0 {
        0x80 => Some(MidiMessage::NoteOff {
            channel,
            note: *data.get(1)?,
            velocity: *data.get(2)?,
        }),
        0x90 => {
            let note = *data.get(1)?;
            let velocity = *data.get(2)?;
            if velocity > 0 {
                Some(MidiMessage::NoteOn {
                    channel,
                    note,
                    velocity,
                })
            } else {
                Some(MidiMessage::NoteOff {
                    channel,
                    note,
                    velocity,
                })
            }
        }
        0xB0 => Some(MidiMessage::ControlChange {
            channel,
            controller: *data.get(1)?,
            value: *data.get(2)?,
        }),
        0xC0 => Some(MidiMessage::ProgramChange {
            channel,
            program: *data.get(1)?,
        }),
        0xD0 => Some(MidiMessage::Aftertouch {
            channel,
            pressure: *data.get(1)?,
        }),
        0xE0 => {
            let lsb = *data.get(1)? as u16;
            let msb = *data.get(2)? as u16;
            Some(MidiMessage::PitchBend {
                channel,
                value: (msb << 7) | lsb,
            })
        }
        _ => None,
    }
}

/// Encode a message back to wire bytes (for outbound devices).
pub fn encode_midi_message(message: &MidiMessage) -> Option<Vec<u8>> {
    let channel_bits = |channel: u8| (channel.clamp(1, 16) - 1) & 0x0F;
    match message {
        MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        } => Some(vec![0x90 | channel_bits(*channel), *note, *velocity]),
        MidiMessage::NoteOff {
            channel,
            note,
            velocity,
        } => Some(vec![0x80 | channel_bits(*channel), *note, *velocity]),
        MidiMessage::ControlChange {
            channel,
            controller,
            value,
        } => Some(vec![0xB0 | channel_bits(*channel), *controller, *value]),
        MidiMessage::ProgramChange { channel, program } => {
            Some(vec![0xC0 | channel_bits(*channel), *program])
        }
        MidiMessage::PitchBend { channel, value } => Some(vec![
            0xE0 | channel_bits(*channel),
            (value & 0x7F) as u8,
            ((value >> 7) & 0x7F) as u8,
        ]),
        MidiMessage::Aftertouch { channel, pressure } => {
            Some(vec![0xD0 | channel_bits(*channel), *pressure])
        }
        MidiMessage::Sysex { data } => Some(data.clone()),
    }
}

// --- Mappings ---

/// What a mapping steers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum MappingTarget {
    Channel(String),
    Effect(String),
    Master,
    Transport,
    Instrument(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCurve {
    #[default]
    Linear,
    Exponential,
    Logarithmic,
}

impl ResponseCurve {
    /// Shape a normalized 0..1 input.
    pub fn apply(&self, input: f32) -> f32 {
        match self {
            ResponseCurve::Linear => input,
            ResponseCurve::Exponential => input * input,
            ResponseCurve::Logarithmic => input.sqrt(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MidiMapping {
    pub id: String,
    pub name: String,
    pub device_id: String,
    pub controller: u8,
    pub channel: u8,
    pub target: MappingTarget,
    pub parameter: String,
    pub min_value: f32,
    pub max_value: f32,
    pub curve: ResponseCurve,
    pub enabled: bool,
}

impl MidiMapping {
    /// Map a raw 0-127 controller value through the curve into [min, max].
    pub fn map_value(&self, raw: u8) -> f32 {
        let normalized = raw as f32 / 127.0;
        let shaped = self.curve.apply(normalized);
        self.min_value + (self.max_value - self.min_value) * shaped
    }
}

/// A mapped controller move, ready for the engine to route.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChange {
    pub mapping_id: String,
    pub target: MappingTarget,
    pub parameter: String,
    pub value: f32,
}

// --- Persistence ---

/// Storage backend for mappings, injected so the engine never knows where
/// they live.
pub trait MappingStore: Send {
    fn load(&self) -> Result<Vec<MidiMapping>>;
    fn save(&self, mappings: &[MidiMapping]) -> Result<()>;
}

/// Mappings as a JSON file on disk.
pub struct JsonMappingStore {
    path: PathBuf,
}

impl JsonMappingStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MappingStore for JsonMappingStore {
    fn load(&self) -> Result<Vec<MidiMapping>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, mappings: &[MidiMapping]) -> Result<()> {
        let json = serde_json::to_string_pretty(mappings)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryMappingStore {
    mappings: std::sync::Mutex<Vec<MidiMapping>>,
}

impl MappingStore for MemoryMappingStore {
    fn load(&self) -> Result<Vec<MidiMapping>> {
        Ok(self.mappings.lock().unwrap().clone())
    }

    fn save(&self, mappings: &[MidiMapping]) -> Result<()> {
        *self.mappings.lock().unwrap() = mappings.to_vec();
        Ok(())
    }
}

// --- Learn session ---

#[derive(Debug, Clone)]
pub struct LearnSession {
    pub id: String,
    pub target: MappingTarget,
    pub parameter: String,
    started_at: Instant,
}

impl LearnSession {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) >= LEARN_TIMEOUT
    }
}

// --- Engine ---

type MessageListener = Box<dyn Fn(&MidiMessage) + Send>;
type ParameterSink = Box<dyn Fn(&ParameterChange) + Send>;
type DeviceListener = Box<dyn Fn(&[MidiDeviceInfo]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiPortKind {
    Input,
    Output,
}

#[derive(Debug, Clone)]
pub struct MidiDeviceInfo {
    pub id: String,
    pub name: String,
    pub kind: MidiPortKind,
}

pub struct MidiEngine {
    mappings: BTreeMap<String, MidiMapping>,
    learn: Option<LearnSession>,
    store: Box<dyn MappingStore>,
    message_listeners: BTreeMap<u64, MessageListener>,
    parameter_sinks: BTreeMap<u64, ParameterSink>,
    device_listeners: BTreeMap<u64, DeviceListener>,
    next_listener_id: u64,
    next_entity_id: u64,
}

impl MidiEngine {
    pub fn new(store: Box<dyn MappingStore>) -> Self {
        let mut engine = Self {
            mappings: BTreeMap::new(),
            learn: None,
            store,
            message_listeners: BTreeMap::new(),
            parameter_sinks: BTreeMap::new(),
            device_listeners: BTreeMap::new(),
            next_listener_id: 0,
            next_entity_id: 0,
        };
        match engine.store.load() {
            Ok(loaded) => {
                for mapping in loaded {
                    engine.mappings.insert(mapping.id.clone(), mapping);
                }
            }
            Err(e) => eprintln!("Failed to load MIDI mappings: {}", e),
        }
        engine
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_entity_id += 1;
        format!("{}_{}", prefix, self.next_entity_id)
    }

    /// Swap the persistence backend and merge whatever it already holds.
    pub fn set_store(&mut self, store: Box<dyn MappingStore>) {
        self.store = store;
        match self.store.load() {
            Ok(loaded) => {
                for mapping in loaded {
                    self.mappings.insert(mapping.id.clone(), mapping);
                }
            }
            Err(e) => eprintln!("Failed to load MIDI mappings: {}", e),
        }
    }

    // Mapping management

    pub fn add_mapping(&mut self, mapping: MidiMapping) {
        self.mappings.insert(mapping.id.clone(), mapping);
        self.persist();
    }

    pub fn remove_mapping(&mut self, mapping_id: &str) {
        self.mappings.remove(mapping_id);
        self.persist();
    }

    pub fn update_mapping(&mut self, mapping_id: &str, update: impl FnOnce(&mut MidiMapping)) {
        if let Some(mapping) = self.mappings.get_mut(mapping_id) {
            update(mapping);
            self.persist();
        }
    }

    pub fn mappings(&self) -> Vec<MidiMapping> {
        self.mappings.values().cloned().collect()
    }

    pub fn mappings_for_target(&self, target: &MappingTarget) -> Vec<MidiMapping> {
        self.mappings
            .values()
            .filter(|m| &m.target == target)
            .cloned()
            .collect()
    }

    fn persist(&self) {
        let mappings: Vec<MidiMapping> = self.mappings.values().cloned().collect();
        if let Err(e) = self.store.save(&mappings) {
            eprintln!("Failed to save MIDI mappings: {}", e);
        }
    }

    // Learn state machine

    /// Arm a learn session. A session already in flight is stopped first,
    /// so calling this twice is safe and the last target wins.
    pub fn start_learn(&mut self, target: MappingTarget, parameter: impl Into<String>) -> String {
        if self.learn.is_some() {
            self.stop_learn();
        }
        let id = self.next_id("learn");
        let parameter = parameter.into();
        println!("MIDI learn started for {:?}:{}", target, parameter);
        self.learn = Some(LearnSession {
            id: id.clone(),
            target,
            parameter,
            started_at: Instant::now(),
        });
        id
    }

    pub fn stop_learn(&mut self) {
        if self.learn.take().is_some() {
            println!("MIDI learn stopped");
        }
    }

    pub fn learn_session(&self) -> Option<&LearnSession> {
        self.learn.as_ref()
    }

    /// Expire a stale learn session. Called from the monitor tick and at
    /// the top of message handling.
    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    fn poll_at(&mut self, now: Instant) {
        if self.learn.as_ref().map_or(false, |s| s.expired(now)) {
            self.stop_learn();
        }
    }

    #[cfg(test)]
    fn backdate_learn(&mut self, by: Duration) {
        if let Some(session) = self.learn.as_mut() {
            session.started_at -= by;
        }
    }

    // Message handling

    /// Feed one parsed message through learn, mapping dispatch, and the
    /// message listeners. Returns the id of a mapping created by learn.
    pub fn process_message(&mut self, device_id: &str, message: &MidiMessage) -> Option<String> {
        self.poll();

        if self.learn.is_some() {
            if let MidiMessage::ControlChange {
                channel,
                controller,
                ..
            } = message
            {
                let session = self.learn.take().expect("learn session checked above");
                let id = self.next_id("mapping");
                let mapping = MidiMapping {
                    id: id.clone(),
                    name: format!("CC{} Ch{}", controller, channel),
                    device_id: device_id.to_string(),
                    controller: *controller,
                    channel: *channel,
                    target: session.target,
                    parameter: session.parameter,
                    min_value: 0.0,
                    max_value: 1.0,
                    curve: ResponseCurve::Linear,
                    enabled: true,
                };
                println!(
                    "MIDI learn: mapped CC{} on channel {} to {:?}:{}",
                    controller, channel, mapping.target, mapping.parameter
                );
                self.add_mapping(mapping);
                return Some(id);
            }
            // Learn only binds control changes; other messages fall through.
        }

        self.process_mappings(message);

        for listener in self.message_listeners.values() {
            listener(message);
        }
        None
    }

    fn process_mappings(&self, message: &MidiMessage) {
        let MidiMessage::ControlChange {
            channel,
            controller,
            value,
        } = message
        else {
            return;
        };

        for mapping in self.mappings.values() {
            if !mapping.enabled || mapping.channel != *channel || mapping.controller != *controller
            {
                continue;
            }
            let change = ParameterChange {
                mapping_id: mapping.id.clone(),
                target: mapping.target.clone(),
                parameter: mapping.parameter.clone(),
                value: mapping.map_value(*value),
            };
            for sink in self.parameter_sinks.values() {
                sink(&change);
            }
        }
    }

    // Listeners (id-keyed for O(1) removal)

    pub fn add_message_listener(&mut self, listener: MessageListener) -> u64 {
        self.next_listener_id += 1;
        self.message_listeners.insert(self.next_listener_id, listener);
        self.next_listener_id
    }

    pub fn remove_message_listener(&mut self, id: u64) {
        self.message_listeners.remove(&id);
    }

    pub fn add_parameter_sink(&mut self, sink: ParameterSink) -> u64 {
        self.next_listener_id += 1;
        self.parameter_sinks.insert(self.next_listener_id, sink);
        self.next_listener_id
    }

    pub fn remove_parameter_sink(&mut self, id: u64) {
        self.parameter_sinks.remove(&id);
    }

    pub fn add_device_listener(&mut self, listener: DeviceListener) -> u64 {
        self.next_listener_id += 1;
        self.device_listeners.insert(self.next_listener_id, listener);
        self.next_listener_id
    }

    pub fn remove_device_listener(&mut self, id: u64) {
        self.device_listeners.remove(&id);
    }

    /// Full re-scan after a hot-plug; every device listener gets the fresh
    /// list.
    pub fn rescan_devices(&mut self) -> Result<Vec<MidiDeviceInfo>> {
        let devices = scan_devices()?;
        for listener in self.device_listeners.values() {
            listener(&devices);
        }
        Ok(devices)
    }

    pub fn shutdown(&mut self) {
        self.stop_learn();
        self.message_listeners.clear();
        self.parameter_sinks.clear();
        self.device_listeners.clear();
    }
}

// --- midir device plumbing ---

pub fn get_midi_ports() -> Result<Vec<(String, MidiInputPort)>> {
    let midi_in = MidiInput::new(APP_NAME)?;
    let ports = midi_in.ports();
    let mut result = Vec::with_capacity(ports.len());
    for port in ports.iter() {
        let name = midi_in.port_name(port)?;
        result.push((name, port.clone()));
    }
    Ok(result)
}

pub fn scan_devices() -> Result<Vec<MidiDeviceInfo>> {
    let mut devices = Vec::new();
    let midi_in = MidiInput::new(APP_NAME)?;
    for port in midi_in.ports() {
        let name = midi_in.port_name(&port)?;
        devices.push(MidiDeviceInfo {
            id: format!("in:{}", name),
            name,
            kind: MidiPortKind::Input,
        });
    }
    let midi_out = MidiOutput::new(APP_NAME)?;
    for port in midi_out.ports() {
        let name = midi_out.port_name(&port)?;
        devices.push(MidiDeviceInfo {
            id: format!("out:{}", name),
            name,
            kind: MidiPortKind::Output,
        });
    }
    Ok(devices)
}

/// Open a MIDI input connection that parses incoming bytes and forwards
/// them to the control thread.
pub fn connect_midi(
    port: MidiInputPort,
    port_name: String,
    message_sender: Sender<(String, MidiMessage)>,
) -> Result<MidiInputConnection<()>> {
    let mut midi_in = MidiInput::new(APP_NAME)?;
    midi_in.ignore(Ignore::None);

    let in_port_name = midi_in.port_name(&port)?;
    println!("Opening MIDI connection to: {}", in_port_name);

    let device_id = format!("in:{}", port_name);
    let conn = midi_in
        .connect(
            &port,
            &format!("mixdeck-midi-in-{}", port_name),
            move |_stamp, bytes, _| {
                if let Some(message) = parse_midi_message(bytes) {
                    message_sender.send((device_id.clone(), message)).ok();
                }
            },
            (),
        )
        .map_err(|e| anyhow::anyhow!("Failed to connect to MIDI port: {}", e))?;

    println!("MIDI connection open to {}", port_name);
    Ok(conn)
}
