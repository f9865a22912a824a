// src/main.rs

use mixdeck::device::{CpalDeviceProvider, DeviceProvider};
use mixdeck::engine::AudioEngine;
use mixdeck::midi::{self, MidiMessage};
use mixdeck::settings;
use mixdeck::types::{AudioChannel, MasterSection};
use std::sync::mpsc;

fn main() -> anyhow::Result<()> {
    let app_settings = settings::load_settings();

    let mut provider = CpalDeviceProvider::new()?;
    println!("Audio devices:");
    for device in provider.enumerate()? {
        println!("  [{:?}] {}", device.kind, device.name);
    }

    let sample_rate = app_settings.sample_rate.unwrap_or(44100);
    let (engine, mut controller) = AudioEngine::create(sample_rate as f32, MasterSection::default());

    if let Some(path) = settings::mapping_store_path() {
        controller
            .midi()
            .set_store(Box::new(midi::JsonMappingStore::new(path)));
    }

    for i in 1..=4 {
        controller.create_channel(AudioChannel::new(
            format!("channel-{}", i),
            format!("Channel {}", i),
        ))?;
    }

    let (_stream, active_sr, active_bs) = mixdeck::audio_io::init_and_run_output(
        app_settings.output_device.clone(),
        app_settings.sample_rate,
        app_settings.buffer_size,
        engine,
    )?;
    println!("Engine running at {} Hz / {} frames", active_sr, active_bs);

    // Attach the first matching MIDI input, if any.
    let (midi_sender, midi_receiver) = mpsc::channel::<(String, MidiMessage)>();
    let _midi_connection = match midi::get_midi_ports() {
        Ok(ports) => ports
            .into_iter()
            .find(|(name, _)| {
                app_settings
                    .midi_port_name
                    .as_ref()
                    .map_or(true, |wanted| name == wanted)
            })
            .and_then(|(name, port)| midi::connect_midi(port, name, midi_sender).ok()),
        Err(e) => {
            eprintln!("MIDI unavailable: {}", e);
            None
        }
    };

    println!("Press Ctrl-C to quit.");
    loop {
        while let Ok((device_id, message)) = midi_receiver.try_recv() {
            controller.handle_midi_message(&device_id, &message);
        }
        controller.poll_events();
        controller.midi().poll();
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}
