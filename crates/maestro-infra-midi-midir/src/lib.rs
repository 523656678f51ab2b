use maestro_ports::midi::{
    MidiError, MidiInputPort, MidiInputStream, MidiOutput, MidiOutputPort, RawInputCallback,
    RawInputEvent,
};
use maestro_ports::types::{DeviceId, MidiInputDevice, MidiOutputDevice};
use midir::{Ignore, MidiIO, MidiInput, MidiOutputConnection};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

fn device_id(index: usize, name: &str) -> DeviceId {
    DeviceId(format!("midir:{}:{}", index, name))
}

fn find_port<T: MidiIO>(io: &T, device_id: &DeviceId) -> Result<T::Port, MidiError> {
    io.ports()
        .into_iter()
        .enumerate()
        .find(|(index, port)| {
            let name = io
                .port_name(port)
                .unwrap_or_else(|_| "Unknown Device".to_string());
            self::device_id(*index, &name) == *device_id
        })
        .map(|(_, port)| port)
        .ok_or_else(|| MidiError::DeviceNotFound(device_id.to_string()))
}

pub struct MidirMidiInputPort {
    client_name: String,
}

impl MidirMidiInputPort {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn create_midi_in(&self) -> Result<MidiInput, MidiError> {
        MidiInput::new(&self.client_name).map_err(|e| MidiError::Backend(e.to_string()))
    }
}

impl Default for MidirMidiInputPort {
    fn default() -> Self {
        Self::new("Maestro")
    }
}

pub struct MidirMidiInputStream {
    connection: Option<midir::MidiInputConnection<RawInputCallback>>,
}

impl MidiInputStream for MidirMidiInputStream {
    fn close(mut self: Box<Self>) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.close();
        }
    }
}

impl MidiInputPort for MidirMidiInputPort {
    fn list_inputs(&self) -> Result<Vec<MidiInputDevice>, MidiError> {
        let midi_in = self.create_midi_in()?;
        let devices = midi_in
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| {
                let name = midi_in
                    .port_name(port)
                    .unwrap_or_else(|_| "Unknown Input".to_string());
                MidiInputDevice {
                    id: device_id(index, &name),
                    name,
                    is_available: true,
                }
            })
            .collect();
        Ok(devices)
    }

    fn open_input(
        &self,
        device_id: &DeviceId,
        cb: RawInputCallback,
    ) -> Result<Box<dyn MidiInputStream>, MidiError> {
        let mut midi_in = self.create_midi_in()?;
        // Sysex and realtime bytes are passed through; the decoder skips them.
        midi_in.ignore(Ignore::None);
        let port = find_port(&midi_in, device_id)?;

        let connection = midi_in
            .connect(
                &port,
                "maestro-midi-input",
                move |_stamp, message, callback| {
                    (callback)(RawInputEvent {
                        at: Instant::now(),
                        bytes: message.to_vec(),
                    });
                },
                cb,
            )
            .map_err(|e| MidiError::Backend(e.to_string()))?;
        info!(device = %device_id, "midi input opened");

        Ok(Box::new(MidirMidiInputStream {
            connection: Some(connection),
        }))
    }
}

pub struct MidirMidiOutputPort {
    client_name: String,
}

impl MidirMidiOutputPort {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn create_midi_out(&self) -> Result<midir::MidiOutput, MidiError> {
        midir::MidiOutput::new(&self.client_name).map_err(|e| MidiError::Backend(e.to_string()))
    }
}

impl Default for MidirMidiOutputPort {
    fn default() -> Self {
        Self::new("Maestro")
    }
}

/// Sends are serialized through a lock. Messages go out when sent;
/// the timestamp is the worker's due time and is only logged.
pub struct MidirMidiOutput {
    connection: Mutex<MidiOutputConnection>,
}

impl MidiOutput for MidirMidiOutput {
    fn send(&self, message: &[u8], timestamp: Instant) -> Result<(), MidiError> {
        let late = Instant::now().saturating_duration_since(timestamp);
        if late.as_millis() > 5 {
            debug!(late_ms = late.as_millis() as u64, "late midi send");
        }
        self.connection
            .lock()
            .send(message)
            .map_err(|e| MidiError::DeviceUnavailable(e.to_string()))
    }
}

impl MidiOutputPort for MidirMidiOutputPort {
    fn list_outputs(&self) -> Result<Vec<MidiOutputDevice>, MidiError> {
        let midi_out = self.create_midi_out()?;
        let devices = midi_out
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| {
                let name = midi_out
                    .port_name(port)
                    .unwrap_or_else(|_| "Unknown Output".to_string());
                MidiOutputDevice {
                    id: device_id(index, &name),
                    name,
                }
            })
            .collect();
        Ok(devices)
    }

    fn open_output(&self, device_id: &DeviceId) -> Result<Arc<dyn MidiOutput>, MidiError> {
        let midi_out = self.create_midi_out()?;
        let port = find_port(&midi_out, device_id)?;
        let connection = midi_out
            .connect(&port, "maestro-midi-output")
            .map_err(|e| MidiError::Backend(e.to_string()))?;
        info!(device = %device_id, "midi output opened");

        Ok(Arc::new(MidirMidiOutput {
            connection: Mutex::new(connection),
        }))
    }
}
