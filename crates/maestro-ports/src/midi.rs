use crate::types::*;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Instant};

pub mod command {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const AFTERTOUCH: u8 = 0xA0;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_PRESSURE: u8 = 0xD0;
    pub const PITCH_WHEEL: u8 = 0xE0;
}

pub mod control {
    pub const BANK: u8 = 0;
    pub const MODWHEEL: u8 = 1;
    pub const DATA_ENTRY_COARSE: u8 = 6;
    pub const VOLUME: u8 = 7;
    pub const PAN: u8 = 10;
    pub const EXPRESSION: u8 = 11;
    pub const REGISTERED_PARAMETER_FINE: u8 = 100;
    pub const REGISTERED_PARAMETER_COARSE: u8 = 101;
    pub const ALL_CONTROLLERS_OFF: u8 = 121;
    pub const ALL_NOTES_OFF: u8 = 123;
}

pub mod system {
    pub const SYSEX_START: u8 = 0xF0;
    pub const SYSEX_END: u8 = 0xF7;
    pub const MIDI_CLOCK: u8 = 0xF8;
    pub const MIDI_TICK: u8 = 0xF9;
    pub const MIDI_START: u8 = 0xFA;
    pub const MIDI_CONTINUE: u8 = 0xFB;
    pub const MIDI_STOP: u8 = 0xFC;
    pub const ACTIVE_SENSE: u8 = 0xFE;
    pub const RESET: u8 = 0xFF;

    /// 0xFD is undefined and not realtime.
    pub fn is_realtime_status(status: u8) -> bool {
        matches!(
            status,
            MIDI_CLOCK | MIDI_TICK | MIDI_START | MIDI_CONTINUE | MIDI_STOP | ACTIVE_SENSE | RESET
        )
    }
}

/// An immutable channel-voice message of 1..=3 bytes.
///
/// The length follows from the status byte: program change and channel
/// pressure carry one data byte, the other channel-voice commands two.
/// Serialized as its wire bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Message {
    bytes: [u8; 3],
    len: u8,
}

impl Message {
    pub fn new(status: u8, data1: u8, data2: u8) -> Self {
        let len = Self::len_for_status(status);
        let mut bytes = [status, data1, data2];
        for byte in bytes.iter_mut().skip(len as usize) {
            *byte = 0;
        }
        Self { bytes, len }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(command::NOTE_ON | (channel & 0x0F), note, velocity)
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(command::NOTE_OFF | (channel & 0x0F), note, velocity)
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(command::CONTROL_CHANGE | (channel & 0x0F), controller, value)
    }

    pub fn program_change(channel: u8, patch: u8) -> Self {
        Self::new(command::PROGRAM_CHANGE | (channel & 0x0F), patch, 0)
    }

    pub fn channel_pressure(channel: u8, value: u8) -> Self {
        Self::new(command::CHANNEL_PRESSURE | (channel & 0x0F), value, 0)
    }

    pub fn pitch_wheel(channel: u8, lsb: u8, msb: u8) -> Self {
        Self::new(command::PITCH_WHEEL | (channel & 0x0F), lsb, msb)
    }

    pub fn all_controllers_off(channel: u8) -> Self {
        Self::control_change(channel, control::ALL_CONTROLLERS_OFF, 0)
    }

    pub fn all_notes_off(channel: u8) -> Self {
        Self::control_change(channel, control::ALL_NOTES_OFF, 0)
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn data1(&self) -> u8 {
        self.bytes[1]
    }

    pub fn data2(&self) -> u8 {
        self.bytes[2]
    }

    /// High nibble of the status byte.
    pub fn command(&self) -> u8 {
        self.bytes[0] & 0xF0
    }

    pub fn channel(&self) -> u8 {
        self.bytes[0] & 0x0F
    }

    pub fn is_note_on(&self) -> bool {
        self.command() == command::NOTE_ON
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn with_data2(&self, data2: u8) -> Self {
        Self::new(self.bytes[0], self.bytes[1], data2)
    }

    fn len_for_status(status: u8) -> u8 {
        match status & 0xF0 {
            command::PROGRAM_CHANGE | command::CHANNEL_PRESSURE => 2,
            0xF0 => 1,
            _ => 3,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("{0:#04X} is not a status byte")]
    NotStatus(u8),
    #[error("status {status:#04X} takes {expected} bytes, got {actual}")]
    Length {
        status: u8,
        expected: usize,
        actual: usize,
    },
}

impl TryFrom<Vec<u8>> for Message {
    type Error = MessageError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        let status = *bytes.first().ok_or(MessageError::Empty)?;
        if status < 0x80 {
            return Err(MessageError::NotStatus(status));
        }
        let expected = usize::from(Self::len_for_status(status));
        if bytes.len() != expected {
            return Err(MessageError::Length {
                status,
                expected,
                actual: bytes.len(),
            });
        }
        let data = |index: usize| bytes.get(index).copied().unwrap_or(0);
        Ok(Self::new(status, data(1), data(2)))
    }
}

impl From<Message> for Vec<u8> {
    fn from(message: Message) -> Self {
        message.as_bytes().to_vec()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message(")?;
        for (index, byte) in self.as_bytes().iter().enumerate() {
            if index > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        write!(f, ")")
    }
}

/// Raw input from MIDI devices, not decoded yet.
#[derive(Clone, Debug)]
pub struct RawInputEvent {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum MidiError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// MIDI input stream handle: drop closes it.
pub trait MidiInputStream: Send {
    fn close(self: Box<Self>);
}

pub type RawInputCallback = Arc<dyn Fn(RawInputEvent) + Send + Sync + 'static>;

pub trait MidiInputPort: Send + Sync {
    fn list_inputs(&self) -> Result<Vec<MidiInputDevice>, MidiError>;

    /// Open input stream: implementation should invoke cb from a background thread/callback.
    fn open_input(
        &self,
        device_id: &DeviceId,
        cb: RawInputCallback,
    ) -> Result<Box<dyn MidiInputStream>, MidiError>;
}

/// An open output device. Sends from several threads may interleave.
pub trait MidiOutput: Send + Sync {
    fn send(&self, message: &[u8], timestamp: Instant) -> Result<(), MidiError>;
}

pub trait MidiOutputPort: Send + Sync {
    fn list_outputs(&self) -> Result<Vec<MidiOutputDevice>, MidiError>;

    fn open_output(&self, device_id: &DeviceId) -> Result<Arc<dyn MidiOutput>, MidiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_change_is_two_bytes() {
        let message = Message::program_change(3, 17);
        assert_eq!(message.as_bytes(), &[0xC3, 17]);
    }

    #[test]
    fn note_on_keeps_channel_in_low_nibble() {
        let message = Message::note_on(0x1A, 60, 100);
        assert_eq!(message.channel(), 0x0A);
        assert!(message.is_note_on());
        assert_eq!(message.with_data2(5).as_bytes(), &[0x9A, 60, 5]);
    }

    #[test]
    fn deserialize_rejects_wrong_lengths() {
        let message: Message = serde_json::from_str("[146, 60, 90]").unwrap();
        assert_eq!(message, Message::note_on(2, 60, 90));
        assert_eq!(serde_json::to_string(&Message::program_change(0, 5)).unwrap(), "[192,5]");

        for json in ["[]", "[60, 1, 2]", "[146, 60, 90, 1]", "[192, 5, 0]"] {
            assert!(serde_json::from_str::<Message>(json).is_err(), "{json}");
        }
        assert_eq!(
            Message::try_from(vec![0x90, 60]),
            Err(MessageError::Length {
                status: 0x90,
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn reset_messages_use_channel_mode_controllers() {
        assert_eq!(Message::all_controllers_off(2).as_bytes(), &[0xB2, 121, 0]);
        assert_eq!(Message::all_notes_off(2).as_bytes(), &[0xB2, 123, 0]);
    }
}
