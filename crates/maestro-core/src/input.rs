use maestro_ports::midi::{command, system};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("system exclusive message of {len} bytes is not terminated")]
    MalformedSysex { len: usize },
    #[error("illegal system status byte {0:#04X}")]
    IllegalStatus(u8),
}

/// A decoded channel-voice event from the performer's controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputEvent {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8, velocity: u8 },
    Aftertouch { channel: u8, key: u8, value: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, value: u8 },
    PitchWheel { channel: u8, lsb: u8, msb: u8 },
}

/// Decodes one raw input event.
///
/// Realtime and well-formed system-exclusive input is ignored (`Ok(None)`),
/// as are shapes other than 2 or 3 bytes.
pub fn decode(bytes: &[u8]) -> Result<Option<InputEvent>, ProtocolError> {
    let Some(&status) = bytes.first() else {
        return Ok(None);
    };

    if status == system::SYSEX_START {
        return if bytes.len() > 2 && bytes.last() == Some(&system::SYSEX_END) {
            Ok(None)
        } else {
            Err(ProtocolError::MalformedSysex { len: bytes.len() })
        };
    }
    if status & 0xF0 == 0xF0 {
        return if system::is_realtime_status(status) {
            Ok(None)
        } else {
            Err(ProtocolError::IllegalStatus(status))
        };
    }

    let (data1, data2) = match bytes.len() {
        2 => (bytes[1], 0),
        3 => (bytes[1], bytes[2]),
        _ => return Ok(None),
    };
    let channel = status & 0x0F;

    let event = match status & 0xF0 {
        command::NOTE_ON => InputEvent::NoteOn {
            channel,
            key: data1,
            velocity: data2,
        },
        command::NOTE_OFF => InputEvent::NoteOff {
            channel,
            key: data1,
            velocity: data2,
        },
        command::AFTERTOUCH => InputEvent::Aftertouch {
            channel,
            key: data1,
            value: data2,
        },
        command::CONTROL_CHANGE => InputEvent::ControlChange {
            channel,
            controller: data1,
            value: data2,
        },
        command::PROGRAM_CHANGE => InputEvent::ProgramChange {
            channel,
            program: data1,
        },
        command::CHANNEL_PRESSURE => InputEvent::ChannelPressure {
            channel,
            value: data1,
        },
        command::PITCH_WHEEL => InputEvent::PitchWheel {
            channel,
            lsb: data1,
            msb: data2,
        },
        // Running status (no status byte) is not produced by the input ports.
        _ => return Ok(None),
    };
    Ok(Some(event))
}
