use maestro_ports::midi::Message;
use maestro_ports::types::MsPosition;
use serde::{Deserialize, Serialize};

/// Logically simultaneous messages at a position relative to their owner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moment {
    pub position: MsPosition,
    pub messages: Vec<Message>,
    /// First Moment of a chord; used for cursor sync and stop-at-boundary.
    pub chord_start: bool,
    pub rest_start: bool,
}

impl Moment {
    pub fn new(position: MsPosition) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn with_messages(position: MsPosition, messages: Vec<Message>) -> Self {
        Self {
            position,
            messages,
            ..Default::default()
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_boundary(&self) -> bool {
        self.chord_start || self.rest_start
    }

    /// Appends `other`'s messages after this Moment's own.
    pub fn merge(&mut self, other: Moment) {
        debug_assert_eq!(self.position, other.position);
        self.messages.extend(other.messages);
        self.chord_start |= other.chord_start;
        self.rest_start |= other.rest_start;
    }

    pub fn clone_at_offset(&self, offset: MsPosition) -> Moment {
        Moment {
            position: self.position + offset,
            ..self.clone()
        }
    }
}
