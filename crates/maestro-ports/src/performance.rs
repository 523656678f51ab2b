use crate::midi::Message;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// Invoked once per newly reached score position while performing.
pub type PositionCallback = Arc<dyn Fn(MsPosition) + Send + Sync + 'static>;

/// Invoked once when a performance ends, with the recording passed to `play`
/// (if any) and the elapsed performance duration.
pub type EndOfPerformanceCallback =
    Arc<dyn Fn(Option<Recording>, Duration) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMessage {
    pub elapsed: Duration,
    pub message: Message,
}

/// Messages sent to the output device during one performance, per channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    channels: Vec<Vec<RecordedMessage>>,
}

impl Recording {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channel_count],
        }
    }

    pub fn record(&mut self, elapsed: Duration, message: Message) {
        let channel = message.channel() as usize;
        if self.channels.len() <= channel {
            self.channels.resize(channel + 1, Vec::new());
        }
        self.channels[channel].push(RecordedMessage { elapsed, message });
    }

    pub fn channel(&self, channel: u8) -> &[RecordedMessage] {
        self.channels
            .get(channel as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.channels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
