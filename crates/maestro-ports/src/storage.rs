use crate::types::*;
use serde::{Deserialize, Serialize};

fn default_speed_factor() -> f64 {
    1.0
}

fn default_worker_inbox_capacity() -> usize {
    256
}

fn default_event_queue_capacity() -> usize {
    4096
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsDto {
    pub selected_midi_in: Option<DeviceId>,
    pub selected_midi_out: Option<DeviceId>,
    #[serde(default = "default_speed_factor")]
    pub speed_factor: f64,
    #[serde(default = "default_worker_inbox_capacity")]
    pub worker_inbox_capacity: usize,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    pub log_filter: Option<String>,
}

impl Default for SettingsDto {
    fn default() -> Self {
        Self {
            selected_midi_in: None,
            selected_midi_out: None,
            speed_factor: default_speed_factor(),
            worker_inbox_capacity: default_worker_inbox_capacity(),
            event_queue_capacity: default_event_queue_capacity(),
            log_filter: None,
        }
    }
}

pub trait StoragePort: Send + Sync {
    fn load_settings(&self) -> Result<SettingsDto, StorageError>;
    fn save_settings(&self, s: &SettingsDto) -> Result<(), StorageError>;
}
