use maestro_ports::midi::{Message, RawInputEvent};
use std::time::Instant;

/// Identifies one `play` call. Reports from an earlier session are stale.
pub type SessionId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerReport {
    Midi {
        session: SessionId,
        track_index: usize,
        message: Message,
        at: Instant,
    },
    TrkCompleted {
        session: SessionId,
        track_index: usize,
        channel: u8,
    },
    WorkerCompleted {
        session: SessionId,
        track_index: usize,
        channel: u8,
    },
}

impl WorkerReport {
    pub fn session(&self) -> SessionId {
        match self {
            WorkerReport::Midi { session, .. }
            | WorkerReport::TrkCompleted { session, .. }
            | WorkerReport::WorkerCompleted { session, .. } => *session,
        }
    }
}

/// Everything the orchestrator reacts to, in arrival order.
#[derive(Clone, Debug)]
pub enum PerformanceEvent {
    Input(RawInputEvent),
    Worker(WorkerReport),
}
