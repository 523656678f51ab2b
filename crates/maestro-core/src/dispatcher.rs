use crate::clock::clamp_speed_factor;
use crate::events::{PerformanceEvent, SessionId, WorkerReport};
use crate::input::{decode, InputEvent, ProtocolError};
use crate::track_worker::{WorkerCommand, WorkerFactory, WorkerHandle};
use crossbeam_channel::Sender;
use maestro_domain_score::{
    ControllerKind, KeyEntry, NoteKind, Schedule, ScoreData, ScoreError, TrackSelection,
};
use maestro_ports::midi::{Message, MidiError, MidiOutput, RawInputEvent};
use maestro_ports::performance::{EndOfPerformanceCallback, PositionCallback, Recording};
use maestro_ports::types::MsPosition;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("a performance is already running")]
    AlreadyRunning,
    #[error("score error: {0}")]
    Score(#[from] ScoreError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("midi error: {0}")]
    Midi(#[from] MidiError),
    #[error("failed to spawn track worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything owned by one running performance. Dropped at stop.
struct Session {
    id: SessionId,
    schedule: Schedule,
    cursor: usize,
    last_played: Option<usize>,
    workers: Vec<WorkerHandle>,
    /// Workers that were given Trks and have not completed yet.
    pending: BTreeSet<usize>,
    recording: Option<Recording>,
    started_at: Instant,
}

impl Session {
    fn handle_key(&mut self, key: u8, velocity: u8, on_position: &PositionCallback) {
        if !self.schedule.keys().range().contains(key) {
            return;
        }
        let Some(entry) = self.schedule.keys_mut().take_next(key) else {
            return;
        };

        let cursor = self.cursor;
        let legato = entry.instant == cursor + 1 && self.last_played == Some(cursor);
        if entry.instant != cursor && !legato {
            debug!(key, instant = entry.instant, cursor, "note event out of turn");
            self.skip(entry);
            return;
        }

        if legato {
            self.cursor = entry.instant;
            let mut orphans = self.schedule.keys_mut().consume_before(entry.instant);
            // Same order as the workers' Trk queues.
            orphans
                .sort_by_key(|orphan| (orphan.instant, orphan.kind == NoteKind::On, orphan.event));
            for orphan in orphans {
                match orphan.kind {
                    NoteKind::Off => self.fire(orphan, 0),
                    NoteKind::On => self.skip(orphan),
                }
            }
            if let Some(instant) = self.schedule.instant(self.cursor) {
                debug!(
                    cursor = self.cursor,
                    position_ms = instant.position_in_score,
                    "legato advance"
                );
                on_position(instant.position_in_score);
            }
        }

        self.fire(entry, velocity);
        self.last_played = Some(self.cursor);
    }

    fn fire(&self, entry: KeyEntry, velocity: u8) {
        let Some(event) = self.schedule.event(entry) else {
            return;
        };
        trace!(key = event.notated_key, instant = entry.instant, velocity, "note event");

        if let Some(seq) = event.seq.as_ref() {
            for &track_index in seq.track_indices() {
                self.send(track_index, WorkerCommand::Start { velocity });
            }
        }
        for control in &event.controls {
            self.send(
                control.track_index,
                WorkerCommand::SetControl {
                    kind: control.kind,
                    target: control.target,
                },
            );
        }
        for &track_index in &event.trk_offs {
            self.send(track_index, WorkerCommand::Stop);
        }
    }

    /// Drops the entry's queued Trks so later Starts play the right ones.
    fn skip(&self, entry: KeyEntry) {
        let Some(seq) = self.schedule.event(entry).and_then(|event| event.seq.as_ref()) else {
            return;
        };
        for &track_index in seq.track_indices() {
            self.send(
                track_index,
                WorkerCommand::DropTrk {
                    position_in_score: seq.position_in_score,
                },
            );
        }
    }

    fn send(&self, track_index: usize, command: WorkerCommand) {
        match self.workers.get(track_index) {
            Some(worker) => worker.send(command),
            None => warn!(track_index, "no worker for track"),
        }
    }

    fn broadcast(&self, command: WorkerCommand) {
        for worker in &self.workers {
            worker.try_send(command.clone());
        }
    }
}

/// Walks the precomputed schedule as the performer plays.
///
/// Runs on the orchestrator's thread only; workers are reached through
/// their inboxes.
pub struct LiveInputDispatcher {
    score: Arc<ScoreData>,
    output: Arc<dyn MidiOutput>,
    factory: Box<dyn WorkerFactory>,
    events: Sender<PerformanceEvent>,
    on_position: PositionCallback,
    on_end: EndOfPerformanceCallback,
    speed_factor: f64,
    next_session: SessionId,
    session: Option<Session>,
}

impl LiveInputDispatcher {
    pub fn new(
        score: Arc<ScoreData>,
        output: Arc<dyn MidiOutput>,
        factory: Box<dyn WorkerFactory>,
        events: Sender<PerformanceEvent>,
        on_position: PositionCallback,
        on_end: EndOfPerformanceCallback,
    ) -> Self {
        Self {
            score,
            output,
            factory,
            events,
            on_position,
            on_end,
            speed_factor: 1.0,
            next_session: 1,
            session: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.session.is_none()
    }

    /// The schedule index the performer is at, while running.
    pub fn cursor(&self) -> Option<usize> {
        self.session.as_ref().map(|session| session.cursor)
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed_factor
    }

    pub fn play(
        &mut self,
        selection: &TrackSelection,
        from: MsPosition,
        to: MsPosition,
        recording: Option<Recording>,
    ) -> Result<(), DispatchError> {
        if self.session.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        let mut schedule = Schedule::build(&self.score, selection, from, to)?;

        let now = Instant::now();
        for track in &self.score.output_tracks {
            for message in [
                Message::all_controllers_off(track.midi_channel),
                Message::all_notes_off(track.midi_channel),
            ] {
                self.output.send(message.as_bytes(), now)?;
            }
        }

        let id = self.next_session;
        self.next_session += 1;
        let workers = self.spawn_workers(id)?;

        let mut pending = BTreeSet::new();
        for trk in schedule.drain_trks() {
            let track_index = trk.track_index;
            if let Some(worker) = workers.get(track_index) {
                pending.insert(track_index);
                worker.send(WorkerCommand::PushTrk(trk));
            }
        }

        info!(
            session = id,
            instants = schedule.len(),
            workers = workers.len(),
            from_ms = from,
            to_ms = to,
            "performance started"
        );
        self.session = Some(Session {
            id,
            schedule,
            cursor: 0,
            last_played: None,
            workers,
            pending,
            recording,
            started_at: Instant::now(),
        });
        Ok(())
    }

    fn spawn_workers(&self, session: SessionId) -> Result<Vec<WorkerHandle>, DispatchError> {
        let mut workers = Vec::with_capacity(self.score.output_tracks.len());
        for (track_index, track) in self.score.output_tracks.iter().enumerate() {
            let worker = match self.factory.spawn(track_index, session, self.events.clone()) {
                Ok(worker) => worker,
                Err(error) => {
                    workers.into_iter().for_each(WorkerHandle::terminate);
                    return Err(error.into());
                }
            };
            worker.send(WorkerCommand::Init {
                track_index,
                channel: track.midi_channel,
            });
            worker.send(WorkerCommand::SetSpeedFactor(self.speed_factor));
            workers.push(worker);
        }
        Ok(workers)
    }

    /// Handles one live input event. Ignored while stopped.
    pub fn handle_input(&mut self, event: &RawInputEvent) -> Result<(), DispatchError> {
        let Some(session) = self.session.as_mut() else {
            debug!("input while stopped ignored");
            return Ok(());
        };
        let Some(input) = decode(&event.bytes)? else {
            return Ok(());
        };

        match input {
            InputEvent::NoteOn { key, velocity, .. } if velocity > 0 => {
                session.handle_key(key, velocity, &self.on_position)
            }
            InputEvent::NoteOn { key, .. } | InputEvent::NoteOff { key, .. } => {
                session.handle_key(key, 0, &self.on_position)
            }
            InputEvent::ChannelPressure { value, .. } => {
                session.broadcast(WorkerCommand::DoController {
                    kind: ControllerKind::Pressure,
                    value,
                })
            }
            InputEvent::PitchWheel { lsb, msb, .. } => {
                session.broadcast(WorkerCommand::DoPitchWheel {
                    data1: lsb,
                    data2: msb,
                })
            }
            InputEvent::ControlChange { value, .. } => {
                session.broadcast(WorkerCommand::DoController {
                    kind: ControllerKind::ModWheel,
                    value,
                })
            }
            InputEvent::Aftertouch { .. } | InputEvent::ProgramChange { .. } => {}
        }
        Ok(())
    }

    pub fn handle_report(&mut self, report: WorkerReport) {
        let Some(session) = self.session.as_mut() else {
            trace!("worker report while stopped discarded");
            return;
        };
        if report.session() != session.id {
            trace!(session = report.session(), "stale worker report discarded");
            return;
        }

        let all_completed = match report {
            WorkerReport::Midi {
                track_index,
                message,
                at,
                ..
            } => {
                if let Err(error) = self.output.send(message.as_bytes(), at) {
                    warn!(track_index, %error, "output send failed");
                }
                if let Some(recording) = session.recording.as_mut() {
                    recording.record(at.saturating_duration_since(session.started_at), message);
                }
                false
            }
            WorkerReport::TrkCompleted {
                track_index,
                channel,
                ..
            } => {
                debug!(track_index, channel, "trk completed");
                false
            }
            WorkerReport::WorkerCompleted {
                track_index,
                channel,
                ..
            } => {
                debug!(track_index, channel, "worker completed");
                session.pending.remove(&track_index) && session.pending.is_empty()
            }
        };

        if all_completed {
            info!(session = session.id, "all workers completed");
            self.stop();
        }
    }

    pub fn set_speed_factor(&mut self, speed_factor: f64) {
        self.speed_factor = clamp_speed_factor(speed_factor);
        if let Some(session) = self.session.as_ref() {
            for worker in &session.workers {
                worker.send(WorkerCommand::SetSpeedFactor(self.speed_factor));
            }
        }
    }

    /// Ends the performance. Does nothing when already stopped.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("stop while stopped");
            return;
        };
        for worker in session.workers {
            worker.terminate();
        }
        let duration = session.started_at.elapsed();
        info!(
            session = session.id,
            duration_ms = duration.as_millis() as u64,
            "performance stopped"
        );
        (self.on_end)(session.recording, duration);
    }
}
