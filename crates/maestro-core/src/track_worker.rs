use crate::clock::{clamp_speed_factor, TrkClock};
use crate::events::{PerformanceEvent, SessionId, WorkerReport};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use maestro_domain_score::{
    ControlTarget, ControllerKind, NoteOffPolicy, Trk, TrkCursor, TrkOptions, VelocityOption,
};
use maestro_ports::midi::{control, Message};
use maestro_ports::types::MsPosition;
use std::collections::VecDeque;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Commands a worker accepts through its inbox.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerCommand {
    Init { track_index: usize, channel: u8 },
    PushTrk(Trk),
    /// Velocity 0 plays the Trk's written velocities unchanged.
    Start { velocity: u8 },
    /// Hard stop of the running Trk.
    Stop,
    /// Removes a queued Trk that will never be started.
    DropTrk { position_in_score: MsPosition },
    DoNoteOff,
    SetSpeedFactor(f64),
    DoController { kind: ControllerKind, value: u8 },
    DoPitchWheel { data1: u8, data2: u8 },
    SetControl { kind: ControllerKind, target: ControlTarget },
    Terminate,
}

/// What a worker produced, before the runner tags it with a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOutput {
    Midi { message: Message, at: Instant },
    TrkCompleted,
    WorkerCompleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Running,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum VelocityTransform {
    Written,
    Scale(f64),
    Shared(f64),
    Override(f64),
}

impl VelocityTransform {
    fn new(option: Option<VelocityOption>, performed: u8) -> Self {
        if performed == 0 {
            return VelocityTransform::Written;
        }
        let corrected = corrected_velocity(performed);
        match option {
            Some(VelocityOption::Scale) => VelocityTransform::Scale(corrected / 64.0),
            Some(VelocityOption::Shared) => VelocityTransform::Shared((corrected / 2.0).round()),
            Some(VelocityOption::Override) => VelocityTransform::Override(corrected.round()),
            None => VelocityTransform::Written,
        }
    }

    fn apply(self, written: u8, min_velocity: Option<u8>) -> f64 {
        let written = f64::from(written);
        let transformed = match self {
            VelocityTransform::Written => return written,
            VelocityTransform::Scale(factor) => written * factor,
            VelocityTransform::Shared(shared) => written / 2.0 + shared,
            VelocityTransform::Override(velocity) => velocity,
        };
        match min_velocity {
            Some(min) => transformed.max(f64::from(min)),
            None => transformed,
        }
    }
}

/// Spreads a keyboard's usable 20..=127 range over 16..=127.
fn corrected_velocity(velocity: u8) -> f64 {
    (f64::from(velocity.max(21)) - 20.0) * 112.0 / 107.0 + 15.0
}

#[derive(Debug)]
struct Playback {
    cursor: TrkCursor,
    clock: TrkClock,
    options: TrkOptions,
    velocity: VelocityTransform,
    stop_at_boundary: bool,
    fade_length: Option<usize>,
    sent: usize,
}

impl Playback {
    fn note_on_velocity(&self, written: u8) -> u8 {
        let mut velocity = self.velocity.apply(written, self.options.min_velocity);
        if let Some(fade_length) = self.fade_length {
            velocity = velocity * self.cursor.remaining() as f64 / fade_length as f64;
        }
        velocity.clamp(0.0, 127.0) as u8
    }
}

#[derive(Debug)]
enum WorkerState {
    Idle,
    Running(Box<Playback>),
    Completed,
}

enum Step {
    Wait(Instant),
    Send,
    StopAtBoundary,
    Finish,
}

#[derive(Clone, Copy, Debug)]
struct ControlRouting {
    pressure: ControlTarget,
    pitch_wheel: ControlTarget,
    mod_wheel: ControlTarget,
}

impl Default for ControlRouting {
    fn default() -> Self {
        Self {
            pressure: ControllerKind::Pressure.default_target(),
            pitch_wheel: ControllerKind::PitchWheel.default_target(),
            mod_wheel: ControllerKind::ModWheel.default_target(),
        }
    }
}

impl ControlRouting {
    fn target(&self, kind: ControllerKind) -> ControlTarget {
        match kind {
            ControllerKind::Pressure => self.pressure,
            ControllerKind::PitchWheel => self.pitch_wheel,
            ControllerKind::ModWheel => self.mod_wheel,
        }
    }

    fn set(&mut self, kind: ControllerKind, target: ControlTarget) {
        match kind {
            ControllerKind::Pressure => self.pressure = target,
            ControllerKind::PitchWheel => self.pitch_wheel = target,
            ControllerKind::ModWheel => self.mod_wheel = target,
        }
    }
}

/// One output track's player. Owns its Trk queue, cursor and clock.
///
/// Time is always passed in, so the state machine can be driven without
/// sleeping; [`run_worker`] drives it from a thread.
#[derive(Debug)]
pub struct TrackWorker {
    track_index: usize,
    channel: u8,
    queue: VecDeque<Trk>,
    state: WorkerState,
    routing: ControlRouting,
    speed_factor: f64,
    outbox: Vec<WorkerOutput>,
}

impl Default for TrackWorker {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl TrackWorker {
    pub fn new(track_index: usize, channel: u8) -> Self {
        Self {
            track_index,
            channel,
            queue: VecDeque::new(),
            state: WorkerState::Idle,
            routing: ControlRouting::default(),
            speed_factor: 1.0,
            outbox: Vec::new(),
        }
    }

    pub fn track_index(&self) -> usize {
        self.track_index
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn phase(&self) -> WorkerPhase {
        match self.state {
            WorkerState::Idle => WorkerPhase::Idle,
            WorkerState::Running(_) => WorkerPhase::Running,
            WorkerState::Completed => WorkerPhase::Completed,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn drain_output(&mut self) -> std::vec::Drain<'_, WorkerOutput> {
        self.outbox.drain(..)
    }

    pub fn handle(&mut self, command: WorkerCommand, now: Instant) {
        match command {
            WorkerCommand::Init {
                track_index,
                channel,
            } => {
                *self = Self::new(track_index, channel);
            }
            WorkerCommand::PushTrk(trk) => {
                if matches!(self.state, WorkerState::Completed) {
                    debug!(
                        track_index = self.track_index,
                        "trk pushed to completed worker ignored"
                    );
                    return;
                }
                self.queue.push_back(trk);
            }
            WorkerCommand::Start { velocity } => self.start(velocity, now),
            WorkerCommand::Stop => {
                if matches!(self.state, WorkerState::Running(_)) {
                    self.finish_trk(now);
                } else {
                    debug!(track_index = self.track_index, "stop while not running");
                }
            }
            WorkerCommand::DropTrk { position_in_score } => self.drop_trk(position_in_score),
            WorkerCommand::DoNoteOff => self.do_note_off(now),
            WorkerCommand::SetSpeedFactor(speed_factor) => {
                self.speed_factor = clamp_speed_factor(speed_factor);
                if let WorkerState::Running(playback) = &mut self.state {
                    playback.clock.set_speed_factor(now, self.speed_factor);
                }
            }
            WorkerCommand::DoController { kind, value } => self.do_controller(kind, 0, value, now),
            WorkerCommand::DoPitchWheel { data1, data2 } => {
                self.do_controller(ControllerKind::PitchWheel, data1, data2, now)
            }
            WorkerCommand::SetControl { kind, target } => self.routing.set(kind, target),
            WorkerCommand::Terminate => {
                self.queue.clear();
                self.state = WorkerState::Completed;
            }
        }
    }

    /// Sends every Moment due at `now`; returns when the next one is due.
    pub fn poll(&mut self, now: Instant) -> Option<Instant> {
        loop {
            let WorkerState::Running(playback) = &mut self.state else {
                return None;
            };

            let step = match playback.cursor.current() {
                None => Step::Finish,
                Some((position, moment)) => {
                    let due = playback.clock.due_at(position);
                    if due > now {
                        Step::Wait(due)
                    } else if playback.stop_at_boundary && playback.sent > 0 && moment.is_boundary()
                    {
                        Step::StopAtBoundary
                    } else {
                        Step::Send
                    }
                }
            };

            match step {
                Step::Wait(due) => return Some(due),
                Step::Finish => {
                    self.finish_trk(now);
                    return None;
                }
                Step::StopAtBoundary => {
                    if let Some((position, moment)) = playback.cursor.current() {
                        let at = playback.clock.due_at(position);
                        for message in moment.prelude() {
                            trace!(track_index = self.track_index, ?message, "prelude");
                            self.outbox.push(WorkerOutput::Midi {
                                message: *message,
                                at,
                            });
                        }
                    }
                    self.finish_trk(now);
                    return None;
                }
                Step::Send => {
                    if let Some((position, moment)) = playback.cursor.current() {
                        let at = playback.clock.due_at(position);
                        for message in &moment.messages {
                            let message = if message.is_note_on() {
                                message.with_data2(playback.note_on_velocity(message.data2()))
                            } else {
                                *message
                            };
                            trace!(track_index = self.track_index, ?message, "send");
                            self.outbox.push(WorkerOutput::Midi { message, at });
                        }
                    }
                    playback.cursor.advance();
                    playback.sent += 1;
                }
            }
        }
    }

    fn start(&mut self, velocity: u8, now: Instant) {
        if matches!(self.state, WorkerState::Completed) {
            debug!(track_index = self.track_index, "start on completed worker ignored");
            return;
        }
        if self.queue.is_empty() {
            debug!(track_index = self.track_index, "start with empty queue ignored");
            return;
        }
        if matches!(self.state, WorkerState::Running(_)) {
            self.finish_trk(now);
        }
        let Some(trk) = self.queue.pop_front() else {
            return;
        };

        debug!(
            track_index = self.track_index,
            position_ms = trk.position_in_score,
            velocity,
            "trk started"
        );
        let options = trk.options;
        self.state = WorkerState::Running(Box::new(Playback {
            cursor: TrkCursor::new(trk),
            clock: TrkClock::start(now, self.speed_factor),
            options,
            velocity: VelocityTransform::new(options.velocity, velocity),
            stop_at_boundary: false,
            fade_length: None,
            sent: 0,
        }));
    }

    fn drop_trk(&mut self, position_in_score: MsPosition) {
        if matches!(self.state, WorkerState::Completed) {
            return;
        }
        let Some(index) = self
            .queue
            .iter()
            .position(|trk| trk.position_in_score == position_in_score)
        else {
            debug!(
                track_index = self.track_index,
                position_ms = position_in_score,
                "no trk to drop"
            );
            return;
        };
        self.queue.remove(index);
        debug!(track_index = self.track_index, position_ms = position_in_score, "trk dropped");

        if self.queue.is_empty() && matches!(self.state, WorkerState::Idle) {
            debug!(track_index = self.track_index, channel = self.channel, "worker completed");
            self.outbox.push(WorkerOutput::WorkerCompleted);
            self.state = WorkerState::Completed;
        }
    }

    fn do_note_off(&mut self, now: Instant) {
        let WorkerState::Running(playback) = &mut self.state else {
            debug!(track_index = self.track_index, "note off while not running");
            return;
        };
        match playback.options.note_off_policy() {
            NoteOffPolicy::StopChord => playback.stop_at_boundary = true,
            NoteOffPolicy::StopNow => self.finish_trk(now),
            NoteOffPolicy::Fade => {
                playback.cursor.stop_looping();
                let remaining = playback.cursor.remaining();
                if remaining > 0 {
                    playback.fade_length = Some(remaining);
                }
            }
            NoteOffPolicy::ShortFade | NoteOffPolicy::Ignore => {}
        }
    }

    fn do_controller(&mut self, kind: ControllerKind, data1: u8, value: u8, now: Instant) {
        if matches!(self.state, WorkerState::Completed) {
            return;
        }
        let channel = self.channel;
        let message = match self.routing.target(kind) {
            ControlTarget::Disabled => return,
            ControlTarget::ChannelPressure => Message::channel_pressure(channel, value),
            ControlTarget::PitchWheel => match kind {
                ControllerKind::PitchWheel => Message::pitch_wheel(channel, data1, value),
                _ => Message::pitch_wheel(channel, 0, value),
            },
            ControlTarget::ModWheel => Message::control_change(channel, control::MODWHEEL, value),
            ControlTarget::Volume { min, max } => {
                let (low, high) = (u16::from(min.min(max)), u16::from(min.max(max)));
                let volume = low + u16::from(value.min(127)) * (high - low) / 127;
                Message::control_change(channel, control::VOLUME, volume.min(127) as u8)
            }
            ControlTarget::Expression => {
                Message::control_change(channel, control::EXPRESSION, value)
            }
            ControlTarget::Pan => Message::control_change(channel, control::PAN, value),
        };
        self.outbox.push(WorkerOutput::Midi { message, at: now });
    }

    fn finish_trk(&mut self, now: Instant) {
        let playback = match std::mem::replace(&mut self.state, WorkerState::Idle) {
            WorkerState::Running(playback) => playback,
            other => {
                self.state = other;
                return;
            }
        };

        if !playback.options.lets_sound() {
            for message in [
                Message::all_controllers_off(self.channel),
                Message::all_notes_off(self.channel),
            ] {
                self.outbox.push(WorkerOutput::Midi { message, at: now });
            }
        }

        if self.queue.is_empty() {
            debug!(track_index = self.track_index, channel = self.channel, "worker completed");
            self.outbox.push(WorkerOutput::WorkerCompleted);
            self.state = WorkerState::Completed;
        } else {
            debug!(track_index = self.track_index, channel = self.channel, "trk completed");
            self.outbox.push(WorkerOutput::TrkCompleted);
        }
    }
}

/// Runs `worker` until `Terminate` arrives or its inbox disconnects.
///
/// The only wait is on the inbox itself, bounded by the next Moment's due time.
/// `events` must be unbounded so that reporting never blocks the worker.
pub fn run_worker(
    mut worker: TrackWorker,
    session: SessionId,
    inbox: Receiver<WorkerCommand>,
    events: Sender<PerformanceEvent>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let command = match deadline {
            Some(deadline) => match inbox.recv_deadline(deadline) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inbox.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        if let Some(command) = command {
            if matches!(command, WorkerCommand::Terminate) {
                break;
            }
            worker.handle(command, Instant::now());
        }
        deadline = worker.poll(Instant::now());

        let track_index = worker.track_index();
        let channel = worker.channel();
        for output in worker.drain_output() {
            let report = match output {
                WorkerOutput::Midi { message, at } => WorkerReport::Midi {
                    session,
                    track_index,
                    message,
                    at,
                },
                WorkerOutput::TrkCompleted => WorkerReport::TrkCompleted {
                    session,
                    track_index,
                    channel,
                },
                WorkerOutput::WorkerCompleted => WorkerReport::WorkerCompleted {
                    session,
                    track_index,
                    channel,
                },
            };
            if events.send(PerformanceEvent::Worker(report)).is_err() {
                return;
            }
        }
    }
    debug!(track_index = worker.track_index(), session, "worker exited");
}

/// The orchestrator's side of one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    track_index: usize,
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(
        track_index: usize,
        commands: Sender<WorkerCommand>,
        thread: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            track_index,
            commands,
            thread,
        }
    }

    pub fn track_index(&self) -> usize {
        self.track_index
    }

    /// Blocking send, for lifecycle commands.
    pub fn send(&self, command: WorkerCommand) {
        if self.commands.send(command).is_err() {
            warn!(track_index = self.track_index, "worker inbox disconnected");
        }
    }

    /// Non-blocking send, for controller updates. Returns false if dropped.
    pub fn try_send(&self, command: WorkerCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    track_index = self.track_index,
                    "worker inbox full, controller update dropped"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Hard-stops the worker. The thread is left to exit on its own.
    ///
    /// Never blocks: with a full inbox the worker still exits once the
    /// dropped sender disconnects it.
    pub fn terminate(mut self) {
        match self.commands.try_send(WorkerCommand::Terminate) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(
                    track_index = self.track_index,
                    "worker inbox full, terminating by disconnect"
                )
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(track_index = self.track_index, "worker already exited")
            }
        }
        self.thread.take();
    }
}

/// Creates one worker per output track at `play`.
pub trait WorkerFactory: Send {
    fn spawn(
        &self,
        track_index: usize,
        session: SessionId,
        events: Sender<PerformanceEvent>,
    ) -> std::io::Result<WorkerHandle>;
}

/// Runs every worker on its own thread with a bounded inbox.
#[derive(Clone, Copy, Debug)]
pub struct ThreadWorkerFactory {
    pub inbox_capacity: usize,
}

impl WorkerFactory for ThreadWorkerFactory {
    fn spawn(
        &self,
        track_index: usize,
        session: SessionId,
        events: Sender<PerformanceEvent>,
    ) -> std::io::Result<WorkerHandle> {
        let (tx, rx) = crossbeam_channel::bounded(self.inbox_capacity.max(1));
        let thread = std::thread::Builder::new()
            .name(format!("track-worker-{track_index}"))
            .spawn(move || run_worker(TrackWorker::default(), session, rx, events))?;
        Ok(WorkerHandle::new(track_index, tx, Some(thread)))
    }
}
