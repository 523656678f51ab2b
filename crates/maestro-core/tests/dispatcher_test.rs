use crossbeam_channel::{Receiver, Sender};
use maestro_core::{
    DispatchError, LiveInputDispatcher, PerformanceEvent, ProtocolError, SessionId, TrackWorker,
    WorkerCommand, WorkerFactory, WorkerHandle, WorkerOutput, WorkerPhase, WorkerReport,
};
use maestro_domain_score::{ControlTarget, ControllerKind, ScoreData, TrackSelection};
use maestro_ports::midi::{Message, MidiError, MidiOutput, RawInputEvent};
use maestro_ports::performance::Recording;
use maestro_ports::types::MsPosition;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Instants: 0 on(60) | 500 off(60) on(62) | 1000 off(62) on(64) | 1500 off(64)
const SCORE: &str = r#"{
    "key_range": { "bottom": 48, "top": 72 },
    "output_tracks": [
        {
            "midi_channel": 0,
            "objects": [
                { "position": 0, "duration": 500, "content": { "kind": "chord",
                    "basic_chords": [ { "ms_duration": 250, "notes": [60], "velocities": [100] } ] } },
                { "position": 500, "duration": 500, "content": { "kind": "chord",
                    "basic_chords": [ { "ms_duration": 250, "notes": [62], "velocities": [100] } ] } },
                { "position": 1000, "duration": 500, "content": { "kind": "rest" } }
            ]
        },
        {
            "midi_channel": 1,
            "objects": [
                { "position": 0, "duration": 1000, "content": { "kind": "chord",
                    "basic_chords": [ { "ms_duration": 1000, "notes": [48], "velocities": [90] } ] } }
            ]
        }
    ],
    "input_tracks": [
        {
            "chords": [
                {
                    "position": 0, "duration": 500,
                    "notes": [ {
                        "notated_key": 60,
                        "note_on": { "seq": { "trks": [
                            { "track_index": 0, "objects": { "start": 0, "end": 1 } },
                            { "track_index": 1, "objects": { "start": 0, "end": 1 } }
                        ] } },
                        "note_off": { "trk_offs": [1] }
                    } ]
                },
                {
                    "position": 500, "duration": 500,
                    "notes": [ {
                        "notated_key": 62,
                        "note_on": { "seq": { "trks": [
                            { "track_index": 0, "objects": { "start": 1, "end": 2 } }
                        ] } },
                        "note_off": { "pressures": [ { "track_index": 1, "target": "Expression" } ] }
                    } ]
                },
                {
                    "position": 1000, "duration": 500,
                    "notes": [ {
                        "notated_key": 64,
                        "note_on": { "seq": { "trks": [
                            { "track_index": 0, "objects": { "start": 2, "end": 3 } }
                        ] } }
                    } ]
                }
            ]
        }
    ]
}"#;

// Instants: 0 on(60) on(64) | 500 on(62). 64 -> track 1 obj 0, 62 -> track 1 obj 1.
const SHARED_TRACK_SCORE: &str = r#"{
    "key_range": { "bottom": 48, "top": 72 },
    "output_tracks": [
        {
            "midi_channel": 0,
            "objects": [
                { "position": 0, "duration": 500, "content": { "kind": "chord",
                    "basic_chords": [ { "ms_duration": 250, "notes": [40], "velocities": [100] } ] } }
            ]
        },
        {
            "midi_channel": 1,
            "objects": [
                { "position": 0, "duration": 500, "content": { "kind": "chord",
                    "basic_chords": [ { "ms_duration": 250, "notes": [50], "velocities": [100] } ] } },
                { "position": 500, "duration": 500, "content": { "kind": "chord",
                    "basic_chords": [ { "ms_duration": 250, "notes": [51], "velocities": [100] } ] } }
            ]
        }
    ],
    "input_tracks": [
        {
            "chords": [
                {
                    "position": 0, "duration": 500,
                    "notes": [
                        { "notated_key": 60, "note_on": { "seq": { "trks": [
                            { "track_index": 0, "objects": { "start": 0, "end": 1 } }
                        ] } } },
                        { "notated_key": 64, "note_on": { "seq": { "trks": [
                            { "track_index": 1, "objects": { "start": 0, "end": 1 } }
                        ] } } }
                    ]
                },
                {
                    "position": 500, "duration": 500,
                    "notes": [
                        { "notated_key": 62, "note_on": { "seq": { "trks": [
                            { "track_index": 1, "objects": { "start": 1, "end": 2 } }
                        ] } } }
                    ]
                }
            ]
        }
    ]
}"#;

#[derive(Default)]
struct RecordingOutput {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MidiOutput for RecordingOutput {
    fn send(&self, message: &[u8], _timestamp: Instant) -> Result<(), MidiError> {
        self.sent.lock().push(message.to_vec());
        Ok(())
    }
}

/// Hands out unthreaded workers whose inboxes the test reads directly.
#[derive(Clone, Default)]
struct InboxFactory {
    inboxes: Arc<Mutex<Vec<Receiver<WorkerCommand>>>>,
}

impl WorkerFactory for InboxFactory {
    fn spawn(
        &self,
        track_index: usize,
        _session: SessionId,
        _events: Sender<PerformanceEvent>,
    ) -> std::io::Result<WorkerHandle> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut inboxes = self.inboxes.lock();
        if inboxes.len() <= track_index {
            inboxes.resize_with(track_index + 1, || crossbeam_channel::never());
        }
        inboxes[track_index] = rx;
        Ok(WorkerHandle::new(track_index, tx, None))
    }
}

impl InboxFactory {
    /// Every command received since the last call.
    fn all_commands(&self, track_index: usize) -> Vec<WorkerCommand> {
        self.inboxes.lock()[track_index].try_iter().collect()
    }

    /// Commands received since the last call, without the setup commands.
    fn live_commands(&self, track_index: usize) -> Vec<WorkerCommand> {
        let inboxes = self.inboxes.lock();
        inboxes[track_index]
            .try_iter()
            .filter(|command| {
                !matches!(
                    command,
                    WorkerCommand::Init { .. }
                        | WorkerCommand::SetSpeedFactor(_)
                        | WorkerCommand::PushTrk(_)
                )
            })
            .collect()
    }
}

type Ended = Arc<Mutex<Vec<(Option<Recording>, Duration)>>>;

struct Fixture {
    score: &'static str,
    dispatcher: LiveInputDispatcher,
    factory: InboxFactory,
    output: Arc<RecordingOutput>,
    positions: Arc<Mutex<Vec<MsPosition>>>,
    ended: Ended,
}

fn fixture() -> Fixture {
    fixture_with(SCORE)
}

fn fixture_with(json: &'static str) -> Fixture {
    let score: ScoreData = serde_json::from_str(json).unwrap();
    let factory = InboxFactory::default();
    let output = Arc::new(RecordingOutput::default());
    let positions = Arc::new(Mutex::new(Vec::new()));
    let ended: Ended = Arc::new(Mutex::new(Vec::new()));
    let (events, _) = crossbeam_channel::unbounded();

    let positions_sink = positions.clone();
    let ended_sink = ended.clone();
    let dispatcher = LiveInputDispatcher::new(
        Arc::new(score),
        output.clone(),
        Box::new(factory.clone()),
        events,
        Arc::new(move |position| positions_sink.lock().push(position)),
        Arc::new(move |recording, duration| ended_sink.lock().push((recording, duration))),
    );
    Fixture {
        score: json,
        dispatcher,
        factory,
        output,
        positions,
        ended,
    }
}

impl Fixture {
    fn play(&mut self) {
        let score: ScoreData = serde_json::from_str(self.score).unwrap();
        self.dispatcher
            .play(&TrackSelection::all(&score), 0, 1500, Some(Recording::new(2)))
            .unwrap();
    }

    fn input(&mut self, bytes: &[u8]) -> Result<(), DispatchError> {
        self.dispatcher.handle_input(&RawInputEvent {
            at: Instant::now(),
            bytes: bytes.to_vec(),
        })
    }

    fn key_on(&mut self, key: u8, velocity: u8) {
        self.input(&[0x90, key, velocity]).unwrap();
    }

    fn key_off(&mut self, key: u8) {
        self.input(&[0x80, key, 64]).unwrap();
    }
}

#[test]
fn play_resets_every_output_channel() {
    let mut fx = fixture();
    fx.play();

    let expected: Vec<Vec<u8>> = [0, 1]
        .into_iter()
        .flat_map(|channel| {
            [
                Message::all_controllers_off(channel),
                Message::all_notes_off(channel),
            ]
        })
        .map(|message| message.as_bytes().to_vec())
        .collect();
    assert_eq!(*fx.output.sent.lock(), expected);
    assert!(fx.dispatcher.is_running());
    assert_eq!(fx.dispatcher.cursor(), Some(0));
}

#[test]
fn first_note_starts_its_seq_with_measured_velocity() {
    let mut fx = fixture();
    fx.play();

    fx.key_on(60, 90);

    assert_eq!(fx.factory.live_commands(0), vec![WorkerCommand::Start { velocity: 90 }]);
    assert_eq!(fx.factory.live_commands(1), vec![WorkerCommand::Start { velocity: 90 }]);
    assert_eq!(*fx.positions.lock(), Vec::<MsPosition>::new());
}

#[test]
fn legato_advance_moves_cursor_by_one_and_reports_once() {
    let mut fx = fixture();
    fx.play();
    fx.key_on(60, 90);
    fx.factory.live_commands(0);

    fx.key_on(62, 70);

    assert_eq!(fx.dispatcher.cursor(), Some(1));
    assert_eq!(*fx.positions.lock(), vec![500]);
    assert_eq!(fx.factory.live_commands(0), vec![WorkerCommand::Start { velocity: 70 }]);
}

#[test]
fn out_of_turn_key_is_consumed_without_firing() {
    let mut fx = fixture();
    fx.play();

    fx.key_on(64, 100);
    fx.key_on(60, 90);
    fx.key_on(62, 70);
    fx.key_on(64, 100);

    // 64's only note-on was spent out of turn, so the cursor stops at 1.
    assert_eq!(fx.dispatcher.cursor(), Some(1));
    assert_eq!(
        fx.factory.live_commands(0),
        vec![
            WorkerCommand::DropTrk {
                position_in_score: 1000
            },
            WorkerCommand::Start { velocity: 90 },
            WorkerCommand::Start { velocity: 70 },
        ]
    );
    assert_eq!(*fx.positions.lock(), vec![500]);
}

#[test]
fn note_off_stops_trk_offs_and_retargets_controls() {
    let mut fx = fixture();
    fx.play();
    fx.key_on(60, 90);
    fx.key_on(62, 70);
    fx.factory.live_commands(1);

    fx.key_off(60);
    assert_eq!(fx.factory.live_commands(1), vec![WorkerCommand::Stop]);

    // 62's note-off sits at the next instant and arrives legato.
    fx.input(&[0x90, 62, 0]).unwrap();
    assert_eq!(fx.dispatcher.cursor(), Some(2));
    assert_eq!(
        fx.factory.live_commands(1),
        vec![WorkerCommand::SetControl {
            kind: ControllerKind::Pressure,
            target: ControlTarget::Expression,
        }]
    );
}

#[test]
fn legato_advance_fires_orphaned_note_offs() {
    let mut fx = fixture();
    fx.play();
    fx.key_on(60, 90);
    fx.key_on(62, 70);
    fx.factory.live_commands(0);
    fx.factory.live_commands(1);

    // 60 is still held; its note-off at instant 1 is orphaned by the advance to 2.
    fx.key_off(62);

    assert_eq!(fx.dispatcher.cursor(), Some(2));
    assert_eq!(fx.factory.live_commands(1).first(), Some(&WorkerCommand::Stop));

    fx.key_off(60);
    assert_eq!(fx.factory.live_commands(1), vec![]);
}

#[test]
fn controllers_broadcast_regardless_of_cursor() {
    let mut fx = fixture();
    fx.play();

    fx.input(&[0xD3, 40]).unwrap();
    fx.input(&[0xE0, 1, 70]).unwrap();
    fx.input(&[0xB0, 1, 12]).unwrap();

    let expected = vec![
        WorkerCommand::DoController {
            kind: ControllerKind::Pressure,
            value: 40,
        },
        WorkerCommand::DoPitchWheel { data1: 1, data2: 70 },
        WorkerCommand::DoController {
            kind: ControllerKind::ModWheel,
            value: 12,
        },
    ];
    assert_eq!(fx.factory.live_commands(0), expected);
    assert_eq!(fx.factory.live_commands(1), expected);
}

#[test]
fn keys_outside_range_and_realtime_bytes_are_ignored() {
    let mut fx = fixture();
    fx.play();

    fx.key_on(30, 90);
    fx.input(&[0xF8]).unwrap();
    fx.input(&[0xF0, 0x7E, 0xF7]).unwrap();

    assert_eq!(fx.factory.live_commands(0), vec![]);
    assert_eq!(fx.dispatcher.cursor(), Some(0));
}

#[test]
fn malformed_sysex_is_a_protocol_error_and_leaves_state_alone() {
    let mut fx = fixture();
    fx.play();

    let result = fx.input(&[0xF0, 0x7E, 0x01]);

    assert!(matches!(
        result,
        Err(DispatchError::Protocol(ProtocolError::MalformedSysex { .. }))
    ));
    assert!(fx.dispatcher.is_running());
    fx.key_on(60, 90);
    assert_eq!(fx.factory.live_commands(0), vec![WorkerCommand::Start { velocity: 90 }]);
}

#[test]
fn play_while_running_is_rejected() {
    let mut fx = fixture();
    fx.play();

    let score: ScoreData = serde_json::from_str(SCORE).unwrap();
    let result = fx
        .dispatcher
        .play(&TrackSelection::all(&score), 0, 1500, None);

    assert!(matches!(result, Err(DispatchError::AlreadyRunning)));
}

#[test]
fn input_while_stopped_is_ignored() {
    let mut fx = fixture();

    fx.key_on(60, 90);

    assert!(fx.dispatcher.is_stopped());
    assert!(fx.output.sent.lock().is_empty());
}

#[test]
fn stop_is_idempotent_and_terminates_workers() {
    let mut fx = fixture();
    fx.play();

    fx.dispatcher.stop();
    fx.dispatcher.stop();

    assert!(fx.dispatcher.is_stopped());
    assert_eq!(fx.ended.lock().len(), 1);
    assert_eq!(fx.factory.live_commands(0), vec![WorkerCommand::Terminate]);
}

#[test]
fn worker_messages_are_forwarded_and_recorded() {
    let mut fx = fixture();
    fx.play();
    fx.output.sent.lock().clear();
    let message = Message::note_on(1, 48, 90);

    fx.dispatcher.handle_report(WorkerReport::Midi {
        session: 1,
        track_index: 1,
        message,
        at: Instant::now(),
    });
    fx.dispatcher.stop();

    assert_eq!(*fx.output.sent.lock(), vec![message.as_bytes().to_vec()]);
    let ended = fx.ended.lock();
    let recording = ended[0].0.as_ref().unwrap();
    assert_eq!(recording.len(), 1);
    assert_eq!(recording.channel(1)[0].message, message);
}

#[test]
fn stops_once_every_worker_with_trks_has_completed() {
    let mut fx = fixture();
    fx.play();

    fx.dispatcher.handle_report(WorkerReport::WorkerCompleted {
        session: 99,
        track_index: 0,
        channel: 0,
    });
    fx.dispatcher.handle_report(WorkerReport::WorkerCompleted {
        session: 1,
        track_index: 0,
        channel: 0,
    });
    assert!(fx.dispatcher.is_running());

    fx.dispatcher.handle_report(WorkerReport::WorkerCompleted {
        session: 1,
        track_index: 1,
        channel: 1,
    });
    assert!(fx.dispatcher.is_stopped());
    assert_eq!(fx.ended.lock().len(), 1);

    fx.dispatcher.handle_report(WorkerReport::WorkerCompleted {
        session: 1,
        track_index: 1,
        channel: 1,
    });
    assert_eq!(fx.ended.lock().len(), 1);
}

#[test]
fn stale_session_reports_are_discarded() {
    let mut fx = fixture();
    fx.play();
    fx.dispatcher.stop();
    fx.play();
    fx.output.sent.lock().clear();

    fx.dispatcher.handle_report(WorkerReport::Midi {
        session: 1,
        track_index: 0,
        message: Message::note_on(0, 60, 90),
        at: Instant::now(),
    });

    assert!(fx.output.sent.lock().is_empty());
}

/// Replays one inbox into a real worker, pumping after every command.
fn replay(commands: Vec<WorkerCommand>) -> (TrackWorker, Vec<WorkerOutput>) {
    let mut worker = TrackWorker::default();
    let mut outputs = Vec::new();
    let now = Instant::now();
    for command in commands {
        worker.handle(command, now);
        worker.poll(now);
        outputs.extend(worker.drain_output());
    }
    (worker, outputs)
}

fn note_ons(outputs: &[WorkerOutput]) -> Vec<u8> {
    outputs
        .iter()
        .filter_map(|output| match output {
            WorkerOutput::Midi { message, .. } if message.is_note_on() => Some(message.data1()),
            _ => None,
        })
        .collect()
}

#[test]
fn legato_advance_drops_orphaned_note_on_trks() {
    let mut fx = fixture_with(SHARED_TRACK_SCORE);
    fx.play();

    fx.key_on(60, 90);
    fx.key_on(62, 70);

    assert_eq!(fx.dispatcher.cursor(), Some(1));
    let commands = fx.factory.all_commands(1);
    assert_eq!(
        commands
            .iter()
            .filter(|command| !matches!(
                command,
                WorkerCommand::Init { .. }
                    | WorkerCommand::SetSpeedFactor(_)
                    | WorkerCommand::PushTrk(_)
            ))
            .cloned()
            .collect::<Vec<_>>(),
        vec![
            WorkerCommand::DropTrk {
                position_in_score: 0
            },
            WorkerCommand::Start { velocity: 70 },
        ]
    );
    let (_, outputs) = replay(commands);
    assert_eq!(note_ons(&outputs), vec![51]);
}

#[test]
fn out_of_turn_trks_are_dropped_so_the_worker_can_complete() {
    let mut fx = fixture();
    fx.play();

    fx.key_on(64, 100);
    fx.key_on(60, 90);
    fx.key_on(62, 70);

    let (mut worker, outputs) = replay(fx.factory.all_commands(0));
    assert_eq!(note_ons(&outputs), vec![60, 62]);
    assert_eq!(worker.queued(), 0);

    worker.handle(WorkerCommand::Stop, Instant::now());
    assert!(worker.drain_output().any(|output| output == WorkerOutput::WorkerCompleted));
    assert_eq!(worker.phase(), WorkerPhase::Completed);
}
