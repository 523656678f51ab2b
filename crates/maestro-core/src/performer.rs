use crate::clock::clamp_speed_factor;
use crate::dispatcher::{DispatchError, LiveInputDispatcher};
use crate::events::PerformanceEvent;
use crate::track_worker::{ThreadWorkerFactory, WorkerFactory};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use maestro_domain_score::{ScoreData, ScoreError, TrackSelection};
use maestro_ports::midi::{MidiOutput, RawInputCallback};
use maestro_ports::performance::{EndOfPerformanceCallback, PositionCallback, Recording};
use maestro_ports::storage::SettingsDto;
use maestro_ports::types::MsPosition;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no output device")]
    MissingOutput,
    #[error("no score data")]
    MissingScore,
    #[error("no position callback")]
    MissingPositionCallback,
    #[error("no end-of-performance callback")]
    MissingEndCallback,
    #[error("score has no output tracks")]
    NoOutputTracks,
    #[error("invalid score: {0}")]
    Score(#[from] ScoreError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformerConfig {
    pub speed_factor: f64,
    pub worker_inbox_capacity: usize,
    pub event_queue_capacity: usize,
}

impl Default for PerformerConfig {
    fn default() -> Self {
        Self::from(&SettingsDto::default())
    }
}

impl From<&SettingsDto> for PerformerConfig {
    fn from(settings: &SettingsDto) -> Self {
        Self {
            speed_factor: clamp_speed_factor(settings.speed_factor),
            worker_inbox_capacity: settings.worker_inbox_capacity.max(1),
            event_queue_capacity: settings.event_queue_capacity.max(1),
        }
    }
}

#[derive(Default)]
pub struct PerformerBuilder {
    config: PerformerConfig,
    output: Option<Arc<dyn MidiOutput>>,
    score: Option<Arc<ScoreData>>,
    on_position: Option<PositionCallback>,
    on_end: Option<EndOfPerformanceCallback>,
    factory: Option<Box<dyn WorkerFactory>>,
}

impl PerformerBuilder {
    pub fn config(mut self, config: PerformerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn output(mut self, output: Arc<dyn MidiOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn score(mut self, score: Arc<ScoreData>) -> Self {
        self.score = Some(score);
        self
    }

    pub fn on_position(mut self, callback: PositionCallback) -> Self {
        self.on_position = Some(callback);
        self
    }

    pub fn on_end(mut self, callback: EndOfPerformanceCallback) -> Self {
        self.on_end = Some(callback);
        self
    }

    /// Replaces the default thread-per-track worker factory.
    pub fn worker_factory(mut self, factory: Box<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Performer, ConfigError> {
        let output = self.output.ok_or(ConfigError::MissingOutput)?;
        let score = self.score.ok_or(ConfigError::MissingScore)?;
        let on_position = self.on_position.ok_or(ConfigError::MissingPositionCallback)?;
        let on_end = self.on_end.ok_or(ConfigError::MissingEndCallback)?;
        if score.output_tracks.is_empty() {
            return Err(ConfigError::NoOutputTracks);
        }
        score.validate()?;

        let config = self.config;
        let factory = self.factory.unwrap_or_else(|| {
            Box::new(ThreadWorkerFactory {
                inbox_capacity: config.worker_inbox_capacity,
            })
        });
        // Workers report without blocking; only live input is capped.
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let mut dispatcher = LiveInputDispatcher::new(
            score,
            output,
            factory,
            events_tx.clone(),
            on_position,
            on_end,
        );
        dispatcher.set_speed_factor(config.speed_factor);

        Ok(Performer {
            dispatcher,
            events_tx,
            events_rx,
            input_capacity: config.event_queue_capacity,
        })
    }
}

/// Runs performances of one score: a single-threaded loop over one
/// arrival-ordered event channel fed by the input device and the workers.
pub struct Performer {
    dispatcher: LiveInputDispatcher,
    events_tx: Sender<PerformanceEvent>,
    events_rx: Receiver<PerformanceEvent>,
    input_capacity: usize,
}

impl Performer {
    pub fn builder() -> PerformerBuilder {
        PerformerBuilder::default()
    }

    /// Callback for the MIDI input port. Drops input once the queue holds
    /// `event_queue_capacity` events.
    pub fn input_callback(&self) -> RawInputCallback {
        let events = self.events_tx.clone();
        let capacity = self.input_capacity;
        Arc::new(move |event| {
            if events.len() >= capacity {
                warn!(queued = events.len(), "event queue full, live input dropped");
                return;
            }
            if events.send(PerformanceEvent::Input(event)).is_err() {
                debug!("performer gone, live input dropped");
            }
        })
    }

    pub fn queued_events(&self) -> usize {
        self.events_rx.len()
    }

    pub fn play(
        &mut self,
        selection: &TrackSelection,
        from: MsPosition,
        to: MsPosition,
        recording: Option<Recording>,
    ) -> Result<(), DispatchError> {
        self.dispatcher.play(selection, from, to, recording)
    }

    pub fn stop(&mut self) {
        self.dispatcher.stop();
    }

    pub fn set_speed_factor(&mut self, speed_factor: f64) {
        self.dispatcher.set_speed_factor(speed_factor);
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    pub fn is_stopped(&self) -> bool {
        self.dispatcher.is_stopped()
    }

    pub fn dispatcher(&self) -> &LiveInputDispatcher {
        &self.dispatcher
    }

    /// Processes one event. A protocol error drops only that event.
    pub fn process(&mut self, event: PerformanceEvent) -> Result<(), DispatchError> {
        match event {
            PerformanceEvent::Input(input) => self.dispatcher.handle_input(&input),
            PerformanceEvent::Worker(report) => {
                self.dispatcher.handle_report(report);
                Ok(())
            }
        }
    }

    /// Processes events until `deadline`, or until the performance stops.
    pub fn pump_until(&mut self, deadline: Instant) {
        while self.is_running() {
            match self.events_rx.recv_deadline(deadline) {
                Ok(event) => self.process_logged(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    pub fn pump(&mut self, timeout: Duration) {
        self.pump_until(Instant::now() + timeout);
    }

    /// Blocks until the performance ends, on its own or through `stop`.
    pub fn run_until_stopped(&mut self) {
        while self.is_running() {
            match self.events_rx.recv() {
                Ok(event) => self.process_logged(event),
                Err(_) => return,
            }
        }
    }

    fn process_logged(&mut self, event: PerformanceEvent) {
        if let Err(error) = self.process(event) {
            warn!(%error, "event dropped");
        }
    }
}
