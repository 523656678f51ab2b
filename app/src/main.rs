use maestro_core::{ConfigError, DispatchError, Performer, PerformerConfig};
use maestro_domain_score::{ScoreData, TrackSelection};
use maestro_infra_midi_midir::{MidirMidiInputPort, MidirMidiOutputPort};
use maestro_infra_storage_fs::FsStorage;
use maestro_ports::midi::{MidiError, MidiInputPort, MidiOutputPort};
use maestro_ports::performance::Recording;
use maestro_ports::storage::{SettingsDto, StorageError, StoragePort};
use maestro_ports::types::{DeviceId, MsPosition};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: maestro-app <score.json> [from_ms] [to_ms]";

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("{0}")]
    Usage(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("midi error: {0}")]
    Midi(#[from] MidiError),
    #[error("no midi {0} device available")]
    NoDevice(&'static str),
    #[error("failed to read score: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse score: {0}")]
    ScoreFormat(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("performance error: {0}")]
    Dispatch(#[from] DispatchError),
}

struct Args {
    score_path: PathBuf,
    from: MsPosition,
    to: MsPosition,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, AppError> {
        let score_path = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| AppError::Usage(USAGE.to_string()))?;
        let mut position = |default: MsPosition| -> Result<MsPosition, AppError> {
            match args.next() {
                Some(value) => value
                    .parse()
                    .map_err(|_| AppError::Usage(format!("invalid position {value:?}\n{USAGE}"))),
                None => Ok(default),
            }
        };
        let from = position(0)?;
        let to = position(MsPosition::MAX)?;
        Ok(Self {
            score_path,
            from,
            to,
        })
    }
}

fn init_logging(settings: &SettingsDto) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log_filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn pick(selected: Option<&DeviceId>, available: Vec<DeviceId>) -> Option<DeviceId> {
    match selected {
        Some(id) => available.into_iter().find(|candidate| candidate == id),
        None => available.into_iter().next(),
    }
}

fn run() -> Result<(), AppError> {
    let args = Args::parse(std::env::args().skip(1))?;
    let storage = FsStorage::default();
    let settings = storage.load_settings()?;
    init_logging(&settings);

    let score: ScoreData = serde_json::from_slice(&std::fs::read(&args.score_path)?)?;
    let score = Arc::new(score);
    info!(
        path = %args.score_path.display(),
        output_tracks = score.output_tracks.len(),
        input_tracks = score.input_tracks.len(),
        "score loaded"
    );

    let output_port = MidirMidiOutputPort::default();
    let outputs = output_port.list_outputs()?.into_iter().map(|d| d.id).collect();
    let output_id =
        pick(settings.selected_midi_out.as_ref(), outputs).ok_or(AppError::NoDevice("output"))?;
    let output = output_port.open_output(&output_id)?;

    let input_port = MidirMidiInputPort::default();
    let inputs = input_port
        .list_inputs()?
        .into_iter()
        .filter(|d| d.is_available)
        .map(|d| d.id)
        .collect();
    let input_id =
        pick(settings.selected_midi_in.as_ref(), inputs).ok_or(AppError::NoDevice("input"))?;

    let mut performer = Performer::builder()
        .config(PerformerConfig::from(&settings))
        .output(output)
        .score(score.clone())
        .on_position(Arc::new(|position_ms: MsPosition| info!(position_ms, "position")))
        .on_end(Arc::new(|recording: Option<Recording>, duration: Duration| {
            info!(
                duration_ms = duration.as_millis() as u64,
                recorded = recording.map_or(0, |recording| recording.len()),
                "performance ended"
            )
        }))
        .build()?;

    let channels = score
        .output_tracks
        .iter()
        .map(|track| usize::from(track.midi_channel) + 1)
        .max()
        .unwrap_or(0);
    performer.play(
        &TrackSelection::all(&score),
        args.from,
        args.to,
        Some(Recording::new(channels)),
    )?;
    let input = input_port.open_input(&input_id, performer.input_callback())?;

    performer.run_until_stopped();
    input.close();
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppError::Usage(usage)) => {
            eprintln!("{usage}");
            ExitCode::from(2)
        }
        Err(err) => {
            error!(%err, "maestro failed");
            eprintln!("maestro: {err}");
            ExitCode::FAILURE
        }
    }
}
