use crate::chord::ChordDefinition;
use crate::options::{ControlTarget, ControllerKind, TrkOptions};
use maestro_ports::types::{MsDuration, MsPosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScoreError {
    #[error("chord at {position}ms has no basic chords")]
    MissingBasicChords { position: MsPosition },
    #[error("chord at {position}ms has an empty basic chord list")]
    EmptyBasicChords { position: MsPosition },
    #[error("chord at {position}ms has a basic chord whose velocities do not match its notes")]
    MismatchedVelocities { position: MsPosition },
    #[error("chord at {position}ms has a basic chord with a negative duration")]
    NegativeDuration { position: MsPosition },
    #[error("invalid key range {bottom}..={top}")]
    InvalidKeyRange { bottom: u8, top: u8 },
    #[error("notated key {key} is outside the key range")]
    KeyOutOfRange { key: u8 },
    #[error("output track {track_index} has no objects {start}..{end}")]
    ObjectRangeOutOfBounds {
        track_index: usize,
        start: usize,
        end: usize,
    },
    #[error("output track {track_index} does not exist")]
    TrackIndexOutOfRange { track_index: usize },
    #[error("seq at {position}ms has more than one trk for output track {track_index}")]
    DuplicateTrk {
        position: MsPosition,
        track_index: usize,
    },
}

/// The inclusive range of notated keys the score can be performed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub bottom: u8,
    pub top: u8,
}

impl KeyRange {
    pub fn contains(&self, key: u8) -> bool {
        key >= self.bottom && key <= self.top
    }

    pub fn len(&self) -> usize {
        usize::from(self.top.saturating_sub(self.bottom)) + 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectContent {
    Chord(ChordDefinition),
    SilentChord,
    Rest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputObjectDef {
    pub position: MsPosition,
    pub duration: MsDuration,
    pub content: ObjectContent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTrack {
    pub midi_channel: u8,
    #[serde(default)]
    pub objects: Vec<OutputObjectDef>,
}

/// A slice of one output track's objects, played by one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrkDef {
    pub track_index: usize,
    pub objects: Range<usize>,
    #[serde(default)]
    pub trk_options: Option<TrkOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqDef {
    #[serde(default)]
    pub trk_options: Option<TrkOptions>,
    pub trks: Vec<TrkDef>,
}

/// Retargets a worker's live controller when the owning event fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDef {
    pub track_index: usize,
    pub target: ControlTarget,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputNoteEvent {
    pub seq: Option<SeqDef>,
    pub trk_offs: Vec<usize>,
    pub pressures: Vec<ControlDef>,
    pub pitch_wheels: Vec<ControlDef>,
    pub mod_wheels: Vec<ControlDef>,
}

impl InputNoteEvent {
    /// Every output track this event refers to.
    pub fn track_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let seq_tracks = self
            .seq
            .iter()
            .flat_map(|seq| seq.trks.iter().map(|trk| trk.track_index));
        seq_tracks
            .chain(self.trk_offs.iter().copied())
            .chain(self.controls().map(|(_, control)| control.track_index))
    }

    pub fn controls(&self) -> impl Iterator<Item = (ControllerKind, &ControlDef)> + '_ {
        let pressures = self.pressures.iter().map(|c| (ControllerKind::Pressure, c));
        let pitch_wheels = self.pitch_wheels.iter().map(|c| (ControllerKind::PitchWheel, c));
        let mod_wheels = self.mod_wheels.iter().map(|c| (ControllerKind::ModWheel, c));
        pressures.chain(pitch_wheels).chain(mod_wheels)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputNote {
    pub notated_key: u8,
    #[serde(default)]
    pub trk_options: Option<TrkOptions>,
    #[serde(default)]
    pub note_on: Option<InputNoteEvent>,
    #[serde(default)]
    pub note_off: Option<InputNoteEvent>,
}

impl InputNote {
    pub fn events(&self) -> impl Iterator<Item = &InputNoteEvent> + '_ {
        self.note_on.iter().chain(self.note_off.iter())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChord {
    pub position: MsPosition,
    pub duration: MsDuration,
    #[serde(default)]
    pub trk_options: Option<TrkOptions>,
    pub notes: Vec<InputNote>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTrack {
    #[serde(default)]
    pub chords: Vec<InputChord>,
}

/// Score data supplied by the loader. Read-only for the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreData {
    pub key_range: KeyRange,
    pub output_tracks: Vec<OutputTrack>,
    #[serde(default)]
    pub input_tracks: Vec<InputTrack>,
}

impl ScoreData {
    /// Checks every cross reference before anything is built from the score.
    pub fn validate(&self) -> Result<(), ScoreError> {
        let KeyRange { bottom, top } = self.key_range;
        if bottom > top || top > 127 {
            return Err(ScoreError::InvalidKeyRange { bottom, top });
        }

        for chord in self.input_tracks.iter().flat_map(|track| &track.chords) {
            for note in &chord.notes {
                if !self.key_range.contains(note.notated_key) {
                    return Err(ScoreError::KeyOutOfRange { key: note.notated_key });
                }
                for event in note.events() {
                    self.validate_event(chord.position, event)?;
                }
            }
        }
        Ok(())
    }

    fn validate_event(
        &self,
        position: MsPosition,
        event: &InputNoteEvent,
    ) -> Result<(), ScoreError> {
        for track_index in event.track_indices() {
            if track_index >= self.output_tracks.len() {
                return Err(ScoreError::TrackIndexOutOfRange { track_index });
            }
        }

        let Some(seq) = event.seq.as_ref() else {
            return Ok(());
        };
        let mut seen = BTreeSet::new();
        for trk in &seq.trks {
            if !seen.insert(trk.track_index) {
                return Err(ScoreError::DuplicateTrk {
                    position,
                    track_index: trk.track_index,
                });
            }
            let object_count = self.output_tracks[trk.track_index].objects.len();
            if trk.objects.start > trk.objects.end || trk.objects.end > object_count {
                return Err(ScoreError::ObjectRangeOutOfBounds {
                    track_index: trk.track_index,
                    start: trk.objects.start,
                    end: trk.objects.end,
                });
            }
        }
        Ok(())
    }
}

/// Which tracks take part in a performance. Missing entries are disabled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackSelection {
    pub outputs: Vec<bool>,
    pub inputs: Vec<bool>,
}

impl TrackSelection {
    pub fn all(score: &ScoreData) -> Self {
        Self {
            outputs: vec![true; score.output_tracks.len()],
            inputs: vec![true; score.input_tracks.len()],
        }
    }

    pub fn output_enabled(&self, track_index: usize) -> bool {
        self.outputs.get(track_index).copied().unwrap_or(false)
    }

    pub fn input_enabled(&self, track_index: usize) -> bool {
        self.inputs.get(track_index).copied().unwrap_or(false)
    }
}
