use crate::chord::{MidiChord, MidiObject, MidiRest};
use crate::model::{
    InputNote, InputNoteEvent, KeyRange, ObjectContent, OutputTrack, ScoreData, ScoreError,
    TrackSelection,
};
use crate::options::{ControlTarget, ControllerKind, TrkOptions};
use crate::seq::Seq;
use crate::trk::Trk;
use maestro_ports::types::{MsDuration, MsPosition};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NoteKind {
    On,
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlAssignment {
    pub kind: ControllerKind,
    pub track_index: usize,
    pub target: ControlTarget,
}

/// What happens when the performer sounds (or releases) a notated key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteEvent {
    pub notated_key: u8,
    pub seq: Option<Seq>,
    pub trk_offs: Vec<usize>,
    pub controls: Vec<ControlAssignment>,
}

impl NoteEvent {
    fn build(
        notated_key: u8,
        def: &InputNoteEvent,
        position: MsPosition,
        output_objects: &[Vec<MidiObject>],
        selection: &TrackSelection,
        note_options: Option<&TrkOptions>,
        chord_options: Option<&TrkOptions>,
    ) -> Self {
        let seq = def
            .seq
            .as_ref()
            .map(|seq| {
                Seq::build(
                    seq,
                    position,
                    output_objects,
                    selection,
                    note_options,
                    chord_options,
                )
            })
            .filter(|seq| !seq.is_empty());

        let trk_offs = def
            .trk_offs
            .iter()
            .copied()
            .filter(|track_index| selection.output_enabled(*track_index))
            .collect();

        let controls = def
            .controls()
            .filter(|(_, control)| selection.output_enabled(control.track_index))
            .map(|(kind, control)| ControlAssignment {
                kind,
                track_index: control.track_index,
                target: control.target,
            })
            .collect();

        Self {
            notated_key,
            seq,
            trk_offs,
            controls,
        }
    }
}

/// Every note event at one score position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instant {
    pub position_in_score: MsPosition,
    pub note_ons: Vec<NoteEvent>,
    pub note_offs: Vec<NoteEvent>,
}

impl Instant {
    fn new(position_in_score: MsPosition) -> Self {
        Self {
            position_in_score,
            note_ons: Vec::new(),
            note_offs: Vec::new(),
        }
    }

    pub fn events(&self, kind: NoteKind) -> &[NoteEvent] {
        match kind {
            NoteKind::On => &self.note_ons,
            NoteKind::Off => &self.note_offs,
        }
    }
}

/// Points at one note event inside the schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    pub instant: usize,
    pub kind: NoteKind,
    pub event: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct KeyQueue {
    entries: Vec<KeyEntry>,
    next: usize,
}

impl KeyQueue {
    fn peek(&self) -> Option<KeyEntry> {
        self.entries.get(self.next).copied()
    }
}

/// Per notated key, the ordered events that key fires plus a read cursor.
///
/// At one instant a key's note-offs come before its note-ons.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyIndex {
    range: KeyRange,
    keys: Vec<KeyQueue>,
}

impl KeyIndex {
    fn build(range: KeyRange, instants: &[Instant]) -> Self {
        let mut keys = vec![KeyQueue::default(); range.len()];
        for (instant_index, instant) in instants.iter().enumerate() {
            for kind in [NoteKind::Off, NoteKind::On] {
                for (event_index, event) in instant.events(kind).iter().enumerate() {
                    if let Some(queue) = Self::slot(range, &mut keys, event.notated_key) {
                        queue.entries.push(KeyEntry {
                            instant: instant_index,
                            kind,
                            event: event_index,
                        });
                    }
                }
            }
        }
        Self { range, keys }
    }

    fn slot(range: KeyRange, keys: &mut [KeyQueue], key: u8) -> Option<&mut KeyQueue> {
        if !range.contains(key) {
            return None;
        }
        keys.get_mut(usize::from(key - range.bottom))
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn peek(&self, key: u8) -> Option<KeyEntry> {
        if !self.range.contains(key) {
            return None;
        }
        self.keys
            .get(usize::from(key - self.range.bottom))
            .and_then(KeyQueue::peek)
    }

    /// Consumes the key's next unconsumed event.
    pub fn take_next(&mut self, key: u8) -> Option<KeyEntry> {
        let queue = Self::slot(self.range, &mut self.keys, key)?;
        let entry = queue.peek()?;
        queue.next += 1;
        Some(entry)
    }

    /// Consumes every key's pending events scheduled before `instant`, lowest key first.
    pub fn consume_before(&mut self, instant: usize) -> Vec<KeyEntry> {
        let mut consumed = Vec::new();
        for queue in &mut self.keys {
            while let Some(entry) = queue.peek().filter(|entry| entry.instant < instant) {
                consumed.push(entry);
                queue.next += 1;
            }
        }
        consumed
    }
}

/// The live-driven timeline for one performance over `[from, to)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    instants: Vec<Instant>,
    keys: KeyIndex,
}

impl Schedule {
    pub fn build(
        score: &ScoreData,
        selection: &TrackSelection,
        from: MsPosition,
        to: MsPosition,
    ) -> Result<Self, ScoreError> {
        score.validate()?;
        let output_objects = build_output_objects(&score.output_tracks, selection)?;

        let mut performed: BTreeMap<MsPosition, Vec<PerformedNote<'_>>> = BTreeMap::new();
        for (track_index, track) in score.input_tracks.iter().enumerate() {
            if !selection.input_enabled(track_index) {
                continue;
            }
            let mut previous_options: Option<&TrkOptions> = None;
            for chord in &track.chords {
                let chord_options = chord.trk_options.as_ref().or(previous_options);
                previous_options = chord_options;

                if chord.position < from || chord.position >= to {
                    continue;
                }
                let notes = chord
                    .notes
                    .iter()
                    .filter(|note| uses_enabled_track(note, selection))
                    .map(|note| PerformedNote {
                        note,
                        chord_options,
                        duration: chord.duration,
                    });
                performed.entry(chord.position).or_default().extend(notes);
            }
        }

        let mut instants: BTreeMap<MsPosition, Instant> = BTreeMap::new();
        for (position, notes) in performed {
            for PerformedNote {
                note,
                chord_options,
                duration,
            } in notes
            {
                let note_options = note.trk_options.as_ref();
                if let Some(def) = note.note_on.as_ref() {
                    let event = NoteEvent::build(
                        note.notated_key,
                        def,
                        position,
                        &output_objects,
                        selection,
                        note_options,
                        chord_options,
                    );
                    instant_at(&mut instants, position).note_ons.push(event);
                }
                if let Some(def) = note.note_off.as_ref() {
                    let off_position = position + duration;
                    let event = NoteEvent::build(
                        note.notated_key,
                        def,
                        off_position,
                        &output_objects,
                        selection,
                        note_options,
                        chord_options,
                    );
                    instant_at(&mut instants, off_position).note_offs.push(event);
                }
            }
        }

        let instants: Vec<Instant> = instants.into_values().collect();
        let keys = KeyIndex::build(score.key_range, &instants);
        Ok(Self { instants, keys })
    }

    pub fn instants(&self) -> &[Instant] {
        &self.instants
    }

    pub fn instant(&self, index: usize) -> Option<&Instant> {
        self.instants.get(index)
    }

    pub fn len(&self) -> usize {
        self.instants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instants.is_empty()
    }

    pub fn event(&self, entry: KeyEntry) -> Option<&NoteEvent> {
        self.instants
            .get(entry.instant)
            .and_then(|instant| instant.events(entry.kind).get(entry.event))
    }

    pub fn keys(&self) -> &KeyIndex {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyIndex {
        &mut self.keys
    }

    /// Moves every trk out in score order (note-offs before note-ons at an instant).
    pub fn drain_trks(&mut self) -> Vec<Trk> {
        let mut trks = Vec::new();
        for instant in &mut self.instants {
            let events = instant.note_offs.iter_mut().chain(instant.note_ons.iter_mut());
            for seq in events.filter_map(|event| event.seq.as_mut()) {
                trks.extend(seq.drain_trks());
            }
        }
        trks
    }
}

struct PerformedNote<'a> {
    note: &'a InputNote,
    chord_options: Option<&'a TrkOptions>,
    duration: MsDuration,
}

fn uses_enabled_track(note: &InputNote, selection: &TrackSelection) -> bool {
    note.events()
        .flat_map(|event| event.track_indices())
        .any(|track_index| selection.output_enabled(track_index))
}

fn instant_at(instants: &mut BTreeMap<MsPosition, Instant>, position: MsPosition) -> &mut Instant {
    instants
        .entry(position)
        .or_insert_with(|| Instant::new(position))
}

/// Builds the runtime objects of every enabled output track. Disabled tracks stay empty.
pub fn build_output_objects(
    output_tracks: &[OutputTrack],
    selection: &TrackSelection,
) -> Result<Vec<Vec<MidiObject>>, ScoreError> {
    output_tracks
        .iter()
        .enumerate()
        .map(|(track_index, track)| {
            if !selection.output_enabled(track_index) {
                return Ok(Vec::new());
            }
            track
                .objects
                .iter()
                .map(|def| match &def.content {
                    ObjectContent::Chord(chord) => {
                        MidiChord::new(track.midi_channel, chord, def.position, def.duration)
                            .map(MidiObject::Chord)
                    }
                    ObjectContent::SilentChord => Ok(MidiObject::Chord(MidiChord::silent(
                        def.position,
                        def.duration,
                    ))),
                    ObjectContent::Rest => {
                        Ok(MidiObject::Rest(MidiRest::new(def.position, def.duration)))
                    }
                })
                .collect()
        })
        .collect()
}
