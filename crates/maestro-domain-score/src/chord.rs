use crate::model::ScoreError;
use crate::moment::Moment;
use maestro_ports::midi::{control, Message};
use maestro_ports::types::{MsDuration, MsPosition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Interval between interpolated slider messages.
pub const SLIDER_MILLISECONDS: MsDuration = 10;

const NOTE_OFF_VELOCITY: u8 = 127;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicChordDef {
    pub ms_duration: MsDuration,
    pub notes: Vec<u8>,
    pub velocities: Vec<u8>,
    #[serde(default)]
    pub bank: Option<u8>,
    #[serde(default)]
    pub patch: Option<u8>,
    #[serde(default)]
    pub has_chord_off: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChordAttributes {
    pub repeat: bool,
    pub has_chord_off: Option<bool>,
    pub bank: Option<u8>,
    pub patch: Option<u8>,
    pub pitch_wheel_deviation: Option<u8>,
}

/// Keyframe arrays (values 0..=127) for the continuous controllers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sliders {
    pub pitch_wheel: Option<Vec<u8>>,
    pub pan: Option<Vec<u8>>,
    pub modulation_wheel: Option<Vec<u8>>,
    pub expression: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChordDefinition {
    #[serde(default)]
    pub attributes: ChordAttributes,
    #[serde(default)]
    pub basic_chords: Option<Vec<BasicChordDef>>,
    #[serde(default)]
    pub sliders: Option<Sliders>,
}

impl ChordAttributes {
    fn has_chord_off(&self) -> bool {
        self.has_chord_off.unwrap_or(true)
    }
}

/// All the messages needed to play one (ornamented) chord.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiChord {
    position_in_score: MsPosition,
    duration_in_score: MsDuration,
    moments: Vec<Moment>,
    final_off_moment: Moment,
    basic_chords_duration: MsDuration,
    repeat: bool,
}

impl MidiChord {
    pub fn new(
        channel: u8,
        chord_def: &ChordDefinition,
        position_in_score: MsPosition,
        duration_in_score: MsDuration,
    ) -> Result<Self, ScoreError> {
        let basic_chords = chord_def
            .basic_chords
            .as_ref()
            .ok_or(ScoreError::MissingBasicChords { position: position_in_score })?;
        if basic_chords.is_empty() {
            return Err(ScoreError::EmptyBasicChords { position: position_in_score });
        }
        for basic_chord in basic_chords {
            if basic_chord.notes.len() != basic_chord.velocities.len() {
                return Err(ScoreError::MismatchedVelocities { position: position_in_score });
            }
            if basic_chord.ms_duration < 0 {
                return Err(ScoreError::NegativeDuration { position: position_in_score });
            }
        }

        let chord_moments = ChordMoments::build(
            channel,
            &chord_def.attributes,
            basic_chords,
            duration_in_score,
        );

        let mut moments = match chord_def.sliders.as_ref() {
            Some(sliders) => {
                let slider_moments =
                    slider_moments(channel, sliders, chord_moments.basic_chords_duration);
                combine_moments(chord_moments.moments, slider_moments)
            }
            None => chord_moments.moments,
        };
        if let Some(first) = moments.first_mut() {
            first.chord_start = true;
        }

        Ok(Self {
            position_in_score,
            duration_in_score,
            moments,
            final_off_moment: chord_moments.final_off_moment,
            basic_chords_duration: chord_moments.basic_chords_duration,
            repeat: chord_def.attributes.repeat,
        })
    }

    /// A chord played by a silent soloist: one empty chord-start Moment, like a rest.
    pub fn silent(position_in_score: MsPosition, duration_in_score: MsDuration) -> Self {
        let mut moment = Moment::new(0);
        moment.chord_start = true;
        Self {
            position_in_score,
            duration_in_score,
            moments: vec![moment],
            final_off_moment: Moment::new(duration_in_score),
            basic_chords_duration: 0,
            repeat: false,
        }
    }

    pub fn position_in_score(&self) -> MsPosition {
        self.position_in_score
    }

    pub fn duration_in_score(&self) -> MsDuration {
        self.duration_in_score
    }

    pub fn moments(&self) -> &[Moment] {
        &self.moments
    }

    /// Sent when the following object begins. Always present, possibly empty.
    pub fn final_off_moment(&self) -> &Moment {
        &self.final_off_moment
    }

    pub fn basic_chords_duration(&self) -> MsDuration {
        self.basic_chords_duration
    }

    pub fn repeats(&self) -> bool {
        self.repeat
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiRest {
    position_in_score: MsPosition,
    duration_in_score: MsDuration,
    moments: Vec<Moment>,
}

impl MidiRest {
    pub fn new(position_in_score: MsPosition, duration_in_score: MsDuration) -> Self {
        let mut moment = Moment::new(0);
        moment.rest_start = true;
        Self {
            position_in_score,
            duration_in_score,
            moments: vec![moment],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MidiObject {
    Chord(MidiChord),
    Rest(MidiRest),
}

impl MidiObject {
    pub fn position_in_score(&self) -> MsPosition {
        match self {
            MidiObject::Chord(chord) => chord.position_in_score,
            MidiObject::Rest(rest) => rest.position_in_score,
        }
    }

    pub fn duration_in_score(&self) -> MsDuration {
        match self {
            MidiObject::Chord(chord) => chord.duration_in_score,
            MidiObject::Rest(rest) => rest.duration_in_score,
        }
    }

    pub fn moments(&self) -> &[Moment] {
        match self {
            MidiObject::Chord(chord) => &chord.moments,
            MidiObject::Rest(rest) => &rest.moments,
        }
    }

    pub fn final_off_moment(&self) -> Option<&Moment> {
        match self {
            MidiObject::Chord(chord) => Some(&chord.final_off_moment),
            MidiObject::Rest(_) => None,
        }
    }

    /// The loop period of a repeating chord.
    pub fn repeat_period(&self) -> Option<MsDuration> {
        match self {
            MidiObject::Chord(chord) if chord.repeat && chord.basic_chords_duration > 0 => {
                Some(chord.basic_chords_duration)
            }
            _ => None,
        }
    }
}

struct ChordMoments {
    moments: Vec<Moment>,
    final_off_moment: Moment,
    basic_chords_duration: MsDuration,
}

impl ChordMoments {
    fn build(
        channel: u8,
        attributes: &ChordAttributes,
        basic_chords: &[BasicChordDef],
        duration_in_score: MsDuration,
    ) -> Self {
        let mut moments = Vec::new();
        if let Some(moment) = attributes_moment(channel, attributes) {
            moments.push(moment);
        }

        let chord_off = attributes.has_chord_off();
        let mut sounded = Vec::new();
        let mut position = 0;
        for basic_chord in basic_chords {
            push_or_merge(&mut moments, basic_chord_on_moment(channel, basic_chord, position));
            sounded.extend_from_slice(&basic_chord.notes);

            position += basic_chord.ms_duration;

            if chord_off && basic_chord.has_chord_off.unwrap_or(true) {
                push_or_merge(&mut moments, basic_chord_off_moment(channel, basic_chord, position));
            }
        }

        let final_off_moment = if chord_off {
            let mut seen = BTreeSet::new();
            let messages = sounded
                .into_iter()
                .filter(|note| seen.insert(*note))
                .map(|note| Message::note_off(channel, note, NOTE_OFF_VELOCITY))
                .collect();
            Moment::with_messages(duration_in_score, messages)
        } else {
            Moment::new(duration_in_score)
        };

        Self {
            moments,
            final_off_moment,
            basic_chords_duration: position,
        }
    }
}

fn attributes_moment(channel: u8, attributes: &ChordAttributes) -> Option<Moment> {
    let mut moment = Moment::new(0);
    if let Some(bank) = attributes.bank {
        moment.push(Message::control_change(channel, control::BANK, bank));
    }
    if let Some(patch) = attributes.patch {
        moment.push(Message::program_change(channel, patch));
    }
    if let Some(deviation) = attributes.pitch_wheel_deviation {
        // RPN 0,0 selects pitch-bend sensitivity for the data entry that follows.
        moment.push(Message::control_change(channel, control::REGISTERED_PARAMETER_COARSE, 0));
        moment.push(Message::control_change(channel, control::REGISTERED_PARAMETER_FINE, 0));
        moment.push(Message::control_change(channel, control::DATA_ENTRY_COARSE, deviation));
    }
    (!moment.is_empty()).then_some(moment)
}

fn basic_chord_on_moment(channel: u8, basic_chord: &BasicChordDef, position: MsPosition) -> Moment {
    let mut moment = Moment::new(position);
    if let Some(bank) = basic_chord.bank {
        moment.push(Message::control_change(channel, control::BANK, bank));
    }
    if let Some(patch) = basic_chord.patch {
        moment.push(Message::program_change(channel, patch));
    }
    for (note, velocity) in basic_chord.notes.iter().zip(&basic_chord.velocities) {
        moment.push(Message::note_on(channel, *note, *velocity));
    }
    moment
}

fn basic_chord_off_moment(
    channel: u8,
    basic_chord: &BasicChordDef,
    position: MsPosition,
) -> Moment {
    let messages = basic_chord
        .notes
        .iter()
        .map(|note| Message::note_off(channel, *note, NOTE_OFF_VELOCITY))
        .collect();
    Moment::with_messages(position, messages)
}

fn push_or_merge(moments: &mut Vec<Moment>, moment: Moment) {
    match moments.last_mut() {
        Some(last) if last.position == moment.position => last.merge(moment),
        _ => moments.push(moment),
    }
}

/// Merges by position; slider messages precede chord messages at equal positions.
fn combine_moments(chord_moments: Vec<Moment>, slider_moments: Vec<Moment>) -> Vec<Moment> {
    let mut combined = Vec::with_capacity(chord_moments.len() + slider_moments.len());
    let mut chords = chord_moments.into_iter().peekable();
    let mut sliders = slider_moments.into_iter().peekable();

    loop {
        let next = match (sliders.peek(), chords.peek()) {
            (Some(slider), Some(chord)) if slider.position <= chord.position => sliders.next(),
            (Some(_), Some(_)) => chords.next(),
            (Some(_), None) => sliders.next(),
            (None, Some(_)) => chords.next(),
            (None, None) => None,
        };
        match next {
            Some(moment) => push_or_merge(&mut combined, moment),
            None => break,
        }
    }

    combined
}

/// Tick positions for sliders across `duration`: at least one tick.
pub fn slider_tick_positions(duration: MsDuration) -> Vec<MsPosition> {
    let duration = duration.max(0);
    let count = (duration / SLIDER_MILLISECONDS).max(1);
    (0..count).map(|tick| tick * duration / count).collect()
}

fn slider_moments(channel: u8, sliders: &Sliders, duration: MsDuration) -> Vec<Moment> {
    let mut ticks: Vec<Moment> = slider_tick_positions(duration)
        .into_iter()
        .map(Moment::new)
        .collect();

    let streams: [(&Option<Vec<u8>>, fn(u8, u8) -> Message); 4] = [
        (&sliders.pitch_wheel, |channel, value| Message::pitch_wheel(channel, 0, value)),
        (&sliders.pan, |channel, value| {
            Message::control_change(channel, control::PAN, value)
        }),
        (&sliders.modulation_wheel, |channel, value| {
            Message::control_change(channel, control::MODWHEEL, value)
        }),
        (&sliders.expression, |channel, value| {
            Message::control_change(channel, control::EXPRESSION, value)
        }),
    ];

    for (keyframes, to_message) in streams {
        let Some(keyframes) = keyframes.as_ref().filter(|values| !values.is_empty()) else {
            continue;
        };
        let values = resample_keyframes(keyframes, ticks.len());
        if values.iter().all(|value| *value == values[0]) {
            continue;
        }
        let mut previous = None;
        for (tick, value) in ticks.iter_mut().zip(values) {
            if previous != Some(value) {
                tick.push(to_message(channel, value));
                previous = Some(value);
            }
        }
    }

    ticks.retain(|tick| !tick.is_empty());
    ticks
}

/// Resamples `keyframes` onto `tick_count` ticks.
///
/// Fewer keyframes than ticks are stretched piecewise-linearly with keyframe `i`
/// anchored at tick `i * N / (L - 1)`; more keyframes than ticks are downsampled,
/// always keeping the first and last keyframe.
pub fn resample_keyframes(keyframes: &[u8], tick_count: usize) -> Vec<u8> {
    let length = keyframes.len();
    if length == 0 || tick_count == 0 {
        return Vec::new();
    }
    if length == 1 {
        return vec![keyframes[0]; tick_count];
    }
    if length == tick_count {
        return keyframes.to_vec();
    }
    if length < tick_count {
        return stretch_keyframes(keyframes, tick_count);
    }

    if tick_count == 1 {
        return vec![keyframes[0]];
    }
    let mut values = Vec::with_capacity(tick_count);
    values.push(keyframes[0]);
    for tick in 1..tick_count - 1 {
        values.push(keyframes[tick * length / tick_count]);
    }
    values.push(keyframes[length - 1]);
    values
}

fn stretch_keyframes(keyframes: &[u8], tick_count: usize) -> Vec<u8> {
    let length = keyframes.len();

    let mut anchors = Vec::with_capacity(length);
    anchors.push(0);
    for index in 1..length - 1 {
        anchors.push(index * tick_count / (length - 1));
    }
    anchors.push(tick_count - 1);

    let mut values = Vec::with_capacity(tick_count);
    for segment in 1..length {
        let (start, end) = (anchors[segment - 1], anchors[segment]);
        let steps = end.saturating_sub(start);
        if steps == 0 {
            continue;
        }
        let from = f64::from(keyframes[segment - 1]);
        let to = f64::from(keyframes[segment]);
        let increment = (to - from) / steps as f64;
        for step in 0..steps {
            let value = from + (increment * step as f64).floor();
            values.push(value.clamp(0.0, 127.0) as u8);
        }
    }
    values.push(keyframes[length - 1]);
    values
}
