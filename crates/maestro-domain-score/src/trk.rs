use crate::chord::MidiObject;
use crate::moment::Moment;
use crate::options::TrkOptions;
use maestro_ports::midi::Message;
use maestro_ports::types::{MsDuration, MsPosition};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrkMoment {
    pub position_in_seq: MsPosition,
    pub messages: Vec<Message>,
    pub is_first_moment_in_object: bool,
    pub chord_start: bool,
    pub rest_start: bool,
    /// Leading messages absorbed from the previous object (its chord-off).
    pub prelude_len: usize,
}

impl TrkMoment {
    fn from_moment(moment: &Moment, object_offset: MsPosition) -> Self {
        Self {
            position_in_seq: object_offset + moment.position,
            messages: moment.messages.clone(),
            is_first_moment_in_object: moment.position == 0,
            chord_start: moment.chord_start,
            rest_start: moment.rest_start,
            prelude_len: 0,
        }
    }

    pub fn is_boundary(&self) -> bool {
        self.chord_start || self.rest_start
    }

    /// What must still be sent when playback stops at this boundary.
    pub fn prelude(&self) -> &[Message] {
        &self.messages[..self.prelude_len.min(self.messages.len())]
    }

    fn absorb(&mut self, other: TrkMoment) {
        if other.is_boundary() && !self.is_boundary() {
            self.prelude_len = self.messages.len();
        }
        self.messages.extend(other.messages);
        self.is_first_moment_in_object |= other.is_first_moment_in_object;
        self.chord_start |= other.chord_start;
        self.rest_start |= other.rest_start;
    }
}

/// A repeating chord at the end of a Trk: moments `first..end` loop every `period`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrkLoop {
    pub first: usize,
    pub end: usize,
    pub period: MsDuration,
}

/// One output track's slice of a Seq.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trk {
    pub track_index: usize,
    pub position_in_score: MsPosition,
    pub moments: Vec<TrkMoment>,
    pub options: TrkOptions,
    pub repeat: Option<TrkLoop>,
}

impl Trk {
    pub fn from_objects(
        track_index: usize,
        seq_position: MsPosition,
        objects: &[MidiObject],
        options: TrkOptions,
    ) -> Self {
        let mut moments = Vec::new();
        let mut repeat = None;

        for (index, object) in objects.iter().enumerate() {
            let offset = object.position_in_score() - seq_position;
            let mut first = None;
            for moment in object.moments() {
                if push_moment(&mut moments, TrkMoment::from_moment(moment, offset)) {
                    first.get_or_insert(moments.len() - 1);
                }
            }

            // Only a trailing repeating chord can loop: nothing would follow it.
            if index + 1 == objects.len() {
                if let (Some(period), Some(first)) = (object.repeat_period(), first) {
                    repeat = Some(TrkLoop {
                        first,
                        end: moments.len(),
                        period,
                    });
                }
            }

            if let Some(final_off) = object.final_off_moment() {
                push_moment(&mut moments, TrkMoment::from_moment(final_off, offset));
            }
        }

        Self {
            track_index,
            position_in_score: seq_position,
            moments,
            options,
            repeat,
        }
    }

    pub fn len(&self) -> usize {
        self.moments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moments.is_empty()
    }
}

/// Returns false when the moment was dropped.
fn push_moment(moments: &mut Vec<TrkMoment>, moment: TrkMoment) -> bool {
    if moment.messages.is_empty() && !moment.is_boundary() {
        return false;
    }
    match moments.last_mut() {
        Some(last) if moment.position_in_seq <= last.position_in_seq => last.absorb(moment),
        _ => moments.push(moment),
    }
    true
}

/// Playback position inside a Trk, including the offset of a looping tail.
#[derive(Clone, Debug)]
pub struct TrkCursor {
    trk: Trk,
    index: usize,
    loop_offset: MsPosition,
    looping: bool,
}

impl TrkCursor {
    pub fn new(trk: Trk) -> Self {
        let looping = trk.repeat.is_some();
        Self {
            trk,
            index: 0,
            loop_offset: 0,
            looping,
        }
    }

    pub fn trk(&self) -> &Trk {
        &self.trk
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The pending moment and its position in the seq.
    pub fn current(&self) -> Option<(MsPosition, &TrkMoment)> {
        self.trk
            .moments
            .get(self.index)
            .map(|moment| (moment.position_in_seq + self.loop_offset, moment))
    }

    pub fn advance(&mut self) {
        self.index += 1;
        if let Some(repeat) = self.trk.repeat.filter(|_| self.looping) {
            if self.index == repeat.end {
                self.index = repeat.first;
                self.loop_offset += repeat.period;
            }
        }
    }

    /// Moments left to send, counting the pending one. A looping tail counts once.
    pub fn remaining(&self) -> usize {
        self.trk.len().saturating_sub(self.index)
    }

    pub fn stop_looping(&mut self) {
        self.looping = false;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::{BasicChordDef, ChordAttributes, ChordDefinition, MidiChord, MidiRest};
    use pretty_assertions::assert_eq;

    fn chord(position: MsPosition, duration: MsDuration, note: u8, repeat: bool) -> MidiObject {
        let def = ChordDefinition {
            attributes: ChordAttributes {
                repeat,
                ..Default::default()
            },
            basic_chords: Some(vec![BasicChordDef {
                ms_duration: duration / 2,
                notes: vec![note],
                velocities: vec![90],
                bank: None,
                patch: None,
                has_chord_off: Some(false),
            }]),
            sliders: None,
        };
        MidiObject::Chord(MidiChord::new(0, &def, position, duration).unwrap())
    }

    #[test]
    fn chord_off_is_absorbed_as_prelude_of_next_chord() {
        let objects = vec![chord(1000, 200, 60, false), chord(1200, 200, 62, false)];

        let trk = Trk::from_objects(0, 1000, &objects, TrkOptions::default());

        let positions: Vec<_> = trk.moments.iter().map(|m| m.position_in_seq).collect();
        assert_eq!(positions, vec![0, 200, 400]);
        let boundary = &trk.moments[1];
        assert!(boundary.chord_start);
        assert_eq!(boundary.prelude(), &[Message::note_off(0, 60, 127)]);
        assert_eq!(
            boundary.messages,
            vec![Message::note_off(0, 60, 127), Message::note_on(0, 62, 90)]
        );
    }

    #[test]
    fn empty_rest_moment_is_kept_as_boundary() {
        let objects = vec![
            chord(0, 100, 60, false),
            MidiObject::Rest(MidiRest::new(100, 100)),
        ];

        let trk = Trk::from_objects(0, 0, &objects, TrkOptions::default());

        assert_eq!(trk.len(), 2);
        assert!(trk.moments[1].rest_start);
        assert_eq!(trk.moments[1].prelude_len, 1);
    }

    #[test]
    fn cursor_loops_trailing_repeating_chord() {
        let objects = vec![chord(0, 100, 60, true)];
        let trk = Trk::from_objects(0, 0, &objects, TrkOptions::default());
        assert_eq!(
            trk.repeat,
            Some(TrkLoop {
                first: 0,
                end: 1,
                period: 50
            })
        );

        let mut cursor = TrkCursor::new(trk);
        cursor.advance();
        assert_eq!(cursor.current().map(|(position, _)| position), Some(50));
        cursor.advance();
        assert_eq!(cursor.current().map(|(position, _)| position), Some(100));

        cursor.stop_looping();
        cursor.advance();
        assert_eq!(cursor.current().map(|(position, _)| position), Some(200));
        cursor.advance();
        assert!(cursor.current().is_none());
    }
}
