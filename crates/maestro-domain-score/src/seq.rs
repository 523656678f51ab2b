use crate::chord::MidiObject;
use crate::model::{SeqDef, TrackSelection};
use crate::options::TrkOptions;
use crate::trk::Trk;
use maestro_ports::types::MsPosition;

/// Trks that start together when one live note event fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seq {
    pub position_in_score: MsPosition,
    /// One slot per output track; `None` for tracks that take no part.
    trks: Vec<Option<Trk>>,
    track_indices: Vec<usize>,
}

impl Seq {
    /// `note_options` and `chord_options` are the lower-precedence layers
    /// below each trk's and the seq's own options.
    pub fn build(
        def: &SeqDef,
        position_in_score: MsPosition,
        output_objects: &[Vec<MidiObject>],
        selection: &TrackSelection,
        note_options: Option<&TrkOptions>,
        chord_options: Option<&TrkOptions>,
    ) -> Self {
        let mut trks: Vec<Option<Trk>> = vec![None; output_objects.len()];

        for trk_def in &def.trks {
            let track_index = trk_def.track_index;
            if !selection.output_enabled(track_index) {
                continue;
            }
            let Some(objects) = output_objects
                .get(track_index)
                .and_then(|objects| objects.get(trk_def.objects.clone()))
            else {
                continue;
            };

            let options = TrkOptions::resolve([
                trk_def.trk_options.as_ref(),
                def.trk_options.as_ref(),
                note_options,
                chord_options,
            ]);
            trks[track_index] = Some(Trk::from_objects(
                track_index,
                position_in_score,
                objects,
                options,
            ));
        }

        let track_indices = trks
            .iter()
            .enumerate()
            .filter_map(|(index, trk)| trk.as_ref().map(|_| index))
            .collect();

        Self {
            position_in_score,
            trks,
            track_indices,
        }
    }

    /// Tracks whose workers this seq starts, in track order.
    pub fn track_indices(&self) -> &[usize] {
        &self.track_indices
    }

    pub fn is_empty(&self) -> bool {
        self.track_indices.is_empty()
    }

    pub fn trk(&self, track_index: usize) -> Option<&Trk> {
        self.trks.get(track_index).and_then(Option::as_ref)
    }

    /// Moves the trks out; track indices stay so the seq can still be started.
    pub fn drain_trks(&mut self) -> impl Iterator<Item = Trk> + '_ {
        self.trks.iter_mut().filter_map(Option::take)
    }
}
