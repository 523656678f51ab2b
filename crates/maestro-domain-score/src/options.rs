use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PedalOption {
    HoldAll,
    HoldLast,
}

/// How a Trk's written note-on velocities respond to the performed velocity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityOption {
    Scale,
    Shared,
    Override,
}

/// What a worker does when the performer releases the key that started its Trk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteOffPolicy {
    /// Finish the current chord or rest, stop at the next boundary.
    StopChord,
    /// Drop every unsent Moment.
    StopNow,
    /// Ramp note-on velocities to zero over the remaining Moments.
    Fade,
    /// No defined behavior yet; treated as `Ignore`.
    ShortFade,
    Ignore,
}

/// The live controllers a performer can move while playing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    Pressure,
    PitchWheel,
    ModWheel,
}

impl ControllerKind {
    pub fn default_target(self) -> ControlTarget {
        match self {
            ControllerKind::Pressure => ControlTarget::ChannelPressure,
            ControllerKind::PitchWheel => ControlTarget::PitchWheel,
            ControllerKind::ModWheel => ControlTarget::ModWheel,
        }
    }
}

/// Where a worker sends a live controller value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlTarget {
    Disabled,
    ChannelPressure,
    PitchWheel,
    ModWheel,
    Volume { min: u8, max: u8 },
    Expression,
    Pan,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrkOptions {
    pub pedal: Option<PedalOption>,
    pub velocity: Option<VelocityOption>,
    pub min_velocity: Option<u8>,
    pub note_off: Option<NoteOffPolicy>,
    pub let_sound: Option<bool>,
}

impl TrkOptions {
    /// Field-wise: values set on `self` win over `fallback`.
    pub fn or(&self, fallback: &TrkOptions) -> TrkOptions {
        TrkOptions {
            pedal: self.pedal.or(fallback.pedal),
            velocity: self.velocity.or(fallback.velocity),
            min_velocity: self.min_velocity.or(fallback.min_velocity),
            note_off: self.note_off.or(fallback.note_off),
            let_sound: self.let_sound.or(fallback.let_sound),
        }
    }

    /// Resolves layers ordered from highest to lowest precedence
    /// (trk, seq, note, chord).
    pub fn resolve<'a, I>(layers: I) -> TrkOptions
    where
        I: IntoIterator<Item = Option<&'a TrkOptions>>,
    {
        layers
            .into_iter()
            .flatten()
            .fold(TrkOptions::default(), |resolved, layer| resolved.or(layer))
    }

    pub fn note_off_policy(&self) -> NoteOffPolicy {
        self.note_off.unwrap_or(NoteOffPolicy::Ignore)
    }

    pub fn lets_sound(&self) -> bool {
        self.let_sound.unwrap_or(false)
    }
}
