use maestro_ports::types::MsPosition;
use std::time::{Duration, Instant};

pub const MIN_SPEED_FACTOR: f64 = 0.1;

/// Maps a running Trk's seq positions to real time.
///
/// A speed change rebases the anchor at the current position, so the
/// schedule never jumps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrkClock {
    anchor: Instant,
    anchor_position: f64,
    speed_factor: f64,
}

impl TrkClock {
    pub fn start(now: Instant, speed_factor: f64) -> Self {
        Self {
            anchor: now,
            anchor_position: 0.0,
            speed_factor: clamp_speed_factor(speed_factor),
        }
    }

    pub fn speed_factor(&self) -> f64 {
        self.speed_factor
    }

    pub fn due_at(&self, position: MsPosition) -> Instant {
        let real_ms = (position as f64 - self.anchor_position) / self.speed_factor;
        if real_ms <= 0.0 {
            return self.anchor;
        }
        self.anchor + Duration::from_micros((real_ms * 1000.0).round() as u64)
    }

    pub fn position_at(&self, now: Instant) -> f64 {
        let elapsed_ms = now.saturating_duration_since(self.anchor).as_secs_f64() * 1000.0;
        self.anchor_position + elapsed_ms * self.speed_factor
    }

    pub fn set_speed_factor(&mut self, now: Instant, speed_factor: f64) {
        self.anchor_position = self.position_at(now);
        self.anchor = now;
        self.speed_factor = clamp_speed_factor(speed_factor);
    }
}

pub fn clamp_speed_factor(speed_factor: f64) -> f64 {
    if speed_factor.is_finite() {
        speed_factor.max(MIN_SPEED_FACTOR)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn double_speed_halves_real_offsets() {
        let start = Instant::now();
        let clock = TrkClock::start(start, 2.0);

        assert_eq!(clock.due_at(0), start);
        assert_eq!(clock.due_at(100), start + Duration::from_millis(50));
        assert_eq!(clock.due_at(250), start + Duration::from_millis(125));
    }

    #[test]
    fn speed_change_keeps_current_position() {
        let start = Instant::now();
        let mut clock = TrkClock::start(start, 1.0);
        let later = start + Duration::from_millis(100);

        clock.set_speed_factor(later, 0.5);

        assert_eq!(clock.due_at(100), later);
        assert_eq!(clock.due_at(150), later + Duration::from_millis(100));
    }

    #[test]
    fn speed_factor_is_clamped() {
        let clock = TrkClock::start(Instant::now(), 0.0);
        assert_eq!(clock.speed_factor(), MIN_SPEED_FACTOR);
        assert_eq!(clamp_speed_factor(f64::NAN), 1.0);
    }
}
