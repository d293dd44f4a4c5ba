use rand::Rng;
use std::cmp::min;
use std::time::Duration;

/// Exponential backoff between failed rounds.
pub struct Backoff {
    max: Duration,
    v: Duration,
    initial: Duration,
}

/// Picks a wait within `[duration / 2, duration]`.
fn apply_jitter(duration: Duration) -> Duration {
    let micros = duration.as_micros() as u64;
    Duration::from_micros(rand::rng().random_range(micros / 2..=micros))
}

impl Backoff {
    /// Creates a backoff starting at `initial` and doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        assert!(initial <= max);
        Backoff { max, v: initial, initial }
    }

    /// Resets the backoff to the initial backoff.
    pub fn reset(&mut self) {
        self.v = self.initial;
    }

    pub fn next_wait(&mut self) -> Duration {
        let v = self.v;
        self.v = min(v * 2, self.max);
        apply_jitter(v)
    }
}
