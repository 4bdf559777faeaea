use std::time::{Duration, Instant};

use rand::Rng;

use crate::firestore::settings::BackoffSettings;

/// Delay schedule for reconnecting a stream.
///
/// The first attempt after a reset goes out immediately. Each later attempt
/// waits for the current base delay (plus or minus `jitter_factor` of it),
/// after which the base grows by `backoff_factor`, starting from
/// `initial_delay` and capped at `max_delay`. Time already spent since the
/// previous attempt counts towards the delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base: Duration,
    last_attempt: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            last_attempt: None,
        }
    }

    /// The next attempt happens without delay.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// The next attempt waits for the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.settings.max_delay;
    }

    /// Returns how long to wait before the next attempt and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base_ms = self.current_base.as_secs_f64() * 1_000.0;
        let jitter_ms = self.settings.jitter_factor * base_ms * rng.gen_range(-1.0..=1.0);
        let desired_ms = (base_ms + jitter_ms).max(0.0);
        let elapsed_ms = self
            .last_attempt
            .map(|at| at.elapsed().as_secs_f64() * 1_000.0)
            .unwrap_or(0.0);
        let remaining_ms = (desired_ms - elapsed_ms).max(0.0).floor();
        if self.current_base > Duration::ZERO {
            log::debug!(
                "Backing off for {remaining_ms} ms (base delay: {base_ms} ms, delay with jitter: {desired_ms} ms)"
            );
        }

        let grown = self.current_base.mul_f64(self.settings.backoff_factor.max(1.0));
        self.current_base = grown
            .max(self.settings.initial_delay)
            .min(self.settings.max_delay);
        self.last_attempt = Some(Instant::now() + Duration::from_millis(remaining_ms as u64));

        Duration::from_millis(remaining_ms as u64)
    }
}
