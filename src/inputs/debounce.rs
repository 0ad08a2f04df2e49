use std::time::{Duration, Instant};

/// Stability filter turning a noisy boolean signal into a confirmed level.
///
/// A raw level is confirmed only once it has been observed continuously for
/// `stability_threshold`. Every new raw value restarts the hold timer, so short
/// glitches and oscillations never reach the confirmed output. A zero threshold
/// confirms every change immediately.
#[derive(Debug, Clone)]
pub struct DebounceFilter {
    stability_threshold: Duration,
    raw_level: bool,
    confirmed_level: bool,
    pending_since: Instant,
}

impl DebounceFilter {
    /// Starts with both raw and confirmed level low.
    pub fn new(stability_threshold: Duration, now: Instant) -> Self {
        Self {
            stability_threshold,
            raw_level: false,
            confirmed_level: false,
            pending_since: now,
        }
    }

    /// Feeds one raw sample. Returns the new confirmed level when it changes.
    pub fn observe(&mut self, raw: bool, now: Instant) -> Option<bool> {
        if raw != self.raw_level {
            self.raw_level = raw;
            self.pending_since = now;
        }

        if raw == self.confirmed_level {
            return None;
        }

        let held_for = now.saturating_duration_since(self.pending_since);
        if held_for >= self.stability_threshold {
            self.confirmed_level = raw;
            Some(raw)
        } else {
            None
        }
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(t0: Instant, s: f64) -> Instant {
        t0 + Duration::from_secs_f64(s)
    }

    #[test]
    fn zero_threshold_confirms_immediately() {
        let t0 = Instant::now();
        let mut filter = DebounceFilter::new(Duration::ZERO, t0);

        assert_eq!(filter.observe(true, t0), Some(true));
        assert_eq!(filter.observe(true, t0), None);
        assert_eq!(filter.observe(false, t0), Some(false));
    }

    #[test]
    fn short_pulse_never_confirms() {
        let t0 = Instant::now();
        let mut filter = DebounceFilter::new(Duration::from_secs(2), t0);

        assert_eq!(filter.observe(true, secs(t0, 0.0)), None);
        assert_eq!(filter.observe(true, secs(t0, 1.9)), None);
        assert_eq!(filter.observe(false, secs(t0, 1.95)), None);
        assert_eq!(filter.observe(false, secs(t0, 10.0)), None);
        assert!(!filter.confirmed());
    }

    #[test]
    fn oscillation_restarts_hold_timer() {
        // 0->1 at 0s, back to 0 at 2s, 1 again at 3s and held: confirmation at 9s
        let t0 = Instant::now();
        let mut filter = DebounceFilter::new(Duration::from_secs(6), t0);
        let mut confirmed_at = None;

        for ms in (0..=15_000u64).step_by(100) {
            let raw = !(2_000..3_000).contains(&ms);
            if let Some(level) = filter.observe(raw, t0 + Duration::from_millis(ms)) {
                assert!(level);
                confirmed_at.get_or_insert(ms);
            }
        }

        assert_eq!(confirmed_at, Some(9_000));
    }

    #[test]
    fn confirmed_output_only_reflects_sustained_runs() {
        // runs of (level, duration in ms); threshold 500ms
        let runs = [
            (true, 100),
            (false, 200),
            (true, 499),
            (false, 700),
            (true, 900),
            (false, 300),
            (true, 100),
        ];
        let t0 = Instant::now();
        let mut filter = DebounceFilter::new(Duration::from_millis(500), t0);
        let mut changes = Vec::new();
        let mut elapsed = 0u64;

        for (level, length) in runs {
            let end = elapsed + length;
            let mut t = elapsed;
            while t < end {
                if let Some(c) = filter.observe(level, t0 + Duration::from_millis(t)) {
                    changes.push(c);
                }
                t += 10;
            }
            elapsed = end;
        }

        // the 900ms high run is the only sustained departure from low
        assert_eq!(changes, vec![true]);
        assert!(filter.confirmed());
    }

    #[test]
    fn returning_to_confirmed_level_cancels_pending_change() {
        let t0 = Instant::now();
        let mut filter = DebounceFilter::new(Duration::from_secs(1), t0);

        assert_eq!(filter.observe(true, secs(t0, 0.0)), None);
        assert_eq!(filter.observe(false, secs(t0, 0.5)), None);
        assert_eq!(filter.observe(false, secs(t0, 5.0)), None);
        assert_eq!(filter.observe(true, secs(t0, 5.5)), None);
        assert_eq!(filter.observe(true, secs(t0, 6.4)), None);
        assert_eq!(filter.observe(true, secs(t0, 6.5)), Some(true));
    }
}
