use std::time::Duration;

// ── FadeEnvelope ──────────────────────────────────────────────────────────────

/// Linear gain ramp stepped once per produced sample.
///
/// Fades here are a few milliseconds long (3 ms in, 15 ms out), short enough
/// that curve shape is inaudible, so the ramp is a straight line and the hot
/// path is a single add.
///
/// **Stepped on the real-time audio thread: no allocations.**
#[derive(Debug, Clone)]
pub struct FadeEnvelope {
    sample_rate: u32,
    current_gain: f32,
    target_gain: f32,
    gain_delta: f32,
    samples_to_target: u64,
    sample_counter: u64,
}

impl FadeEnvelope {
    /// Idle envelope at unity gain, clocked at `sample_rate` steps per second.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            current_gain: 1.0,
            target_gain: 1.0,
            gain_delta: 0.0,
            samples_to_target: 0,
            sample_counter: 0,
        }
    }

    /// Ramp 0 → 1 over `duration`.
    pub fn start_fade_in(&mut self, duration: Duration) {
        self.current_gain = 0.0;
        self.retarget(1.0, duration);
    }

    /// Ramp from wherever the gain currently is down to 0 over `duration`.
    /// Starting mid fade-in is continuous.
    pub fn start_fade_out(&mut self, duration: Duration) {
        self.retarget(0.0, duration);
    }

    fn retarget(&mut self, target: f32, duration: Duration) {
        self.target_gain = target;
        self.samples_to_target = self.samples_for(duration);
        self.gain_delta = (self.target_gain - self.current_gain) / self.samples_to_target as f32;
        self.sample_counter = 0;
    }

    /// `round(secs * rate)`, never less than one step.
    fn samples_for(&self, duration: Duration) -> u64 {
        let n = (duration.as_secs_f64() * self.sample_rate as f64).round() as u64;
        n.max(1)
    }

    /// Advance one sample and return the gain to apply to it.
    #[inline]
    pub fn next_sample(&mut self) -> f32 {
        if self.sample_counter < self.samples_to_target {
            self.current_gain += self.gain_delta;
            self.sample_counter += 1;
            if self.sample_counter == self.samples_to_target {
                // Float accumulation lands close to, not on, the target.
                self.current_gain = self.target_gain;
            }
        } else {
            self.current_gain = self.target_gain;
        }
        self.current_gain = self.current_gain.clamp(0.0, 1.0);
        self.current_gain
    }

    pub fn is_complete(&self) -> bool {
        self.sample_counter >= self.samples_to_target
    }

    pub fn is_fading_out(&self) -> bool {
        self.target_gain < self.current_gain && !self.is_complete()
    }

    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    pub fn target_gain(&self) -> f32 {
        self.target_gain
    }

    /// Back to idle unity gain.
    pub fn reset(&mut self) {
        *self = Self::new(self.sample_rate);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 96_000;

    #[test]
    fn new_envelope_is_idle_at_unity() {
        let mut env = FadeEnvelope::new(RATE);
        assert!(env.is_complete());
        assert_eq!(env.next_sample(), 1.0);
    }

    #[test]
    fn fade_in_is_monotonic_and_reaches_unity() {
        let mut env = FadeEnvelope::new(RATE);
        let d = Duration::from_millis(3);
        env.start_fade_in(d);
        let steps = (d.as_secs_f64() * RATE as f64).round() as usize;

        let mut prev = 0.0_f32;
        for i in 0..steps {
            let g = env.next_sample();
            assert!(g >= prev, "fade-in decreased at step {i}: {prev} -> {g}");
            prev = g;
        }
        assert_eq!(prev, 1.0, "gain should be exactly 1.0 after {steps} samples");
        assert!(env.is_complete());
        for _ in 0..100 {
            assert_eq!(env.next_sample(), 1.0);
        }
    }

    #[test]
    fn fade_out_is_monotonic_and_reaches_silence() {
        let mut env = FadeEnvelope::new(RATE);
        let d = Duration::from_millis(15);
        env.start_fade_out(d);
        assert!(env.is_fading_out());
        let steps = (d.as_secs_f64() * RATE as f64).round() as usize;

        let mut prev = 1.0_f32;
        for i in 0..steps {
            let g = env.next_sample();
            assert!(g <= prev, "fade-out increased at step {i}: {prev} -> {g}");
            prev = g;
        }
        assert_eq!(prev, 0.0);
        assert!(env.is_complete());
        assert_eq!(env.next_sample(), 0.0);
    }

    #[test]
    fn fade_out_from_partial_fade_in_is_continuous() {
        let mut env = FadeEnvelope::new(1000);
        env.start_fade_in(Duration::from_millis(10)); // 10 steps of 0.1
        for _ in 0..5 {
            env.next_sample();
        }
        let before = env.current_gain();
        assert!((before - 0.5).abs() < 1e-5);

        env.start_fade_out(Duration::from_millis(10));
        let first = env.next_sample();
        assert!(first < before);
        assert!((before - first - 0.05).abs() < 1e-5, "step should be 0.05, got {}", before - first);
    }

    #[test]
    fn zero_duration_completes_in_one_step() {
        let mut env = FadeEnvelope::new(RATE);
        env.start_fade_in(Duration::ZERO);
        assert!(!env.is_complete());
        assert_eq!(env.next_sample(), 1.0);
        assert!(env.is_complete());
    }

    #[test]
    fn sample_count_rounds_to_nearest() {
        let mut env = FadeEnvelope::new(1000);
        // 2.6 ms at 1 kHz → 3 steps
        env.start_fade_in(Duration::from_micros(2600));
        env.next_sample();
        env.next_sample();
        assert!(!env.is_complete());
        env.next_sample();
        assert!(env.is_complete());
    }

    #[test]
    fn gains_stay_in_unit_range() {
        let mut env = FadeEnvelope::new(RATE);
        env.start_fade_in(Duration::from_millis(1));
        for _ in 0..500 {
            let g = env.next_sample();
            assert!((0.0..=1.0).contains(&g), "gain out of range: {g}");
        }
    }

    #[test]
    fn reset_returns_to_unity() {
        let mut env = FadeEnvelope::new(RATE);
        env.start_fade_out(Duration::from_millis(5));
        env.next_sample();
        env.reset();
        assert!(env.is_complete());
        assert_eq!(env.next_sample(), 1.0);
    }
}
