//! Reconnect backoff and circuit breaker.
//!
//! The policy is a pure state machine: every transition takes the current
//! [`RetryState`], the current instant and (for failures) a jitter sample, and
//! returns the next state. Nothing here sleeps or touches the network; the
//! transport adapters own the timers.

use std::time::{Duration, Instant};

/// Fraction of the nominal delay that jitter may add or remove.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures that trip the circuit.
    pub max_attempts: u32,
    /// How long an open circuit suppresses attempts.
    pub cooldown: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            cooldown: Duration::from_secs(300),
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub current_delay: Duration,
    pub circuit_open: bool,
    pub circuit_opened_at: Option<Instant>,
    /// Set when the cooldown elapsed and a single half-open probe was granted.
    /// Cleared by the next success or failure.
    pub probe_pending: bool,
}

impl RetryPolicy {
    pub fn initial_state(&self) -> RetryState {
        RetryState {
            attempt: 0,
            current_delay: self.base_delay,
            circuit_open: false,
            circuit_opened_at: None,
            probe_pending: false,
        }
    }

    /// Records a failed attempt.
    ///
    /// `jitter` is a sample in `[-1.0, 1.0]`; it is scaled by `jitter_ratio`.
    /// The resulting delay never drops below the previous one and never
    /// exceeds `max_delay`.
    pub fn on_failure(&self, state: &RetryState, now: Instant, jitter: f64) -> RetryState {
        let nominal = self.nominal_delay(state.attempt);
        let factor = 1.0 + jitter.clamp(-1.0, 1.0) * self.jitter_ratio.clamp(0.0, 1.0);
        let jittered = nominal.mul_f64(factor).min(self.max_delay);
        let current_delay = jittered.max(state.current_delay).min(self.max_delay);

        let attempt = state.attempt.saturating_add(1);
        let trips = attempt >= self.max_attempts;

        RetryState {
            attempt,
            current_delay,
            circuit_open: trips || state.circuit_open,
            circuit_opened_at: if trips {
                Some(now)
            } else {
                state.circuit_opened_at
            },
            probe_pending: false,
        }
    }

    /// Records a successful connection.
    pub fn on_success(&self, _state: &RetryState) -> RetryState {
        self.initial_state()
    }

    /// Whether a connection attempt may run now.
    ///
    /// Once the cooldown has elapsed the circuit is cleared and exactly one
    /// probe is granted; further calls return false until that probe reports
    /// back through [`on_success`](Self::on_success) or
    /// [`on_failure`](Self::on_failure).
    pub fn should_attempt(&self, state: &mut RetryState, now: Instant) -> bool {
        if state.probe_pending {
            return false;
        }
        if !state.circuit_open {
            return true;
        }

        let opened_at = state.circuit_opened_at.unwrap_or(now);
        if now.saturating_duration_since(opened_at) < self.cooldown {
            return false;
        }

        state.circuit_open = false;
        state.circuit_opened_at = None;
        state.probe_pending = true;
        true
    }

    /// Remaining cooldown for an open circuit, zero when attempts are allowed.
    pub fn retry_in(&self, state: &RetryState, now: Instant) -> Duration {
        match (state.circuit_open, state.circuit_opened_at) {
            (true, Some(opened_at)) => self
                .cooldown
                .saturating_sub(now.saturating_duration_since(opened_at)),
            (true, None) => self.cooldown,
            _ => Duration::ZERO,
        }
    }

    fn nominal_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// Draws a jitter sample in `[-1.0, 1.0]` from the OS random source.
///
/// Falls back to zero jitter if the random source is unavailable.
pub fn sample_jitter() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return 0.0;
    }
    let value = u64::from_le_bytes(bytes);
    (value as f64 / u64::MAX as f64) * 2.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            cooldown: Duration::from_secs(300),
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    #[test]
    fn first_failure_waits_at_least_base_delay() {
        let policy = policy();
        let state = policy.initial_state();
        let next = policy.on_failure(&state, Instant::now(), -1.0);
        assert_eq!(next.attempt, 1);
        assert_eq!(next.current_delay, policy.base_delay);
        assert!(!next.circuit_open);
    }

    #[test]
    fn delay_doubles_without_jitter() {
        let policy = policy();
        let now = Instant::now();
        let mut state = policy.initial_state();
        let mut delays = Vec::new();
        for _ in 0..4 {
            state = policy.on_failure(&state, now, 0.0);
            delays.push(state.current_delay.as_millis());
        }
        assert_eq!(delays, vec![500, 1000, 2000, 4000]);
    }

    #[test]
    fn success_resets_attempts_and_delay() {
        let policy = policy();
        let now = Instant::now();
        let mut state = policy.initial_state();
        for _ in 0..3 {
            state = policy.on_failure(&state, now, 0.5);
        }
        let reset = policy.on_success(&state);
        assert_eq!(reset.attempt, 0);
        assert_eq!(reset.current_delay, policy.base_delay);
        assert!(!reset.circuit_open);
        assert_eq!(reset.circuit_opened_at, None);
    }

    #[test]
    fn circuit_trips_after_max_attempts_and_grants_single_probe() {
        let policy = policy();
        let start = Instant::now();
        let mut state = policy.initial_state();

        for attempt in 1..=policy.max_attempts {
            assert!(policy.should_attempt(&mut state, start));
            state = policy.on_failure(&state, start, 0.0);
            assert_eq!(state.circuit_open, attempt >= policy.max_attempts);
        }

        let during = start + Duration::from_secs(299);
        assert!(!policy.should_attempt(&mut state, during));
        assert!(state.circuit_open);
        assert_eq!(policy.retry_in(&state, during), Duration::from_secs(1));

        let after = start + policy.cooldown;
        assert!(policy.should_attempt(&mut state, after));
        assert!(!state.circuit_open);
        assert!(!policy.should_attempt(&mut state, after));
        assert!(!policy.should_attempt(&mut state, after + Duration::from_secs(60)));
    }

    #[test]
    fn failed_half_open_probe_reopens_circuit() {
        let policy = policy();
        let start = Instant::now();
        let mut state = policy.initial_state();
        for _ in 0..policy.max_attempts {
            state = policy.on_failure(&state, start, 0.0);
        }

        let after = start + policy.cooldown;
        assert!(policy.should_attempt(&mut state, after));
        state = policy.on_failure(&state, after, 0.0);

        assert!(state.circuit_open);
        assert_eq!(state.circuit_opened_at, Some(after));
        assert!(!policy.should_attempt(&mut state, after + Duration::from_secs(1)));
    }

    #[test]
    fn successful_half_open_probe_closes_circuit() {
        let policy = policy();
        let start = Instant::now();
        let mut state = policy.initial_state();
        for _ in 0..policy.max_attempts {
            state = policy.on_failure(&state, start, 0.0);
        }
        let after = start + policy.cooldown;
        assert!(policy.should_attempt(&mut state, after));
        state = policy.on_success(&state);
        assert!(policy.should_attempt(&mut state, after));
        assert!(policy.should_attempt(&mut state, after));
    }

    #[test]
    fn sampled_jitter_stays_in_range() {
        for _ in 0..64 {
            let sample = sample_jitter();
            assert!((-1.0..=1.0).contains(&sample));
        }
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_bounded(
            jitters in proptest::collection::vec(-1.0f64..=1.0, 1..40),
        ) {
            let policy = policy();
            let now = Instant::now();
            let mut state = policy.initial_state();
            let mut previous = state.current_delay;

            for jitter in jitters {
                state = policy.on_failure(&state, now, jitter);
                prop_assert!(state.current_delay >= previous);
                prop_assert!(state.current_delay <= policy.max_delay);
                previous = state.current_delay;
            }

            let reset = policy.on_success(&state);
            prop_assert_eq!(reset.attempt, 0);
            prop_assert_eq!(reset.current_delay, policy.base_delay);
        }

        #[test]
        fn circuit_only_opens_at_threshold(failures in 0u32..12) {
            let policy = policy();
            let now = Instant::now();
            let mut state = policy.initial_state();
            for _ in 0..failures {
                state = policy.on_failure(&state, now, 0.0);
            }
            prop_assert_eq!(state.circuit_open, failures >= policy.max_attempts);
        }
    }
}
