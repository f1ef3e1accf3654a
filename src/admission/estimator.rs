//! Decaying per-client load estimator.
//!
//! Each client carries two accumulators: recently consumed upstream service
//! time and the last applied delay. Between two events `dt` apart both fade
//! linearly by `1 - dt / window`, and reset to zero once `dt >= window`.
//!
//! The budget (`cc * quant - cc`) and the smoothing (`(dd + delay) / 2`) are
//! tuned values; keep them as they are.

use tokio::time::Instant;

/// Decay window and target concurrency, in the units the estimator works in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayParams {
    /// Window length in seconds.
    pub window: f64,
    /// Concurrent requests tolerated before delays kick in.
    pub concurrency_target: f64,
}

impl DecayParams {
    /// Seconds of budget per unit of consumed time.
    pub fn quant(&self) -> f64 {
        self.window / self.concurrency_target
    }
}

/// Values computed for one dispatch; they feed the dispatch log line.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DelayEstimate {
    /// Seconds to hold the request before forwarding.
    pub delay: f64,
    /// Faded consumed-time estimate (seconds), zero after a reset.
    pub consumed: f64,
    /// Seconds since the previous event, zero after a reset.
    pub since_last: f64,
}

/// The decaying accumulator pair plus the time of the last event.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecayState {
    last_action: Option<Instant>,
    consumed: f64,
    delay: f64,
}

impl DecayState {
    pub fn consumed(&self) -> f64 {
        self.consumed
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    #[cfg(test)]
    fn last_action(&self) -> Option<Instant> {
        self.last_action
    }

    /// Seconds since the last event, or `None` if there never was one.
    fn since_last(&self, now: Instant) -> Option<f64> {
        self.last_action
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
    }

    /// Faded `(consumed, delay)` at `now`, plus elapsed seconds if still inside the window.
    fn faded(&self, now: Instant, window: f64) -> (f64, f64, Option<f64>) {
        match self.since_last(now) {
            Some(dt) if dt < window => {
                let fading = 1.0 - dt / window;
                (self.consumed * fading, self.delay * fading, Some(dt))
            }
            _ => (0.0, 0.0, None),
        }
    }

    /// Decide how long the request now at the head of the queue should wait.
    ///
    /// Stores the faded consumption (without this round's service time) and
    /// the smoothed delay, and stamps `now` as the last event.
    pub fn compute_delay(&mut self, now: Instant, params: DecayParams) -> DelayEstimate {
        let estimate = match self.faded(now, params.window) {
            (cc, dd, Some(dt)) => {
                let target = cc * params.quant() - cc;
                let raw = if dt > target {
                    0.0
                } else {
                    (target - dt).min(params.window)
                };
                DelayEstimate {
                    delay: (dd + raw) / 2.0,
                    consumed: cc,
                    since_last: dt,
                }
            }
            (_, _, None) => DelayEstimate::default(),
        };

        self.consumed = estimate.consumed;
        self.delay = estimate.delay;
        self.last_action = Some(now);
        estimate
    }

    /// Account for a finished request that started at `action_start`.
    pub fn on_consume(&mut self, now: Instant, action_start: Instant, window: f64) {
        let service = now.saturating_duration_since(action_start).as_secs_f64();
        let (cc, dd, _) = self.faded(now, window);
        self.consumed = cc + service;
        self.delay = dd;
        self.last_action = Some(now);
    }

    /// Whether a client with this state and an empty queue may be forgotten.
    pub fn is_idle(&self, now: Instant, window: f64) -> bool {
        self.since_last(now).map_or(true, |dt| dt > window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const PARAMS: DecayParams = DecayParams {
        window: 12.0,
        concurrency_target: 4.0,
    };

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    // Far enough ahead that subtracting service time never underflows.
    fn base() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn fresh_client_gets_no_delay() {
        let mut state = DecayState::default();
        let estimate = state.compute_delay(Instant::now(), PARAMS);
        assert_eq!(estimate, DelayEstimate::default());
        assert!(state.last_action().is_some());
    }

    #[test]
    fn consumption_fades_linearly_over_window() {
        let t0 = base();
        let mut state = DecayState::default();
        // 10 seconds of service ending at t0.
        state.on_consume(t0, t0 - secs(10.0), PARAMS.window);
        assert!(approx(state.consumed(), 10.0));

        let t1 = t0 + secs(6.0);
        state.on_consume(t1, t1, PARAMS.window);
        assert!(approx(state.consumed(), 5.0));
    }

    #[test]
    fn accumulators_reset_after_full_window() {
        let t0 = base();
        let mut state = DecayState::default();
        state.on_consume(t0, t0 - secs(10.0), PARAMS.window);

        let t1 = t0 + secs(12.0);
        let estimate = state.compute_delay(t1, PARAMS);
        assert_eq!(estimate, DelayEstimate::default());
        assert_eq!(state.consumed(), 0.0);
        assert_eq!(state.delay(), 0.0);
    }

    #[test]
    fn delay_follows_budget_and_smoothing() {
        let t0 = base();
        let mut state = DecayState::default();
        state.on_consume(t0, t0 - secs(10.0), PARAMS.window);

        // cc = 5, quant = 3, target = 10, raw delay = 10 - 6 = 4, smoothed with dd = 0.
        let estimate = state.compute_delay(t0 + secs(6.0), PARAMS);
        assert!(approx(estimate.consumed, 5.0));
        assert!(approx(estimate.since_last, 6.0));
        assert!(approx(estimate.delay, 2.0));
        assert!(approx(state.delay(), 2.0));
        // Consumption is not bumped by a delay computation.
        assert!(approx(state.consumed(), 5.0));
    }

    #[test]
    fn raw_delay_is_capped_at_window() {
        let t0 = base();
        let mut state = DecayState::default();
        state.on_consume(t0, t0 - secs(100.0), PARAMS.window);

        // cc ~ 100, target ~ 200, raw capped at 12, smoothed to 6.
        let estimate = state.compute_delay(t0 + Duration::from_millis(1), PARAMS);
        assert!(estimate.delay <= PARAMS.window / 2.0 + 1e-9);
        assert!(estimate.delay > 5.9);
    }

    #[test]
    fn light_usage_is_not_delayed() {
        let t0 = base();
        let mut state = DecayState::default();
        state.on_consume(t0, t0 - Duration::from_millis(100), PARAMS.window);

        // cc ~ 0.1, target ~ 0.2; one second later dt > target.
        let estimate = state.compute_delay(t0 + secs(1.0), PARAMS);
        assert_eq!(estimate.delay, 0.0);
    }

    #[test]
    fn previous_delay_fades_into_next_estimate() {
        let t0 = base();
        let mut state = DecayState::default();
        state.on_consume(t0, t0 - secs(10.0), PARAMS.window);
        state.compute_delay(t0 + secs(6.0), PARAMS); // dd = 2

        // Three seconds later: fade 0.75, cc = 3.75, dd = 1.5, target = 7.5, raw = 4.5.
        let estimate = state.compute_delay(t0 + secs(9.0), PARAMS);
        assert!(approx(estimate.consumed, 3.75));
        assert!(approx(estimate.delay, (1.5 + 4.5) / 2.0));
    }

    #[test]
    fn accumulators_never_negative() {
        let t0 = base();
        let mut state = DecayState::default();
        let mut now = t0;
        for step in 0..50u64 {
            now += Duration::from_millis(37 * step);
            state.compute_delay(now, PARAMS);
            assert!(state.consumed() >= 0.0 && state.delay() >= 0.0);
            let start = now;
            now += Duration::from_millis(5 * step);
            state.on_consume(now, start, PARAMS.window);
            assert!(state.consumed() >= 0.0 && state.delay() >= 0.0);
        }
    }

    #[test]
    fn idle_only_after_window() {
        let t0 = base();
        let mut state = DecayState::default();
        assert!(state.is_idle(t0, PARAMS.window));

        state.on_consume(t0, t0, PARAMS.window);
        assert!(!state.is_idle(t0 + secs(12.0), PARAMS.window));
        assert!(state.is_idle(t0 + secs(12.5), PARAMS.window));
    }
}
