use std::time::{Duration, Instant};

use crate::config::InputLagConfig;

/// Adapts the number of turns local input is delayed by to the measured
/// round-trip time.
#[derive(Debug)]
pub struct InputLagController {
    config: InputLagConfig,
    turn_period: Duration,
    current: u32,
    skip_remaining: u32,
    sample_sum: Duration,
    sample_count: u32,
    period_start: Instant,
}

impl InputLagController {
    pub fn new(config: InputLagConfig, turn_period: Duration) -> Self {
        let current = config
            .initial_turns
            .clamp(config.min_turns, config.max_turns.max(config.min_turns));
        Self {
            config,
            turn_period,
            current,
            skip_remaining: current,
            sample_sum: Duration::ZERO,
            sample_count: 0,
            period_start: Instant::now(),
        }
    }

    pub fn input_lag(&self) -> u32 {
        self.current
    }

    /// Records one RTT sample from a peer connected for `connected_for`.
    /// Peers still inside the warm-up period are ignored.
    pub fn observe(&mut self, connected_for: Duration, rtt: Duration) -> bool {
        if connected_for < Duration::from_millis(self.config.warmup_ms) {
            return false;
        }
        self.sample_sum += rtt;
        self.sample_count += 1;
        true
    }

    /// Lag that would cover `rtt` plus one turn of slack.
    pub fn target_for(&self, rtt: Duration) -> u32 {
        let period = self.turn_period.as_secs_f64().max(f64::EPSILON);
        let turns = (rtt.as_secs_f64() / period).ceil() as u32 + 1;
        turns.clamp(self.config.min_turns, self.config.max_turns.max(self.config.min_turns))
    }

    /// Closes the sampling period once it has elapsed and moves the lag one
    /// turn towards the target. Returns the new lag if it changed.
    pub fn update(&mut self, now: Instant) -> Option<u32> {
        let period = Duration::from_millis(self.config.sample_period_ms);
        if now.saturating_duration_since(self.period_start) < period {
            return None;
        }
        self.period_start = now;
        if self.sample_count == 0 {
            return None;
        }

        let average = self.sample_sum / self.sample_count;
        self.sample_sum = Duration::ZERO;
        self.sample_count = 0;

        let target = self.target_for(average);
        let next = match target.cmp(&self.current) {
            std::cmp::Ordering::Greater => self.current + 1,
            std::cmp::Ordering::Less => self.current - 1,
            std::cmp::Ordering::Equal => return None,
        };
        log::info!(
            "Input lag {} -> {} turns (avg rtt {:?}, target {})",
            self.current,
            next,
            average,
            target
        );
        self.current = next;
        Some(next)
    }

    /// Turns left that run without waiting for remote packets.
    pub fn skip_initial_input_turns(&self) -> u32 {
        self.skip_remaining
    }

    /// Consumes one skipped turn. Returns false once the pipeline is full.
    pub fn take_skip_turn(&mut self) -> bool {
        if self.skip_remaining == 0 {
            return false;
        }
        self.skip_remaining -= 1;
        true
    }

    /// Drops accumulated samples and restarts the input pipeline.
    pub fn reset(&mut self) {
        self.sample_sum = Duration::ZERO;
        self.sample_count = 0;
        self.period_start = Instant::now();
        self.skip_remaining = self.current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> InputLagController {
        InputLagController::new(InputLagConfig::default(), Duration::from_millis(50))
    }

    #[test]
    fn test_warmup_samples_ignored() {
        let mut lag = controller();
        assert!(!lag.observe(Duration::from_millis(100), Duration::from_millis(400)));

        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(lag.update(later), None);
        assert_eq!(lag.input_lag(), 2);
    }

    #[test]
    fn test_target_formula() {
        let lag = controller();
        assert_eq!(lag.target_for(Duration::ZERO), 1);
        assert_eq!(lag.target_for(Duration::from_millis(50)), 2);
        assert_eq!(lag.target_for(Duration::from_millis(120)), 4);
        assert_eq!(lag.target_for(Duration::from_secs(10)), 8);
    }

    #[test]
    fn test_moves_one_turn_per_period() {
        let mut lag = controller();
        let warm = Duration::from_secs(10);
        let mut now = Instant::now();

        for expected in [3, 4, 5] {
            lag.observe(warm, Duration::from_millis(300));
            now += Duration::from_secs(3);
            assert_eq!(lag.update(now), Some(expected));
        }

        lag.observe(warm, Duration::ZERO);
        now += Duration::from_secs(3);
        assert_eq!(lag.update(now), Some(4));
    }

    #[test]
    fn test_skip_turns_after_reset() {
        let mut lag = controller();
        assert!(lag.take_skip_turn());
        assert!(lag.take_skip_turn());
        assert!(!lag.take_skip_turn());

        lag.reset();
        assert_eq!(lag.skip_initial_input_turns(), 2);
    }
}
