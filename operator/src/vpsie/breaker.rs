use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::VpsieError;
use crate::util::clock::Clock;

/// Circuit breaker guarding the cloud API. Consecutive failures beyond
/// the threshold open the circuit for a cooldown interval, after which
/// a single probe request is admitted; its outcome decides between
/// closing and reopening.
pub struct CircuitBreaker {
    state: Mutex<State>,
    threshold: u32,
    cooldown: ChronoDuration,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: DateTime<Utc> },
    HalfOpen { probe_in_flight: bool },
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        CircuitBreaker {
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            threshold: threshold.max(1),
            cooldown: ChronoDuration::from_std(cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            clock,
        }
    }

    /// Gate applied before each request. Fails fast with `CircuitOpen`
    /// while the circuit is open, and admits exactly one probe once the
    /// cooldown has elapsed.
    pub fn try_acquire(&self) -> Result<(), VpsieError> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                if self.clock.now() >= *until {
                    *state = State::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(VpsieError::CircuitOpen)
                }
            }
            State::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Err(VpsieError::CircuitOpen)
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful request: closes the circuit and resets the
    /// failure streak.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    /// Records a failed request. In the closed state this grows the
    /// failure streak until the threshold opens the circuit; a failed
    /// half-open probe reopens it for another cooldown.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.threshold {
                    *state = State::Open {
                        until: self.clock.now() + self.cooldown,
                    };
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open {
                    until: self.clock.now() + self.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;

    fn breaker(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new("2026-03-01T00:00:00Z".parse().unwrap()));
        (
            CircuitBreaker::new(threshold, Duration::from_secs(30), clock.clone()),
            clock,
        )
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let (breaker, _clock) = breaker(3);
        for _ in 0..3 {
            assert!(breaker.try_acquire().is_ok());
            breaker.record_failure();
        }
        assert!(matches!(breaker.try_acquire(), Err(VpsieError::CircuitOpen)));
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let (breaker, _clock) = breaker(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn half_open_admits_one_probe_and_closes_on_success() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure();
        assert!(breaker.try_acquire().is_err());
        clock.advance(ChronoDuration::seconds(31));
        // First caller after the cooldown is the probe.
        assert!(breaker.try_acquire().is_ok());
        // Concurrent callers are rejected while the probe is in flight.
        assert!(matches!(breaker.try_acquire(), Err(VpsieError::CircuitOpen)));
        breaker.record_success();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn failed_probe_reopens_the_circuit() {
        let (breaker, clock) = breaker(1);
        breaker.record_failure();
        clock.advance(ChronoDuration::seconds(31));
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert!(matches!(breaker.try_acquire(), Err(VpsieError::CircuitOpen)));
        // Another cooldown admits another probe.
        clock.advance(ChronoDuration::seconds(31));
        assert!(breaker.try_acquire().is_ok());
    }
}
