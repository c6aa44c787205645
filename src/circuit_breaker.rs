//! Failure-counting circuit breaker gating setup requests.
//!
//! The breaker opens after a configured number of consecutive failures,
//! allows a half-open probe once the reset timeout elapses, and counts how
//! many times it has transitioned to open since the last success. The
//! module lifecycle uses that consecutive-open counter to decide when to
//! stop retrying setup and force a full connection reset instead.

use std::time::{Duration, Instant};

use tracing::debug;

/// Gate state of the breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
  /// Requests flow normally.
  Closed,
  /// Requests are refused until the reset timeout elapses.
  Open,
  /// One probe request is allowed through.
  HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerConfig {
  /// Consecutive failures before the breaker opens.
  pub failure_threshold: u32,
  /// Time the breaker stays open before allowing a half-open probe.
  pub reset_timeout: Duration,
  /// Consecutive open events before the lifecycle escalates to a full
  /// connection reset.
  pub open_limit: u32,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 1,
      reset_timeout: Duration::from_millis(500),
      open_limit: 2,
    }
  }
}

/// Failure-counting gate around an unreliable operation.
#[derive(Debug)]
pub struct CircuitBreaker {
  config: CircuitBreakerConfig,
  state: BreakerState,
  consecutive_failures: u32,
  consecutive_opens: u32,
  opened_at: Option<Instant>,
}

impl CircuitBreaker {
  /// Creates a closed breaker with the given configuration.
  pub fn new(config: CircuitBreakerConfig) -> Self {
    Self {
      config,
      state: BreakerState::Closed,
      consecutive_failures: 0,
      consecutive_opens: 0,
      opened_at: None,
    }
  }

  /// Returns the current gate state, accounting for an elapsed reset
  /// timeout (open becomes half-open).
  pub fn state(&mut self) -> BreakerState {
    if self.state == BreakerState::Open
      && let Some(opened_at) = self.opened_at
      && opened_at.elapsed() >= self.config.reset_timeout
    {
      self.state = BreakerState::HalfOpen;
      debug!("circuit breaker half-open; allowing a probe");
    }
    self.state
  }

  /// Non-mutating view of the gate state, with the same elapsed-timeout
  /// read as [`state`](Self::state) but without storing the transition.
  pub fn current_state(&self) -> BreakerState {
    if self.state == BreakerState::Open
      && let Some(opened_at) = self.opened_at
      && opened_at.elapsed() >= self.config.reset_timeout
    {
      return BreakerState::HalfOpen;
    }
    self.state
  }

  /// Asks to perform one guarded operation; true if allowed.
  pub fn try_acquire(&mut self) -> bool {
    match self.state() {
      BreakerState::Closed | BreakerState::HalfOpen => true,
      BreakerState::Open => false,
    }
  }

  /// Records a successful operation: closes the gate and clears both the
  /// failure and the consecutive-open counters.
  pub fn record_success(&mut self) {
    self.state = BreakerState::Closed;
    self.consecutive_failures = 0;
    self.consecutive_opens = 0;
    self.opened_at = None;
  }

  /// Records a failed operation; opens the gate at the failure threshold
  /// and counts the open event.
  pub fn record_failure(&mut self) {
    self.consecutive_failures += 1;
    if self.consecutive_failures >= self.config.failure_threshold {
      self.state = BreakerState::Open;
      self.opened_at = Some(Instant::now());
      self.consecutive_failures = 0;
      self.consecutive_opens += 1;
      debug!(
        consecutive_opens = self.consecutive_opens,
        "circuit breaker opened"
      );
    }
  }

  /// Number of open events since the last success.
  pub fn consecutive_opens(&self) -> u32 {
    self.consecutive_opens
  }

  /// True once the consecutive-open counter reached the escalation limit.
  pub fn open_limit_reached(&self) -> bool {
    self.consecutive_opens >= self.config.open_limit
  }

  /// Fully resets the breaker (used after the lifecycle escalates to a
  /// connection reset).
  pub fn reset(&mut self) {
    self.state = BreakerState::Closed;
    self.consecutive_failures = 0;
    self.consecutive_opens = 0;
    self.opened_at = None;
  }
}

impl Default for CircuitBreaker {
  fn default() -> Self {
    Self::new(CircuitBreakerConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_opens_at_threshold_and_counts_open_events() {
    let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
      failure_threshold: 1,
      reset_timeout: Duration::from_millis(0),
      open_limit: 2,
    });

    assert!(breaker.try_acquire());
    breaker.record_failure();
    assert_eq!(breaker.consecutive_opens(), 1);
    assert!(!breaker.open_limit_reached());

    // Zero reset timeout: immediately half-open, probe allowed.
    assert!(breaker.try_acquire());
    breaker.record_failure();
    assert_eq!(breaker.consecutive_opens(), 2);
    assert!(breaker.open_limit_reached());
  }

  #[test]
  fn test_success_clears_counters() {
    let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
      failure_threshold: 1,
      reset_timeout: Duration::from_millis(0),
      open_limit: 2,
    });
    breaker.record_failure();
    assert_eq!(breaker.consecutive_opens(), 1);

    breaker.record_success();
    assert_eq!(breaker.consecutive_opens(), 0);
    assert_eq!(breaker.state(), BreakerState::Closed);
  }

  #[test]
  fn test_open_gate_refuses_until_reset_timeout() {
    let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
      failure_threshold: 1,
      reset_timeout: Duration::from_secs(3600),
      open_limit: 2,
    });
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.try_acquire());
  }

  #[test]
  fn test_reset_closes_gate_and_clears_open_counter() {
    let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
      failure_threshold: 1,
      reset_timeout: Duration::from_secs(3600),
      open_limit: 2,
    });
    breaker.record_failure();
    assert_eq!(breaker.consecutive_opens(), 1);
    assert!(!breaker.try_acquire());

    breaker.reset();
    assert_eq!(breaker.consecutive_opens(), 0);
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.try_acquire());
  }

  #[test]
  fn test_threshold_above_one_needs_consecutive_failures() {
    let mut breaker = CircuitBreaker::new(CircuitBreakerConfig {
      failure_threshold: 3,
      reset_timeout: Duration::from_millis(0),
      open_limit: 2,
    });
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    breaker.record_failure();
    assert_ne!(breaker.state(), BreakerState::Closed);
  }
}
