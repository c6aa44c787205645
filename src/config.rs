//! Module startup configuration.
//!
//! [`ModuleConfig`] carries everything a module needs to run its lifecycle:
//! identity, coordinator address, retry delays, heartbeat period, breaker
//! thresholds, and the out-of-transaction push policy. Empty or malformed
//! configuration is a fatal error that aborts startup immediately; it is
//! the one failure class the lifecycle never retries.

use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::CoordError;
use crate::transaction::OutOfTransactionPush;

/// Configuration for one module process.
#[derive(Clone, Debug)]
pub struct ModuleConfig {
  /// Module type reported at registration (e.g. "inbound", "persistence").
  pub module_type: String,
  /// Address of the coordinator session on the bus.
  pub coordinator_address: String,
  /// Timeout applied to every request/reply.
  pub request_timeout: Duration,
  /// Delay before retrying a failed registration.
  pub register_retry_delay: Duration,
  /// Delay before retrying a failed or rejected setup.
  pub setup_retry_delay: Duration,
  /// Delay before a postponed connection reset fires.
  pub pending_reset_delay: Duration,
  /// Period of the heartbeat timer.
  pub heartbeat_interval: Duration,
  /// Circuit breaker thresholds for setup requests.
  pub breaker: CircuitBreakerConfig,
  /// Policy for undo pushes outside a transaction.
  pub push_policy: OutOfTransactionPush,
  /// Custom self-reported heartbeat state, overriding the derived one.
  pub reported_state: Option<String>,
}

impl ModuleConfig {
  /// Creates a configuration with defaults for everything but identity.
  pub fn new(module_type: impl Into<String>, coordinator_address: impl Into<String>) -> Self {
    Self {
      module_type: module_type.into(),
      coordinator_address: coordinator_address.into(),
      request_timeout: Duration::from_secs(5),
      register_retry_delay: Duration::from_secs(2),
      setup_retry_delay: Duration::from_secs(2),
      pending_reset_delay: Duration::from_millis(500),
      heartbeat_interval: Duration::from_secs(10),
      breaker: CircuitBreakerConfig::default(),
      push_policy: OutOfTransactionPush::default(),
      reported_state: None,
    }
  }

  /// Sets the request/reply timeout.
  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  /// Sets the registration retry delay.
  pub fn with_register_retry_delay(mut self, delay: Duration) -> Self {
    self.register_retry_delay = delay;
    self
  }

  /// Sets the setup retry delay.
  pub fn with_setup_retry_delay(mut self, delay: Duration) -> Self {
    self.setup_retry_delay = delay;
    self
  }

  /// Sets the postponed-reset delay.
  pub fn with_pending_reset_delay(mut self, delay: Duration) -> Self {
    self.pending_reset_delay = delay;
    self
  }

  /// Sets the heartbeat period.
  pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  /// Sets the circuit breaker thresholds.
  pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
    self.breaker = breaker;
    self
  }

  /// Sets the out-of-transaction push policy.
  pub fn with_push_policy(mut self, policy: OutOfTransactionPush) -> Self {
    self.push_policy = policy;
    self
  }

  /// Sets a custom self-reported heartbeat state.
  pub fn with_reported_state(mut self, state: impl Into<String>) -> Self {
    self.reported_state = Some(state.into());
    self
  }

  /// Validates the configuration; empty identity fields are fatal.
  pub fn validate(&self) -> Result<(), CoordError> {
    if self.module_type.trim().is_empty() {
      return Err(CoordError::Config("module type is empty".to_string()));
    }
    if self.coordinator_address.trim().is_empty() {
      return Err(CoordError::Config(
        "coordinator address is empty".to_string(),
      ));
    }
    if self.heartbeat_interval.is_zero() {
      return Err(CoordError::Config(
        "heartbeat interval must be non-zero".to_string(),
      ));
    }
    Ok(())
  }
}
