//! # CoordWeave
//!
//! Module coordination and transactional command protocol for distributed
//! event-processing platforms.
//!
//! CoordWeave gives each module of a distributed system a supervised
//! connection to a central coordinator: registration with a unique
//! connection id, setup delivery, heartbeating with self-reported health,
//! and automatic recovery through retries, a circuit breaker, and full
//! connection resets. On top of the connection it runs a transactional
//! command protocol: commands are dispatched by name to registered
//! capabilities, and inside a transaction every command records an undo so
//! a rollback can replay the inverse commands in reverse order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coordweave::config::ModuleConfig;
//! use coordweave::handler::CapabilityRegistry;
//! use coordweave::transport::InProcessTransport;
//!
//! # async fn run(setup: Arc<dyn coordweave::lifecycle::SetupHandler>) -> Result<(), coordweave::error::CoordError> {
//! let transport = Arc::new(InProcessTransport::new());
//! let registry = CapabilityRegistry::new();
//! let config = ModuleConfig::new("sensor", "coordinator");
//! let handle = coordweave::lifecycle::spawn(config, transport, registry, setup).await?;
//! # handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Command value type, well-known argument keys, and helpers.
pub mod command;
/// Wire envelopes: commands, replies, and special messages.
pub mod envelope;
/// Error codes, failure classification, and the crate error type.
pub mod error;
/// Message transport: addressed delivery, request/reply, broadcast.
pub mod transport;
/// Capability registry dispatching commands by method name.
pub mod handler;
/// Undo commands and LIFO composites.
pub mod undo;
/// Transaction ledger: begin/commit/rollback and undo collection.
pub mod transaction;
/// Per-connection command session bound to a transport address.
pub mod session;
/// Circuit breaker gating setup requests.
pub mod circuit_breaker;
/// Module configuration with validation.
pub mod config;
/// Module lifecycle state machine: register, setup, heartbeat, reset.
pub mod lifecycle;
/// Coordinator-side module directory and capabilities.
pub mod coordinator;
/// Sensor and listener routing tables with undoable registration.
pub mod routing;
/// Tracing initialization shared by binaries and tests.
pub mod telemetry;

#[cfg(test)]
mod envelope_test;
#[cfg(test)]
mod routing_test;
#[cfg(test)]
mod transaction_test;
