//! Tracing initialization shared by binaries and tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the default fmt subscriber once per process.
///
/// Safe to call from every test; later calls are no-ops, and an already
/// installed global subscriber is tolerated.
pub fn init_tracing() {
  INIT.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_target(false)
      .with_max_level(tracing::Level::DEBUG)
      .try_init();
  });
}
