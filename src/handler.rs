//! Capability registry: explicit method-name dispatch.
//!
//! Command handlers expose capabilities keyed by method name. Each
//! capability is an async closure accepting `(args, create_undo)` and
//! returning either a [`CommandOutcome`] (reply payload plus an optional
//! undo step) or a [`CommandRejected`] error. The registry replaces
//! reflective invocation with an explicit map built at construction time,
//! which gives an explicit "unknown command" branch instead of a caught
//! invocation exception.
//!
//! The registry handle is cheap to clone and safe to share; undo commands
//! hold a clone so they can re-invoke their handler's own capabilities
//! during rollback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::command::Args;
use crate::undo::UndoStep;

/// Boxed async capability: `(args, create_undo) -> outcome`.
pub type Capability =
  Arc<dyn Fn(Args, bool) -> BoxFuture<'static, CapabilityResult> + Send + Sync>;

/// Result of one capability invocation.
pub type CapabilityResult = Result<CommandOutcome, CommandRejected>;

/// Process-termination hook used by the `exitProcess` capability.
///
/// Production code passes [`process_exiter`]; tests inject a recorder.
pub type Exiter = Arc<dyn Fn(i32) + Send + Sync>;

/// Successful result of a command: the reply payload plus the undo step the
/// handler captured at the moment it mutated state (if it was asked to).
#[derive(Debug, Default)]
pub struct CommandOutcome {
  /// Reply payload fields.
  pub reply: Args,
  /// Undo step reversing this command's effect, when one was requested and
  /// the command mutated state.
  pub undo: Option<UndoStep>,
}

impl CommandOutcome {
  /// An empty success outcome.
  pub fn empty() -> Self {
    Self::default()
  }

  /// A success outcome carrying the given reply payload.
  pub fn with_reply(reply: Args) -> Self {
    Self { reply, undo: None }
  }

  /// Attaches an undo step to this outcome.
  pub fn and_undo(mut self, undo: UndoStep) -> Self {
    self.undo = Some(undo);
    self
  }
}

/// Application-level rejection of a command.
///
/// Rejections are always converted into structured error replies; they
/// never propagate as panics or crash the session.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CommandRejected {
  /// Human-readable rejection reason, carried as `body.error`.
  pub message: String,
}

impl CommandRejected {
  /// Creates a rejection with the given message.
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  /// The canonical rejection for a method no capability is registered for.
  pub fn unknown_method(method: &str) -> Self {
    Self::new(format!("no capability registered for method: {method}"))
  }
}

/// Registry mapping method names to capabilities.
///
/// Cloning yields another handle to the same underlying map.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
  caps: Arc<RwLock<HashMap<String, Capability>>>,
}

impl CapabilityRegistry {
  /// Creates an empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a capability under the given method name, replacing any
  /// previous registration.
  pub fn register<F, Fut>(&self, method: impl Into<String>, capability: F)
  where
    F: Fn(Args, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CapabilityResult> + Send + 'static,
  {
    let cap: Capability = Arc::new(move |args, create_undo| Box::pin(capability(args, create_undo)));
    self.write().insert(method.into(), cap);
  }

  /// Returns true if a capability is registered for the method.
  pub fn contains(&self, method: &str) -> bool {
    self.read().contains_key(method)
  }

  /// Dispatches a command to the capability registered under its method
  /// name.
  ///
  /// `create_undo` asks the capability to capture an undo step alongside
  /// its reply. Unknown methods are an explicit rejection, not a panic.
  pub async fn dispatch(&self, method: &str, args: Args, create_undo: bool) -> CapabilityResult {
    let capability = self.read().get(method).cloned();
    match capability {
      Some(capability) => capability(args, create_undo).await,
      None => {
        debug!(method, "dispatch to unknown method");
        Err(CommandRejected::unknown_method(method))
      }
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Capability>> {
    match self.caps.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Capability>> {
    match self.caps.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl std::fmt::Debug for CapabilityRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let methods: Vec<String> = self.read().keys().cloned().collect();
    f.debug_struct("CapabilityRegistry")
      .field("methods", &methods)
      .finish()
  }
}

/// Returns the production exiter, which terminates the process.
pub fn process_exiter() -> Exiter {
  Arc::new(|code| std::process::exit(code))
}

/// Registers the `exitProcess` capability: replies success, then terminates
/// the process with the given `statusCode` argument (default 0).
///
/// Termination is deferred briefly so the success reply reaches the wire
/// before the process goes away.
pub fn register_exit_capability(registry: &CapabilityRegistry, exiter: Exiter) {
  registry.register(
    crate::envelope::EXIT_PROCESS_METHOD,
    move |args: Args, _create_undo| {
      let exiter = exiter.clone();
      async move {
        let code = args
          .get("statusCode")
          .and_then(serde_json::Value::as_i64)
          .and_then(|code| i32::try_from(code).ok())
          .unwrap_or(0);
        tokio::spawn(async move {
          tokio::time::sleep(Duration::from_millis(20)).await;
          exiter(code);
        });
        Ok(CommandOutcome::empty())
      }
    },
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_dispatch_known_method() {
    let registry = CapabilityRegistry::new();
    registry.register("echo", |args: Args, _| async move {
      Ok(CommandOutcome::with_reply(args))
    });

    let mut args = Args::new();
    args.insert("value".to_string(), json!(42));
    let outcome = registry.dispatch("echo", args.clone(), false).await.unwrap();
    assert_eq!(outcome.reply, args);
    assert!(outcome.undo.is_none());
  }

  #[tokio::test]
  async fn test_dispatch_unknown_method_is_explicit_rejection() {
    let registry = CapabilityRegistry::new();
    let err = registry
      .dispatch("nope", Args::new(), false)
      .await
      .unwrap_err();
    assert!(err.message.contains("nope"));
  }

  #[tokio::test]
  async fn test_exit_capability_invokes_exiter_with_status_code() {
    let registry = CapabilityRegistry::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    register_exit_capability(
      &registry,
      Arc::new(move |code| {
        let _ = tx.send(code);
      }),
    );

    let mut args = Args::new();
    args.insert("statusCode".to_string(), json!(3));
    let outcome = registry
      .dispatch(crate::envelope::EXIT_PROCESS_METHOD, args, false)
      .await
      .unwrap();
    assert!(outcome.reply.is_empty());

    let code = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap();
    assert_eq!(code, Some(3));
  }

  #[tokio::test]
  async fn test_exit_capability_defaults_out_of_range_status_code() {
    let registry = CapabilityRegistry::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    register_exit_capability(
      &registry,
      Arc::new(move |code| {
        let _ = tx.send(code);
      }),
    );

    let mut args = Args::new();
    args.insert("statusCode".to_string(), json!(i64::from(i32::MAX) + 1));
    registry
      .dispatch(crate::envelope::EXIT_PROCESS_METHOD, args, false)
      .await
      .unwrap();

    let code = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap();
    assert_eq!(code, Some(0));
  }
}
