//! Coordinator-side command handlers and module directory.
//!
//! The coordinator's own session receives module commands (`register`,
//! `unregister`, `sendSetup`, plus decoded heartbeats) and dispatches them
//! to configuration collaborators. The [`ModuleDirectory`] owns the
//! registered-module map behind an explicit read/write API; nothing else in
//! the process touches that state directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::command::{ARG_ID, ARG_STATE, Args};
use crate::handler::{CapabilityRegistry, CommandOutcome, CommandRejected};

/// One registered module as the coordinator sees it.
#[derive(Clone, Debug)]
pub struct ModuleRecord {
  /// Module type reported at registration.
  pub module_type: String,
  /// When the module registered.
  pub registered_at: DateTime<Utc>,
  /// When the last heartbeat arrived, if any.
  pub last_heartbeat: Option<DateTime<Utc>>,
  /// Last self-reported state, if any heartbeat arrived.
  pub last_state: Option<String>,
}

impl ModuleRecord {
  /// Returns true if a heartbeat (or the registration itself) was seen
  /// within the timeout.
  pub fn is_healthy(&self, timeout: Duration) -> bool {
    let last_seen = self.last_heartbeat.unwrap_or(self.registered_at);
    let elapsed = Utc::now().signed_duration_since(last_seen);
    match chrono::Duration::from_std(timeout) {
      Ok(window) => elapsed <= window,
      Err(_) => true,
    }
  }
}

/// Directory of registered modules, keyed by assigned connection id.
///
/// Cloning yields another handle to the same directory.
#[derive(Clone, Debug, Default)]
pub struct ModuleDirectory {
  inner: Arc<tokio::sync::RwLock<HashMap<String, ModuleRecord>>>,
}

impl ModuleDirectory {
  /// Creates an empty directory.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a module of the given type and assigns it a fresh
  /// connection id.
  pub async fn register(&self, module_type: &str) -> String {
    let mut modules = self.inner.write().await;
    let id = loop {
      let candidate = format!("{module_type}-{:08x}", rand::random::<u32>());
      if !modules.contains_key(&candidate) {
        break candidate;
      }
    };
    modules.insert(
      id.clone(),
      ModuleRecord {
        module_type: module_type.to_string(),
        registered_at: Utc::now(),
        last_heartbeat: None,
        last_state: None,
      },
    );
    info!(id = %id, module_type, "module registered");
    id
  }

  /// Removes a module; returns true if it was present.
  pub async fn unregister(&self, id: &str) -> bool {
    let removed = self.inner.write().await.remove(id).is_some();
    if removed {
      info!(id, "module unregistered");
    }
    removed
  }

  /// Records a heartbeat for a module; returns false for unknown ids.
  pub async fn record_heartbeat(&self, id: &str, state: &str) -> bool {
    let mut modules = self.inner.write().await;
    match modules.get_mut(id) {
      Some(record) => {
        record.last_heartbeat = Some(Utc::now());
        record.last_state = Some(state.to_string());
        true
      }
      None => false,
    }
  }

  /// Returns a copy of one module's record.
  pub async fn get(&self, id: &str) -> Option<ModuleRecord> {
    self.inner.read().await.get(id).cloned()
  }

  /// Returns the ids of modules with no heartbeat inside the timeout.
  pub async fn stale(&self, timeout: Duration) -> Vec<String> {
    self
      .inner
      .read()
      .await
      .iter()
      .filter(|(_, record)| !record.is_healthy(timeout))
      .map(|(id, _)| id.clone())
      .collect()
  }

  /// Returns the ids of all registered modules.
  pub async fn ids(&self) -> Vec<String> {
    self.inner.read().await.keys().cloned().collect()
  }

  /// Returns the number of registered modules.
  pub async fn len(&self) -> usize {
    self.inner.read().await.len()
  }

  /// Returns true if no module is registered.
  pub async fn is_empty(&self) -> bool {
    self.inner.read().await.is_empty()
  }
}

/// Provides the setup document pushed to a module after registration.
#[async_trait]
pub trait SetupProvider: Send + Sync {
  /// Returns the setup payload for a module of the given type and id.
  async fn setup_for(&self, module_type: &str, id: &str) -> Result<Args, CommandRejected>;
}

/// Registers the coordinator's capabilities (`register`, `unregister`,
/// `sendSetup`, `heartbeat`) into the given registry.
pub fn register_coordinator_capabilities(
  registry: &CapabilityRegistry,
  directory: ModuleDirectory,
  provider: Arc<dyn SetupProvider>,
) {
  let dir = directory.clone();
  registry.register("register", move |args: Args, _create_undo| {
    let dir = dir.clone();
    async move {
      let module_type = args
        .get("moduleType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
      if module_type.is_empty() {
        return Err(CommandRejected::new("register: missing moduleType"));
      }
      let id = dir.register(&module_type).await;
      let mut reply = Args::new();
      reply.insert(ARG_ID.to_string(), json!(id));
      Ok(CommandOutcome::with_reply(reply))
    }
  });

  let dir = directory.clone();
  registry.register("unregister", move |args: Args, _create_undo| {
    let dir = dir.clone();
    async move {
      let id = required_id(&args)?;
      if !dir.unregister(&id).await {
        return Err(CommandRejected::new(format!("unknown module id: {id}")));
      }
      Ok(CommandOutcome::empty())
    }
  });

  let dir = directory.clone();
  registry.register("sendSetup", move |args: Args, _create_undo| {
    let dir = dir.clone();
    let provider = provider.clone();
    async move {
      let id = required_id(&args)?;
      let Some(record) = dir.get(&id).await else {
        return Err(CommandRejected::new(format!("unknown module id: {id}")));
      };
      let setup = provider.setup_for(&record.module_type, &id).await?;
      Ok(CommandOutcome::with_reply(setup))
    }
  });

  let dir = directory;
  registry.register("heartbeat", move |args: Args, _create_undo| {
    let dir = dir.clone();
    async move {
      let id = required_id(&args)?;
      let state = args
        .get(ARG_STATE)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
      if !dir.record_heartbeat(&id, state).await {
        debug!(id = %id, "heartbeat from unknown module");
        return Err(CommandRejected::new(format!("unknown module id: {id}")));
      }
      // Healthy heartbeats reply with an empty body; anything else makes
      // the module reset its connection.
      Ok(CommandOutcome::empty())
    }
  });
}

fn required_id(args: &Args) -> Result<String, CommandRejected> {
  args
    .get(ARG_ID)
    .and_then(serde_json::Value::as_str)
    .map(str::to_string)
    .ok_or_else(|| CommandRejected::new("missing id"))
}

/// Setup provider serving a fixed payload per module type.
#[derive(Clone, Debug, Default)]
pub struct StaticSetupProvider {
  setups: Arc<tokio::sync::RwLock<HashMap<String, Args>>>,
}

impl StaticSetupProvider {
  /// Creates an empty provider.
  pub fn new() -> Self {
    Self::default()
  }

  /// Stores the setup payload for a module type.
  pub async fn insert(&self, module_type: impl Into<String>, setup: Args) {
    self.setups.write().await.insert(module_type.into(), setup);
  }
}

#[async_trait]
impl SetupProvider for StaticSetupProvider {
  async fn setup_for(&self, module_type: &str, id: &str) -> Result<Args, CommandRejected> {
    self
      .setups
      .read()
      .await
      .get(module_type)
      .cloned()
      .ok_or_else(|| {
        CommandRejected::new(format!("no setup for module type {module_type} (id {id})"))
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_register_assigns_unique_typed_ids() {
    let directory = ModuleDirectory::new();
    let a = directory.register("inbound").await;
    let b = directory.register("inbound").await;

    assert!(a.starts_with("inbound-"));
    assert_ne!(a, b);
    assert_eq!(directory.len().await, 2);
  }

  #[tokio::test]
  async fn test_unregister_removes_the_module() {
    let directory = ModuleDirectory::new();
    let id = directory.register("outbound").await;

    assert!(directory.unregister(&id).await);
    assert!(!directory.unregister(&id).await);
    assert!(directory.is_empty().await);
  }

  #[tokio::test]
  async fn test_heartbeat_refreshes_health() {
    let directory = ModuleDirectory::new();
    let id = directory.register("sensor").await;

    assert!(directory.record_heartbeat(&id, "operational").await);
    assert!(!directory.record_heartbeat("ghost", "operational").await);

    let record = directory.get(&id).await.unwrap();
    assert_eq!(record.last_state.as_deref(), Some("operational"));
    assert!(record.is_healthy(Duration::from_secs(60)));
    assert!(directory.stale(Duration::from_secs(60)).await.is_empty());
  }

  #[tokio::test]
  async fn test_registered_capabilities_cover_module_commands() {
    let registry = CapabilityRegistry::new();
    let directory = ModuleDirectory::new();
    register_coordinator_capabilities(
      &registry,
      directory.clone(),
      Arc::new(StaticSetupProvider::new()),
    );

    let mut args = Args::new();
    args.insert("moduleType".to_string(), json!("sensor"));
    let outcome = registry.dispatch("register", args, false).await.unwrap();
    let id = outcome.reply[ARG_ID].as_str().unwrap().to_string();
    assert_eq!(directory.len().await, 1);

    // No setup stored for the type: sendSetup is a command error.
    let mut args = Args::new();
    args.insert(ARG_ID.to_string(), json!(id));
    let err = registry.dispatch("sendSetup", args.clone(), false).await;
    assert!(err.is_err());

    let outcome = registry.dispatch("heartbeat", args.clone(), false).await.unwrap();
    assert!(outcome.reply.is_empty());

    registry.dispatch("unregister", args, false).await.unwrap();
    assert!(directory.is_empty().await);
  }
}
