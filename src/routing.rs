//! Routing table collaborator: sensor and update-listener registrations.
//!
//! Owns the sensor and listener lookup maps behind an explicit read/write
//! API; the coordination core only ever calls through the registered
//! capabilities, never touches the maps directly. Doubles as the reference
//! consumer of the dispatch contract: its mutating capabilities hand back
//! the inverse command as their undo.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::command::{Args, Command};
use crate::handler::{CapabilityRegistry, CommandOutcome, CommandRejected};
use crate::undo::{UndoCommand, UndoStep};

#[derive(Debug, Default)]
struct RoutingState {
  /// sensor id -> event type name
  sensors: HashMap<String, String>,
  /// listener id -> delivery address
  listeners: HashMap<String, String>,
}

/// Routing table owning sensor and listener registrations.
///
/// Cloning yields another handle to the same table.
#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
  inner: Arc<tokio::sync::RwLock<RoutingState>>,
}

impl RoutingTable {
  /// Creates an empty table.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the event type a sensor is registered for.
  pub async fn sensor(&self, sensor_id: &str) -> Option<String> {
    self.inner.read().await.sensors.get(sensor_id).cloned()
  }

  /// Returns the delivery address a listener is registered under.
  pub async fn listener(&self, listener_id: &str) -> Option<String> {
    self.inner.read().await.listeners.get(listener_id).cloned()
  }

  /// Returns the number of registered sensors.
  pub async fn sensor_count(&self) -> usize {
    self.inner.read().await.sensors.len()
  }

  /// Registers this table's capabilities (`registerSensor`,
  /// `unregisterSensor`, `registerUpdateListener`, `removeUpdateListener`)
  /// into the given registry.
  ///
  /// Mutating capabilities capture the inverse command as their undo when
  /// asked to; the undo replays through the same registry.
  pub fn register_capabilities(&self, registry: &CapabilityRegistry) {
    let table = self.clone();
    let undo_registry = registry.clone();
    registry.register("registerSensor", move |args: Args, create_undo| {
      let table = table.clone();
      let undo_registry = undo_registry.clone();
      async move {
        let sensor_id = required(&args, "sensorId")?;
        let event_type = required(&args, "eventTypeName")?;
        {
          let mut state = table.inner.write().await;
          if state.sensors.contains_key(&sensor_id) {
            return Err(CommandRejected::new(format!(
              "already registered sensor with id: {sensor_id}"
            )));
          }
          state.sensors.insert(sensor_id.clone(), event_type);
        }
        debug!(sensor_id = %sensor_id, "sensor registered");

        let mut outcome = CommandOutcome::empty();
        if create_undo {
          let mut undo_args = Args::new();
          undo_args.insert("sensorId".to_string(), json!(sensor_id));
          outcome = outcome.and_undo(UndoStep::Single(UndoCommand::new(
            Command::new("unregisterSensor", undo_args),
            undo_registry,
          )));
        }
        Ok(outcome)
      }
    });

    let table = self.clone();
    registry.register("unregisterSensor", move |args: Args, _create_undo| {
      let table = table.clone();
      async move {
        let sensor_id = required(&args, "sensorId")?;
        if table.inner.write().await.sensors.remove(&sensor_id).is_none() {
          return Err(CommandRejected::new(format!(
            "no sensor registered with id: {sensor_id}"
          )));
        }
        debug!(sensor_id = %sensor_id, "sensor unregistered");
        Ok(CommandOutcome::empty())
      }
    });

    let table = self.clone();
    let undo_registry = registry.clone();
    registry.register("registerUpdateListener", move |args: Args, create_undo| {
      let table = table.clone();
      let undo_registry = undo_registry.clone();
      async move {
        let listener_id = required(&args, "id")?;
        let address = args
          .get("address")
          .and_then(serde_json::Value::as_str)
          .unwrap_or(&listener_id)
          .to_string();
        {
          let mut state = table.inner.write().await;
          if state.listeners.contains_key(&listener_id) {
            return Err(CommandRejected::new(format!(
              "already registered listener with id: {listener_id}"
            )));
          }
          state.listeners.insert(listener_id.clone(), address);
        }
        debug!(listener_id = %listener_id, "update listener registered");

        let mut outcome = CommandOutcome::empty();
        if create_undo {
          let mut undo_args = Args::new();
          undo_args.insert("id".to_string(), json!(listener_id));
          outcome = outcome.and_undo(UndoStep::Single(UndoCommand::new(
            Command::new("removeUpdateListener", undo_args),
            undo_registry,
          )));
        }
        Ok(outcome)
      }
    });

    let table = self.clone();
    registry.register("removeUpdateListener", move |args: Args, _create_undo| {
      let table = table.clone();
      async move {
        let listener_id = required(&args, "id")?;
        if table
          .inner
          .write()
          .await
          .listeners
          .remove(&listener_id)
          .is_none()
        {
          return Err(CommandRejected::new(format!(
            "no listener registered with id: {listener_id}"
          )));
        }
        Ok(CommandOutcome::empty())
      }
    });
  }
}

fn required(args: &Args, key: &str) -> Result<String, CommandRejected> {
  args
    .get(key)
    .and_then(serde_json::Value::as_str)
    .map(str::to_string)
    .ok_or_else(|| CommandRejected::new(format!("missing argument: {key}")))
}
