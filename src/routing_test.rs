use serde_json::json;

use crate::command::Args;
use crate::envelope::Envelope;
use crate::error::ErrorCode;
use crate::handler::CapabilityRegistry;
use crate::routing::RoutingTable;
use crate::session::ConnectionSession;
use crate::transaction::{OutOfTransactionPush, TransactionLedger};

fn routing_session() -> (ConnectionSession, RoutingTable) {
  let registry = CapabilityRegistry::new();
  let table = RoutingTable::new();
  table.register_capabilities(&registry);
  let session = ConnectionSession::new(
    "config-1",
    registry,
    TransactionLedger::new(OutOfTransactionPush::Accept),
  );
  (session, table)
}

fn command(method: &str, pairs: &[(&str, &str)]) -> Envelope {
  let mut args = Args::new();
  for (key, value) in pairs {
    args.insert(key.to_string(), json!(value));
  }
  Envelope::command("peer", "config-1", method, args)
}

fn control(method: &str) -> Envelope {
  Envelope::command("peer", "config-1", method, Args::new())
}

#[tokio::test]
async fn test_register_sensor_and_duplicate_rejection() {
  let (mut session, table) = routing_session();

  let reply = session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s1"), ("eventTypeName", "temperature")],
    ))
    .await;
  assert!(reply.header.as_ref().unwrap().response_code.is_none());
  assert_eq!(table.sensor("s1").await.as_deref(), Some("temperature"));

  let reply = session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s1"), ("eventTypeName", "humidity")],
    ))
    .await;
  assert_eq!(
    reply.header.as_ref().unwrap().response_code,
    Some(ErrorCode::CommandNotExecuted.ordinal())
  );
  assert_eq!(
    reply.body.unwrap().error.as_deref(),
    Some("already registered sensor with id: s1")
  );
  // The original registration survives the rejected duplicate.
  assert_eq!(table.sensor("s1").await.as_deref(), Some("temperature"));
}

#[tokio::test]
async fn test_missing_argument_is_rejected() {
  let (mut session, _table) = routing_session();
  let reply = session
    .handle_incoming(command("registerSensor", &[("eventTypeName", "temperature")]))
    .await;
  assert_eq!(
    reply.body.unwrap().error.as_deref(),
    Some("missing argument: sensorId")
  );
}

#[tokio::test]
async fn test_rollback_unregisters_sensors_in_reverse() {
  let (mut session, table) = routing_session();

  session.handle_incoming(control("transactionBegin")).await;
  session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s1"), ("eventTypeName", "temperature")],
    ))
    .await;
  session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s2"), ("eventTypeName", "pressure")],
    ))
    .await;
  assert_eq!(table.sensor_count().await, 2);

  let reply = session.handle_incoming(control("transactionRollback")).await;
  assert!(reply.header.as_ref().unwrap().response_code.is_none());
  assert_eq!(table.sensor_count().await, 0);
}

#[tokio::test]
async fn test_commit_keeps_registrations() {
  let (mut session, table) = routing_session();

  session.handle_incoming(control("transactionBegin")).await;
  session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s1"), ("eventTypeName", "temperature")],
    ))
    .await;
  session.handle_incoming(control("transactionCommit")).await;

  session.handle_incoming(control("transactionRollback")).await;
  assert_eq!(table.sensor("s1").await.as_deref(), Some("temperature"));
}

#[tokio::test]
async fn test_failed_command_inside_transaction_leaves_rollback_usable() {
  let (mut session, table) = routing_session();

  session.handle_incoming(control("transactionBegin")).await;
  session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s1"), ("eventTypeName", "temperature")],
    ))
    .await;
  // Duplicate fails; no undo is recorded for it.
  session
    .handle_incoming(command(
      "registerSensor",
      &[("sensorId", "s1"), ("eventTypeName", "humidity")],
    ))
    .await;

  session.handle_incoming(control("transactionRollback")).await;
  assert_eq!(table.sensor_count().await, 0);
}

#[tokio::test]
async fn test_update_listener_register_and_remove() {
  let (mut session, table) = routing_session();

  let reply = session
    .handle_incoming(command(
      "registerUpdateListener",
      &[("id", "l1"), ("address", "listener-inbox")],
    ))
    .await;
  assert!(reply.header.as_ref().unwrap().response_code.is_none());
  assert_eq!(table.listener("l1").await.as_deref(), Some("listener-inbox"));

  let reply = session
    .handle_incoming(command("registerUpdateListener", &[("id", "l1")]))
    .await;
  assert_eq!(
    reply.body.unwrap().error.as_deref(),
    Some("already registered listener with id: l1")
  );

  session
    .handle_incoming(command("removeUpdateListener", &[("id", "l1")]))
    .await;
  assert!(table.listener("l1").await.is_none());

  let reply = session
    .handle_incoming(command("removeUpdateListener", &[("id", "l1")]))
    .await;
  assert_eq!(
    reply.body.unwrap().error.as_deref(),
    Some("no listener registered with id: l1")
  );
}

#[tokio::test]
async fn test_rollback_removes_listener_registration() {
  let (mut session, table) = routing_session();

  session.handle_incoming(control("transactionBegin")).await;
  session
    .handle_incoming(command("registerUpdateListener", &[("id", "l1")]))
    .await;
  assert!(table.listener("l1").await.is_some());

  session.handle_incoming(control("transactionRollback")).await;
  assert!(table.listener("l1").await.is_none());
}
