use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::command::{Args, Command};
use crate::handler::{CapabilityRegistry, CommandOutcome, CommandRejected};
use crate::transaction::{OutOfTransactionPush, TransactionLedger};
use crate::undo::{CompositeUndo, UndoCommand, UndoStep};

/// Registry with a `record` capability appending its `value` argument to a
/// shared log, and a `fail` capability that always rejects.
fn recording_registry() -> (CapabilityRegistry, Arc<Mutex<Vec<String>>>) {
  let registry = CapabilityRegistry::new();
  let log = Arc::new(Mutex::new(Vec::new()));

  let sink = log.clone();
  registry.register("record", move |args: Args, _| {
    let sink = sink.clone();
    async move {
      let value = args
        .get("value")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
      sink.lock().unwrap().push(value);
      Ok(CommandOutcome::empty())
    }
  });

  registry.register("fail", |_args: Args, _| async {
    Err(CommandRejected::new("fail always fails"))
  });

  (registry, log)
}

fn record_step(registry: &CapabilityRegistry, value: &str) -> UndoStep {
  let mut args = Args::new();
  args.insert("value".to_string(), json!(value));
  UndoStep::Single(UndoCommand::new(
    Command::new("record", args),
    registry.clone(),
  ))
}

fn fail_step(registry: &CapabilityRegistry) -> UndoStep {
  UndoStep::Single(UndoCommand::new(
    Command::without_args("fail"),
    registry.clone(),
  ))
}

#[tokio::test]
async fn test_rollback_replays_undos_in_reverse_order() {
  let (registry, log) = recording_registry();
  let mut ledger = TransactionLedger::new(OutOfTransactionPush::Accept);

  ledger.begin();
  ledger.push(record_step(&registry, "first")).unwrap();
  ledger.push(record_step(&registry, "second")).unwrap();
  ledger.push(record_step(&registry, "third")).unwrap();

  ledger.rollback().await.unwrap();
  assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
  assert!(!ledger.is_inside());
  assert_eq!(ledger.depth(), 0);
}

#[tokio::test]
async fn test_rollback_stops_at_first_failure_and_clears_stack() {
  let (registry, log) = recording_registry();
  let mut ledger = TransactionLedger::new(OutOfTransactionPush::Accept);

  // LIFO: "after" runs first, then the failing step halts the replay.
  ledger.begin();
  ledger.push(record_step(&registry, "before")).unwrap();
  ledger.push(fail_step(&registry)).unwrap();
  ledger.push(record_step(&registry, "after")).unwrap();

  let err = ledger.rollback().await.unwrap_err();
  assert_eq!(err.message, "fail always fails");
  assert_eq!(*log.lock().unwrap(), vec!["after"]);
  // The stack is cleared even though the rollback failed part-way.
  assert_eq!(ledger.depth(), 0);
  assert!(!ledger.is_inside());
}

#[tokio::test]
async fn test_commit_discards_undos_without_running_them() {
  let (registry, log) = recording_registry();
  let mut ledger = TransactionLedger::new(OutOfTransactionPush::Accept);

  ledger.begin();
  ledger.push(record_step(&registry, "ignored")).unwrap();
  ledger.commit();

  assert!(log.lock().unwrap().is_empty());
  assert!(!ledger.is_inside());
  assert_eq!(ledger.depth(), 0);
}

#[tokio::test]
async fn test_begin_inside_transaction_discards_previous_bracket() {
  let (registry, log) = recording_registry();
  let mut ledger = TransactionLedger::new(OutOfTransactionPush::Accept);

  ledger.begin();
  ledger.push(record_step(&registry, "stale")).unwrap();

  // Last begin wins: the stale undo never replays.
  ledger.begin();
  ledger.push(record_step(&registry, "fresh")).unwrap();
  ledger.rollback().await.unwrap();

  assert_eq!(*log.lock().unwrap(), vec!["fresh"]);
}

#[tokio::test]
async fn test_rollback_with_empty_stack_succeeds() {
  let mut ledger = TransactionLedger::new(OutOfTransactionPush::Accept);
  ledger.begin();
  assert!(ledger.rollback().await.is_ok());
}

#[tokio::test]
async fn test_out_of_transaction_push_policies() {
  let (registry, _log) = recording_registry();

  let mut accepting = TransactionLedger::new(OutOfTransactionPush::Accept);
  accepting.push(record_step(&registry, "kept")).unwrap();
  assert_eq!(accepting.depth(), 1);

  let mut rejecting = TransactionLedger::new(OutOfTransactionPush::Reject);
  let err = rejecting.push(record_step(&registry, "dropped")).unwrap_err();
  assert!(err.message.contains("outside a transaction"));
  assert_eq!(rejecting.depth(), 0);
}

#[tokio::test]
async fn test_control_methods_are_intercepted() {
  let mut ledger = TransactionLedger::new(OutOfTransactionPush::Accept);

  assert!(TransactionLedger::is_control("transactionBegin"));
  assert!(!TransactionLedger::is_control("registerSensor"));

  assert!(ledger.handle_control("transactionBegin").await.is_some());
  assert!(ledger.is_inside());
  assert!(ledger.handle_control("transactionCommit").await.is_some());
  assert!(!ledger.is_inside());
  assert!(ledger.handle_control("registerSensor").await.is_none());
}

#[tokio::test]
async fn test_composite_undo_replays_lifo_and_halts_on_failure() {
  let (registry, log) = recording_registry();

  let mut composite = CompositeUndo::new();
  let mut args = Args::new();
  args.insert("value".to_string(), json!("inner-first"));
  composite.push(UndoCommand::new(
    Command::new("record", args),
    registry.clone(),
  ));
  composite.push(UndoCommand::new(
    Command::without_args("fail"),
    registry.clone(),
  ));
  let mut args = Args::new();
  args.insert("value".to_string(), json!("inner-last"));
  composite.push(UndoCommand::new(
    Command::new("record", args),
    registry.clone(),
  ));

  // Most recent first: "inner-last" runs, the failure halts before
  // "inner-first".
  let err = composite.execute().await.unwrap_err();
  assert_eq!(err.message, "fail always fails");
  assert_eq!(*log.lock().unwrap(), vec!["inner-last"]);
}
