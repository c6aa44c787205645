use serde_json::json;

use crate::command::{ARG_ID, ARG_STATE, Args};
use crate::envelope::{
  Envelope, HEARTBEAT_METHOD, RESET_CONNECTION_METHOD, SpecialKind,
};
use crate::error::{ErrorCode, error_envelope};

fn args(pairs: &[(&str, &str)]) -> Args {
  let mut args = Args::new();
  for (key, value) in pairs {
    args.insert(key.to_string(), json!(value));
  }
  args
}

#[test]
fn test_command_envelope_round_trip() {
  let env = Envelope::command(
    "sensor-1",
    "coordinator",
    "registerSensor",
    args(&[("sensorId", "s1"), ("eventTypeName", "temperature")]),
  );
  let text = serde_json::to_string(&env).unwrap();
  let back: Envelope = serde_json::from_str(&text).unwrap();
  assert_eq!(back, env);

  let body = back.body.unwrap();
  assert_eq!(body.method.as_deref(), Some("registerSensor"));
  assert_eq!(
    body.args.unwrap().get("sensorId").and_then(|v| v.as_str()),
    Some("s1")
  );
}

#[test]
fn test_special_envelope_round_trip() {
  for env in [
    Envelope::special(SpecialKind::Heartbeat, "m-1", Some("operational")),
    Envelope::special(SpecialKind::ResetConnection, "m-2", None),
    Envelope::special(SpecialKind::ExitProcess, "m-3", None),
  ] {
    let text = serde_json::to_string(&env).unwrap();
    let back: Envelope = serde_json::from_str(&text).unwrap();
    assert_eq!(back, env);
  }
}

#[test]
fn test_decode_special_synthesizes_args() {
  let hb = Envelope::special(SpecialKind::Heartbeat, "m-1", Some("degraded"));
  let command = hb.decode_special().unwrap();
  assert_eq!(command.method(), HEARTBEAT_METHOD);
  assert_eq!(command.arg_str(ARG_ID), Some("m-1"));
  assert_eq!(command.arg_str(ARG_STATE), Some("degraded"));

  let reset = Envelope::special(SpecialKind::ResetConnection, "m-2", None);
  let command = reset.decode_special().unwrap();
  assert_eq!(command.method(), RESET_CONNECTION_METHOD);
  assert_eq!(command.arg_str(ARG_ID), Some("m-2"));

  let plain = Envelope::command("a", "b", "noop", Args::new());
  assert!(plain.decode_special().is_none());
}

#[test]
fn test_error_reply_round_trip_preserves_original_message() {
  let original = Envelope::command("m-1", "coordinator", "sendSetup", Args::new());
  let mut reply = error_envelope(ErrorCode::ReplyTimeout);
  reply.body.as_mut().unwrap().original_message = Some(Box::new(original.clone()));

  let text = serde_json::to_string(&reply).unwrap();
  let back: Envelope = serde_json::from_str(&text).unwrap();

  assert_eq!(
    back.header.as_ref().unwrap().response_code,
    Some(ErrorCode::ReplyTimeout.ordinal())
  );
  let body = back.body.unwrap();
  assert_eq!(body.error.as_deref(), Some("reply timeout"));
  assert_eq!(*body.original_message.unwrap(), original);
}

#[test]
fn test_has_payload_distinguishes_empty_success() {
  let empty = Envelope::reply("coordinator", "m-1", Args::new());
  assert!(!empty.has_payload());

  let with_fields = Envelope::reply("coordinator", "m-1", args(&[(ARG_ID, "m-1")]));
  assert!(with_fields.has_payload());

  let error = error_envelope(ErrorCode::UnknownError);
  assert!(error.has_payload());
}

#[test]
fn test_sender_for_every_form() {
  let cmd = Envelope::command("m-1", "coordinator", "noop", Args::new());
  assert_eq!(cmd.sender(), Some("m-1"));

  let hb = Envelope::special(SpecialKind::Heartbeat, "m-2", None);
  assert_eq!(hb.sender(), Some("m-2"));

  let exit = Envelope::special(SpecialKind::ExitProcess, "m-3", None);
  assert_eq!(exit.sender(), Some("m-3"));

  assert_eq!(Envelope::default().sender(), None);
}
