//! Wire envelope codec.
//!
//! Every message on the bus is an [`Envelope`]: either a standard two-part
//! form (`header` + `body`) or one of three special control forms
//! (`heartbeat`, `resetConnection`, `exitProcess`). Exactly one of `body` or
//! a special key is present in well-formed traffic.
//!
//! The codec also decodes the special forms into ordinary [`Command`]s with
//! a synthesized `id` (and `state` for heartbeats) argument, so downstream
//! dispatch never has to special-case the three wire shapes.
//!
//! # Wire format
//!
//! JSON-compatible object with keys `header.senderId`, `header.receiverId`,
//! `body.method`, `body.args`, or one of `heartbeat{senderId,state}`,
//! `resetConnection:<senderId>`, `exitProcess:<senderId>`. Error replies add
//! `header.responseCode` (integer ordinal 0-6) and `body.error`, optionally
//! `body.originalMessage`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::command::{ARG_ID, ARG_STATE, Args, Command};

/// Method name synthesized for decoded heartbeat envelopes.
pub const HEARTBEAT_METHOD: &str = "heartbeat";

/// Method name synthesized for decoded reset-connection envelopes.
pub const RESET_CONNECTION_METHOD: &str = "resetConnection";

/// Method name synthesized for decoded exit-process envelopes.
pub const EXIT_PROCESS_METHOD: &str = "exitProcess";

/// Well-known broadcast address for forcing a connection reset on every
/// subscribed module.
pub const MODULE_RESET_ADDRESS: &str = "module_reset";

/// Envelope header: transport-level sender/receiver identities, plus the
/// error ordinal on structured error replies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
  /// Address of the sending party.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sender_id: Option<String>,
  /// Address of the receiving party.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub receiver_id: Option<String>,
  /// Error-code ordinal; present iff this is a structured error reply.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub response_code: Option<u8>,
}

/// Envelope body: a command, a reply payload, or an error description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
  /// Method name of a command envelope.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub method: Option<String>,
  /// Argument map of a command envelope.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub args: Option<Args>,
  /// Error message of an error reply.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  /// Original envelope that triggered an error reply, for diagnostics.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub original_message: Option<Box<Envelope>>,
  /// Remaining reply payload fields (e.g. the assigned `id` of a register
  /// reply, or a setup document).
  #[serde(flatten)]
  pub rest: Args,
}

impl Body {
  /// Returns true if the body carries no fields at all.
  pub fn is_empty(&self) -> bool {
    self.method.is_none()
      && self.args.is_none()
      && self.error.is_none()
      && self.original_message.is_none()
      && self.rest.is_empty()
  }
}

/// Heartbeat special form: sender plus self-reported module state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
  /// Address of the heartbeating module.
  pub sender_id: String,
  /// Self-reported module state (see `lifecycle::ModuleState`).
  pub state: String,
}

/// The kind of a special control envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialKind {
  /// Periodic liveness message carrying self-reported module state.
  Heartbeat,
  /// Request to reset the sender's connection.
  ResetConnection,
  /// Request to terminate the receiving process.
  ExitProcess,
}

/// The wire-level message wrapper.
///
/// Invariant: exactly one of `body` or a special key is present in
/// well-formed traffic. Envelopes violating this are reported as
/// `INVALID_MESSAGE` by the session, never silently dropped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
  /// Sender/receiver identities and optional error ordinal.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub header: Option<Header>,
  /// Command, reply, or error payload.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Body>,
  /// Heartbeat special form.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub heartbeat: Option<Heartbeat>,
  /// Reset-connection special form (value is the sender address).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reset_connection: Option<String>,
  /// Exit-process special form (value is the sender address).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exit_process: Option<String>,
}

impl Envelope {
  /// Builds the standard two-part command envelope.
  pub fn command(sender: &str, receiver: &str, method: &str, args: Args) -> Self {
    Self {
      header: Some(Header {
        sender_id: Some(sender.to_string()),
        receiver_id: Some(receiver.to_string()),
        response_code: None,
      }),
      body: Some(Body {
        method: Some(method.to_string()),
        args: Some(args),
        ..Body::default()
      }),
      ..Self::default()
    }
  }

  /// Builds one of the three special control envelopes.
  ///
  /// `state` is only used for [`SpecialKind::Heartbeat`]; a missing state is
  /// encoded as an empty string.
  pub fn special(kind: SpecialKind, sender: &str, state: Option<&str>) -> Self {
    match kind {
      SpecialKind::Heartbeat => Self {
        heartbeat: Some(Heartbeat {
          sender_id: sender.to_string(),
          state: state.unwrap_or_default().to_string(),
        }),
        ..Self::default()
      },
      SpecialKind::ResetConnection => Self {
        reset_connection: Some(sender.to_string()),
        ..Self::default()
      },
      SpecialKind::ExitProcess => Self {
        exit_process: Some(sender.to_string()),
        ..Self::default()
      },
    }
  }

  /// Builds a plain reply envelope carrying the given payload map.
  pub fn reply(sender: &str, receiver: &str, payload: Args) -> Self {
    Self {
      header: Some(Header {
        sender_id: Some(sender.to_string()),
        receiver_id: Some(receiver.to_string()),
        response_code: None,
      }),
      body: Some(Body {
        rest: payload,
        ..Body::default()
      }),
      ..Self::default()
    }
  }

  /// Recognizes a special control envelope and converts it into an ordinary
  /// [`Command`] with a synthesized `id` (and `state` for heartbeats)
  /// argument.
  ///
  /// Returns `None` for standard command envelopes.
  pub fn decode_special(&self) -> Option<Command> {
    if let Some(hb) = &self.heartbeat {
      let mut args = Args::new();
      args.insert(ARG_ID.to_string(), json!(hb.sender_id));
      args.insert(ARG_STATE.to_string(), json!(hb.state));
      return Some(Command::new(HEARTBEAT_METHOD, args));
    }
    if let Some(sender) = &self.reset_connection {
      let mut args = Args::new();
      args.insert(ARG_ID.to_string(), json!(sender));
      return Some(Command::new(RESET_CONNECTION_METHOD, args));
    }
    if let Some(sender) = &self.exit_process {
      let mut args = Args::new();
      args.insert(ARG_ID.to_string(), json!(sender));
      return Some(Command::new(EXIT_PROCESS_METHOD, args));
    }
    None
  }

  /// Returns the sender address of this envelope, whichever form it takes.
  pub fn sender(&self) -> Option<&str> {
    if let Some(header) = &self.header
      && let Some(sender) = &header.sender_id
    {
      return Some(sender);
    }
    if let Some(hb) = &self.heartbeat {
      return Some(&hb.sender_id);
    }
    if let Some(sender) = &self.reset_connection {
      return Some(sender);
    }
    self.exit_process.as_deref()
  }

  /// Returns true if this reply carries anything beyond an empty success
  /// body: an error ordinal, an error message, a command echo, or payload
  /// fields.
  ///
  /// Heartbeat replies use this: a healthy coordinator replies with an
  /// empty body, and any payload-bearing reply triggers a connection reset.
  pub fn has_payload(&self) -> bool {
    if let Some(header) = &self.header
      && header.response_code.is_some()
    {
      return true;
    }
    self.body.as_ref().is_some_and(|b| !b.is_empty())
  }
}
