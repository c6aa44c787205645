//! Command value type for wire-level dispatch.
//!
//! A [`Command`] is a named operation plus its arguments, exactly as it
//! travels inside an envelope body. Commands are immutable once constructed;
//! arguments are handed out as defensive copies so no handler can mutate a
//! command another handler is still looking at.

use serde_json::Value;

/// Argument map carried by a command (JSON object, insertion-ordered).
pub type Args = serde_json::Map<String, Value>;

/// Synthesized argument key carrying the sender id of a decoded special
/// command.
pub const ARG_ID: &str = "id";

/// Synthesized argument key carrying the reported state of a decoded
/// heartbeat.
pub const ARG_STATE: &str = "state";

/// A named operation with arguments, dispatched to a handler capability.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
  method: String,
  args: Args,
}

impl Command {
  /// Creates a new command from a method name and argument map.
  pub fn new(method: impl Into<String>, args: Args) -> Self {
    Self {
      method: method.into(),
      args,
    }
  }

  /// Creates a command with no arguments.
  pub fn without_args(method: impl Into<String>) -> Self {
    Self::new(method, Args::new())
  }

  /// Returns the method name.
  pub fn method(&self) -> &str {
    &self.method
  }

  /// Returns a defensive copy of the argument map.
  pub fn args(&self) -> Args {
    self.args.clone()
  }

  /// Returns a defensive copy of a single argument, if present.
  pub fn arg(&self, key: &str) -> Option<Value> {
    self.args.get(key).cloned()
  }

  /// Returns a single argument as a string slice, if present and a string.
  pub fn arg_str(&self, key: &str) -> Option<&str> {
    self.args.get(key).and_then(Value::as_str)
  }
}

impl std::fmt::Display for Command {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}({} args)", self.method, self.args.len())
  }
}
