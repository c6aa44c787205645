//! Connection session: the per-module binding between an address and its
//! command-handling logic.
//!
//! A session decodes incoming envelopes, converts the three special wire
//! shapes into ordinary commands, routes transaction control to its ledger,
//! dispatches everything else through the capability registry, and wraps
//! results back into reply envelopes. Dispatch failures become structured
//! error replies; nothing thrown by a handler ever crosses the session
//! boundary.
//!
//! Each session is driven by one task pulling from its transport inbox, so
//! envelopes are processed strictly in arrival order and the ledger is only
//! ever touched from one logical flow.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::{Args, Command};
use crate::envelope::{Body, Envelope, Header};
use crate::error::ErrorCode;
use crate::handler::CapabilityRegistry;
use crate::transaction::TransactionLedger;
use crate::transport::Transport;

/// Per-module session bound to one connection address.
#[derive(Debug)]
pub struct ConnectionSession {
  address: String,
  registry: CapabilityRegistry,
  ledger: TransactionLedger,
}

impl ConnectionSession {
  /// Creates a session for the given address, handler registry, and
  /// transaction ledger.
  pub fn new(address: impl Into<String>, registry: CapabilityRegistry, ledger: TransactionLedger) -> Self {
    Self {
      address: address.into(),
      registry,
      ledger,
    }
  }

  /// Returns the bound address.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Returns the transaction ledger (for tests and introspection).
  pub fn ledger(&self) -> &TransactionLedger {
    &self.ledger
  }

  /// Registers this session with the transport and spawns its serving
  /// task, consuming the session.
  ///
  /// The returned handle can reset the binding; the session's ledger (and
  /// any pending transaction) dies with the task, so a reset also forgets
  /// the transaction state.
  pub async fn bind(mut self, transport: Arc<dyn Transport>) -> SessionHandle {
    let address = self.address.clone();
    let mut inbox = transport.subscribe(&address).await;
    let join = tokio::spawn(async move {
      while let Some(delivery) = inbox.recv().await {
        let reply = self.handle_incoming(delivery.envelope).await;
        if let Some(reply_tx) = delivery.reply {
          let _ = reply_tx.send(reply);
        }
      }
      debug!(address = %self.address, "session inbox closed");
    });
    SessionHandle {
      address,
      transport,
      join,
    }
  }

  /// Handles one incoming envelope and produces the reply envelope.
  pub async fn handle_incoming(&mut self, envelope: Envelope) -> Envelope {
    if let Some(command) = envelope.decode_special() {
      return self.dispatch(command, &envelope).await;
    }

    // Special forms carry their own sender; everything else needs a
    // header with one.
    if envelope.sender().is_none() {
      return self.invalid_header(&envelope);
    }

    let Some(body) = &envelope.body else {
      return self.invalid_message(&envelope);
    };
    let Some(method) = body.method.clone() else {
      return self.invalid_message(&envelope);
    };

    if TransactionLedger::is_control(&method) {
      let control = self.ledger.handle_control(&method).await;
      return match control {
        Some(Ok(payload)) => self.ok_reply(payload, &envelope),
        Some(Err(rejected)) => self.command_error(&rejected.message, &envelope),
        // is_control and handle_control agree on the method set.
        None => self.command_error(ErrorCode::CommandNotExecuted.message(), &envelope),
      };
    }

    let args = body.args.clone().unwrap_or_default();
    self.dispatch(Command::new(method, args), &envelope).await
  }

  async fn dispatch(&mut self, command: Command, original: &Envelope) -> Envelope {
    let create_undo = self.ledger.is_inside();
    let result = self
      .registry
      .dispatch(command.method(), command.args(), create_undo)
      .await;
    match result {
      Ok(outcome) => {
        if let Some(undo) = outcome.undo {
          if let Err(rejected) = self.ledger.push(undo) {
            warn!(method = command.method(), "undo discarded: {rejected}");
            return self.command_error(&rejected.message, original);
          }
        }
        self.ok_reply(outcome.reply, original)
      }
      Err(rejected) => {
        debug!(method = command.method(), error = %rejected, "command rejected");
        self.command_error(&rejected.message, original)
      }
    }
  }

  fn reply_header(&self, original: &Envelope, response_code: Option<u8>) -> Header {
    Header {
      sender_id: Some(self.address.clone()),
      receiver_id: original.sender().map(str::to_string),
      response_code,
    }
  }

  fn ok_reply(&self, payload: Args, original: &Envelope) -> Envelope {
    Envelope {
      header: Some(self.reply_header(original, None)),
      body: Some(Body {
        rest: payload,
        ..Body::default()
      }),
      ..Envelope::default()
    }
  }

  /// Builds a command-error reply, attaching the original incoming
  /// envelope for traceability.
  fn command_error(&self, message: &str, original: &Envelope) -> Envelope {
    Envelope {
      header: Some(self.reply_header(
        original,
        Some(ErrorCode::CommandNotExecuted.ordinal()),
      )),
      body: Some(Body {
        error: Some(message.to_string()),
        original_message: Some(Box::new(original.clone())),
        ..Body::default()
      }),
      ..Envelope::default()
    }
  }

  fn invalid_header(&self, original: &Envelope) -> Envelope {
    warn!(address = %self.address, "envelope without a usable sender header");
    Envelope {
      header: Some(self.reply_header(original, Some(ErrorCode::InvalidHeader.ordinal()))),
      body: Some(Body {
        error: Some(ErrorCode::InvalidHeader.message().to_string()),
        original_message: Some(Box::new(original.clone())),
        ..Body::default()
      }),
      ..Envelope::default()
    }
  }

  fn invalid_message(&self, original: &Envelope) -> Envelope {
    warn!(address = %self.address, "envelope without body or special form");
    Envelope {
      header: Some(self.reply_header(original, Some(ErrorCode::InvalidMessage.ordinal()))),
      body: Some(Body {
        error: Some(ErrorCode::InvalidMessage.message().to_string()),
        original_message: Some(Box::new(original.clone())),
        ..Body::default()
      }),
      ..Envelope::default()
    }
  }
}

/// Handle to a bound, serving session.
pub struct SessionHandle {
  address: String,
  transport: Arc<dyn Transport>,
  join: JoinHandle<()>,
}

impl SessionHandle {
  /// Returns the bound address.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Clears the binding and stops the serving task.
  ///
  /// The session's ledger is discarded with the task: a connection reset
  /// also forgets any pending transaction.
  pub async fn reset(self) {
    self.transport.unregister(&self.address).await;
    self.join.abort();
  }
}

impl std::fmt::Debug for SessionHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionHandle")
      .field("address", &self.address)
      .finish_non_exhaustive()
  }
}
