//! Error taxonomy and reply classification.
//!
//! Three classes of failure exist in the protocol:
//!
//! - **Transport errors** (no handler, timeout, recipient failure, invalid
//!   header/message): always retryable by the caller, surfaced as
//!   synthesized error envelopes.
//! - **Command errors**: application-level failures reported inside a
//!   normal reply body; `COMMAND_NOT_EXECUTED` when dispatch itself failed,
//!   a domain-specific message when the handler rejected the request.
//! - **Fatal errors**: local configuration defects that abort startup
//!   instead of retrying, modeled by [`CoordError`].
//!
//! [`ErrorCode`] is ordinal-stable and travels as a wire integer; reordering
//! its variants breaks compatibility across deployed modules and must never
//! happen.

use tracing::warn;

use crate::envelope::{Body, Envelope, Header};

/// Closed, ordinal-stable error-code enumeration.
///
/// The discriminants are the wire ordinals (`header.responseCode`); they are
/// fixed for backward compatibility across deployed modules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
  /// Malformed or missing envelope header.
  InvalidHeader = 0,
  /// Envelope has no usable body and is not a special command.
  InvalidMessage = 1,
  /// Request/reply timed out.
  ReplyTimeout = 2,
  /// No session is bound to the target address.
  ReplyNoHandlers = 3,
  /// The recipient failed while producing a reply.
  ReplyRecipientFailure = 4,
  /// Dispatch failed: unknown method or handler invocation failure.
  CommandNotExecuted = 5,
  /// Unclassifiable failure; always logged as an anomaly when produced.
  UnknownError = 6,
}

impl ErrorCode {
  /// Returns the wire ordinal of this code.
  pub const fn ordinal(self) -> u8 {
    self as u8
  }

  /// Returns the canonical error message for this code.
  pub const fn message(self) -> &'static str {
    match self {
      ErrorCode::InvalidHeader => "invalid header",
      ErrorCode::InvalidMessage => "invalid message",
      ErrorCode::ReplyTimeout => "reply timeout",
      ErrorCode::ReplyNoHandlers => "no handlers for address",
      ErrorCode::ReplyRecipientFailure => "recipient failure",
      ErrorCode::CommandNotExecuted => "command not executed",
      ErrorCode::UnknownError => "unknown error",
    }
  }

  /// Returns true if this code denotes a transport-layer failure the caller
  /// may retry.
  pub const fn is_retryable(self) -> bool {
    matches!(
      self,
      ErrorCode::InvalidHeader
        | ErrorCode::InvalidMessage
        | ErrorCode::ReplyTimeout
        | ErrorCode::ReplyNoHandlers
        | ErrorCode::ReplyRecipientFailure
    )
  }
}

impl std::fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.message())
  }
}

impl TryFrom<u8> for ErrorCode {
  type Error = CoordError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(ErrorCode::InvalidHeader),
      1 => Ok(ErrorCode::InvalidMessage),
      2 => Ok(ErrorCode::ReplyTimeout),
      3 => Ok(ErrorCode::ReplyNoHandlers),
      4 => Ok(ErrorCode::ReplyRecipientFailure),
      5 => Ok(ErrorCode::CommandNotExecuted),
      6 => Ok(ErrorCode::UnknownError),
      other => Err(CoordError::UnknownErrorCode(other)),
    }
  }
}

/// The transport's failure kinds for a request that produced no reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendFailure {
  /// No session is bound to the target address.
  NoHandlers,
  /// The reply did not arrive within the timeout.
  Timeout,
  /// The recipient dropped the request without replying.
  RecipientFailure,
  /// A bus-specific failure outside the closed taxonomy.
  Other(String),
}

/// Maps a transport failure kind to its [`ErrorCode`].
///
/// Kinds outside the closed taxonomy map to `UNKNOWN_ERROR` and are logged
/// as an anomaly, never silently swallowed.
pub fn classify(failure: &SendFailure) -> ErrorCode {
  match failure {
    SendFailure::NoHandlers => ErrorCode::ReplyNoHandlers,
    SendFailure::Timeout => ErrorCode::ReplyTimeout,
    SendFailure::RecipientFailure => ErrorCode::ReplyRecipientFailure,
    SendFailure::Other(detail) => {
      warn!(detail = %detail, "unclassified transport failure; mapping to UNKNOWN_ERROR");
      ErrorCode::UnknownError
    }
  }
}

/// Produces a bare structured error envelope
/// `{header:{responseCode}, body:{error}}`.
pub fn error_envelope(code: ErrorCode) -> Envelope {
  Envelope {
    header: Some(Header {
      response_code: Some(code.ordinal()),
      ..Header::default()
    }),
    body: Some(Body {
      error: Some(code.message().to_string()),
      ..Body::default()
    }),
    ..Envelope::default()
  }
}

/// Returns true iff the reply's body carries an error message matching one
/// of the transport-retryable codes.
///
/// Connection errors are transport-layer and retryable; the caller should
/// back off and retry rather than treat the reply as a command result.
pub fn is_connection_error(reply: &Envelope) -> bool {
  let Some(body) = &reply.body else {
    return false;
  };
  let Some(error) = &body.error else {
    return false;
  };
  [
    ErrorCode::InvalidHeader,
    ErrorCode::InvalidMessage,
    ErrorCode::ReplyTimeout,
    ErrorCode::ReplyNoHandlers,
    ErrorCode::ReplyRecipientFailure,
  ]
  .iter()
  .any(|code| error == code.message())
}

/// Returns true iff the reply's header carries an error ordinal at all,
/// i.e. this is a structured error reply rather than a normal result.
pub fn is_command_error(reply: &Envelope) -> bool {
  reply
    .header
    .as_ref()
    .is_some_and(|h| h.response_code.is_some())
}

/// Fatal, non-retryable errors local to this process.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
  /// Startup configuration is empty or malformed; aborts startup.
  #[error("configuration error: {0}")]
  Config(String),
  /// A wire ordinal outside the closed error-code range.
  #[error("unknown error code ordinal: {0}")]
  UnknownErrorCode(u8),
}
