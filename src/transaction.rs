//! Transaction ledger: begin/commit/rollback brackets with compensating
//! undo.
//!
//! The ledger tracks whether one connection is inside a transaction and
//! owns the LIFO undo stack for that bracket. On rollback it replays undo
//! commands most-recent-first until one fails or the stack empties, and
//! reports the first failure as the transaction's overall result.
//!
//! The ledger is owned exclusively by one connection session and must never
//! be touched from more than one logical flow at a time; the session's
//! single-threaded loop guarantees that.

use tracing::warn;

use crate::command::Args;
use crate::handler::CommandRejected;
use crate::undo::UndoStep;

/// Method name opening a transaction bracket.
pub const TRANSACTION_BEGIN: &str = "transactionBegin";

/// Method name committing a transaction bracket.
pub const TRANSACTION_COMMIT: &str = "transactionCommit";

/// Method name rolling back a transaction bracket.
pub const TRANSACTION_ROLLBACK: &str = "transactionRollback";

/// Policy for `push` while no transaction is open.
///
/// The protocol historically tolerated out-of-transaction pushes
/// inconsistently; this makes the behavior an explicit configuration
/// choice instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutOfTransactionPush {
  /// Accept the undo for best-effort tracking, logging a warning.
  #[default]
  Accept,
  /// Reject the push with a command error.
  Reject,
}

/// Tracks the transaction bracket and undo stack of one connection.
#[derive(Debug, Default)]
pub struct TransactionLedger {
  inside: bool,
  undo_stack: Vec<UndoStep>,
  push_policy: OutOfTransactionPush,
}

impl TransactionLedger {
  /// Creates an empty ledger with the given out-of-transaction push policy.
  pub fn new(push_policy: OutOfTransactionPush) -> Self {
    Self {
      inside: false,
      undo_stack: Vec::new(),
      push_policy,
    }
  }

  /// Returns true while a begin/commit/rollback bracket is open.
  pub fn is_inside(&self) -> bool {
    self.inside
  }

  /// Returns the number of undo steps currently on the stack.
  pub fn depth(&self) -> usize {
    self.undo_stack.len()
  }

  /// Returns true if the method is one of the three transaction-control
  /// methods.
  pub fn is_control(method: &str) -> bool {
    matches!(
      method,
      TRANSACTION_BEGIN | TRANSACTION_COMMIT | TRANSACTION_ROLLBACK
    )
  }

  /// Intercepts the three transaction-control methods.
  ///
  /// Returns `None` if the method is not transaction control; otherwise
  /// the control reply: empty success, or the first rollback failure.
  pub async fn handle_control(&mut self, method: &str) -> Option<Result<Args, CommandRejected>> {
    match method {
      TRANSACTION_BEGIN => Some(Ok(self.begin())),
      TRANSACTION_COMMIT => Some(Ok(self.commit())),
      TRANSACTION_ROLLBACK => Some(self.rollback().await),
      _ => None,
    }
  }

  /// Opens a transaction bracket: clears and arms the undo stack.
  ///
  /// Begin while already inside is tolerated; the previous bracket's undos
  /// are discarded and the last begin wins.
  pub fn begin(&mut self) -> Args {
    if self.inside {
      warn!(
        discarded = self.undo_stack.len(),
        "transactionBegin while already inside a transaction; last begin wins"
      );
    }
    self.undo_stack.clear();
    self.inside = true;
    Args::new()
  }

  /// Commits the bracket: clears and disarms the undo stack without
  /// re-running anything.
  pub fn commit(&mut self) -> Args {
    self.undo_stack.clear();
    self.inside = false;
    Args::new()
  }

  /// Rolls back the bracket: replays the undo stack strictly LIFO, one
  /// undo at a time, stopping at the first failure.
  ///
  /// The stack and flag are cleared regardless of outcome. Replies with
  /// the first encountered failure, or success if none occurred or the
  /// stack was empty.
  pub async fn rollback(&mut self) -> Result<Args, CommandRejected> {
    let steps = std::mem::take(&mut self.undo_stack);
    self.inside = false;

    for step in steps.iter().rev() {
      if let Err(rejected) = step.execute().await {
        warn!(error = %rejected, "rollback halted at first failing undo");
        return Err(rejected);
      }
    }
    Ok(Args::new())
  }

  /// Appends an undo step to the stack (front = most recent).
  ///
  /// While no transaction is open the configured
  /// [`OutOfTransactionPush`] policy applies: accept with a warning, or
  /// reject with a command error.
  pub fn push(&mut self, step: UndoStep) -> Result<(), CommandRejected> {
    if !self.inside {
      match self.push_policy {
        OutOfTransactionPush::Accept => {
          warn!("undo pushed outside a transaction; accepting for best-effort tracking");
        }
        OutOfTransactionPush::Reject => {
          warn!("undo pushed outside a transaction; rejecting per configuration");
          return Err(CommandRejected::new("undo pushed outside a transaction"));
        }
      }
    }
    self.undo_stack.push(step);
    Ok(())
  }
}
