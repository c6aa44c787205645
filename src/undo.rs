//! Undo commands for compensating rollback.
//!
//! An [`UndoCommand`] is a captured `(method, args)` pair bound to the
//! handler registry it will be replayed against: undo commands are just
//! forward commands with inverse arguments, re-invoked through the same
//! capability table. A [`CompositeUndo`] aggregates several undos as one
//! logical unit, replayed LIFO and stopping at the first failure (partial
//! rollback is surfaced, not hidden).
//!
//! Undo execution never propagates a failure to its caller: a missing
//! capability or handler rejection is converted into a command error.

use tracing::warn;

use crate::command::{Args, Command};
use crate::handler::{CapabilityRegistry, CommandRejected};

/// A command that reverses the effect of a prior command.
///
/// Created by a command handler at the moment it mutates state, handed to
/// the transaction ledger, and owned exclusively by the ledger for the
/// lifetime of one transaction.
#[derive(Clone, Debug)]
pub struct UndoCommand {
  command: Command,
  registry: CapabilityRegistry,
}

impl UndoCommand {
  /// Creates an undo command replaying `command` against `registry`.
  pub fn new(command: Command, registry: CapabilityRegistry) -> Self {
    Self { command, registry }
  }

  /// Returns the captured command.
  pub fn command(&self) -> &Command {
    &self.command
  }

  /// Replays the captured command against the bound handler, never asking
  /// for a further undo.
  ///
  /// Any invocation failure is reported as a command rejection; it never
  /// propagates as a panic.
  pub async fn execute(&self) -> Result<Args, CommandRejected> {
    let result = self
      .registry
      .dispatch(self.command.method(), self.command.args(), false)
      .await;
    match result {
      Ok(outcome) => Ok(outcome.reply),
      Err(rejected) => {
        warn!(
          method = self.command.method(),
          error = %rejected,
          "undo command failed"
        );
        Err(rejected)
      }
    }
  }
}

/// An ordered collection of undo commands executed LIFO as a single
/// logical undo.
#[derive(Clone, Debug, Default)]
pub struct CompositeUndo {
  steps: Vec<UndoCommand>,
}

impl CompositeUndo {
  /// Creates an empty composite.
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends an undo command; appended steps are replayed in reverse.
  pub fn push(&mut self, undo: UndoCommand) {
    self.steps.push(undo);
  }

  /// Returns the number of aggregated steps.
  pub fn len(&self) -> usize {
    self.steps.len()
  }

  /// Returns true if no steps were aggregated.
  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// Executes each child LIFO, stopping at the first failure.
  ///
  /// The first failure is reported as the overall result; an empty
  /// composite succeeds.
  pub async fn execute(&self) -> Result<Args, CommandRejected> {
    for undo in self.steps.iter().rev() {
      undo.execute().await?;
    }
    Ok(Args::new())
  }
}

/// One entry on the transaction ledger's undo stack: a single undo command
/// or a composite replayed as one unit.
#[derive(Clone, Debug)]
pub enum UndoStep {
  /// A single captured undo command.
  Single(UndoCommand),
  /// Several undo commands replayed LIFO as one atomic-ish unit.
  Composite(CompositeUndo),
}

impl UndoStep {
  /// Executes this step, reporting the first failure if any.
  pub async fn execute(&self) -> Result<Args, CommandRejected> {
    match self {
      UndoStep::Single(undo) => undo.execute().await,
      UndoStep::Composite(composite) => composite.execute().await,
    }
  }
}
