//! A command is a unit of work executable against a driver. The G-code
//! parser turns each text line into zero or more commands; the pipeline
//! runs them in order and reacts to the control-flow signals they raise.

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;

use crate::traits::Driver;

/// How a stop condition terminates the running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// The program must halt; the build ends.
    UnconditionalHalt,
    /// The program ended normally.
    ProgramEnd,
    /// The program offers the user a choice to continue.
    OptionalHalt,
    /// The program asked to restart from the beginning. Rewind is not
    /// supported; the build ends.
    ProgramRewind,
}

/// A stop condition raised by a command, with a user-visible reason.
#[derive(Debug, Clone)]
pub struct StopCondition {
    /// How the program is halting.
    pub kind: StopKind,
    /// Message shown to the user.
    pub message: String,
}

impl StopCondition {
    /// A stop condition of the given kind.
    pub fn new(kind: StopKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Control-flow signals a command may raise instead of completing.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Transient delivery failure. The pipeline re-runs the same command
    /// on its next iteration; no new line is consumed.
    #[error("command delivery failed, retry")]
    Retry,

    /// The program raised a stop condition.
    #[error("{}", .0.message)]
    Stop(StopCondition),
}

/// An ordered queue of parsed commands awaiting execution.
pub type CommandQueue = VecDeque<Box<dyn DriverCommand>>;

/// A unit of work executable against a driver.
#[async_trait]
pub trait DriverCommand: Send + Sync {
    /// Execute against the given driver. May raise [CommandError::Retry]
    /// to be re-run, or [CommandError::Stop] to end the program.
    async fn run(&self, driver: &mut dyn Driver) -> Result<(), CommandError>;
}
