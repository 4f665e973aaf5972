#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate drives a single G-code machine (a 3D printer or similar
//! device) through builds while staying responsive to user intents:
//! connect, pause, resume, stop, reset, ad-hoc commands, disconnect.
//!
//! A [Controller] owns a background worker task which in turn owns the
//! device driver. Calls on the controller ordinarily enqueue a request and
//! return immediately; the worker drains the queue and walks the machine
//! state graph. While building it streams parsed commands to the driver,
//! to on-device storage, to a host-side file, or to a simulator.

mod command;
mod config;
mod controller;
mod error;
mod events;
mod model;
pub mod noop;
mod parser;
mod pipeline;
mod prompt;
mod request;
mod source;
mod state;
mod traits;
mod worker;

#[cfg(test)]
mod tests;

pub use command::{CommandError, CommandQueue, DriverCommand, StopCondition, StopKind};
pub use config::{MachineConfig, Preferences};
pub use controller::{Controller, DriverSlot};
pub use error::{BuildError, DriverError};
pub use events::{MachineListener, ProgressEvent, StateChangeEvent, ToolStatusEvent};
pub use model::{MachineModel, Position, ToolModel};
pub use parser::{GcodeParser, ParserFactory};
pub use prompt::{HeadlessPrompt, UserPrompt};
pub use request::{JobRequest, JobTarget};
pub use source::{GcodeFile, GcodeSource, StringListSource};
pub use state::{MachineState, State};
#[cfg(feature = "serial")]
pub use traits::UsesSerial;
pub use traits::{
    Driver, DriverFactory, DriverQuery, EstimationDriver, FileCapture, OnboardParameters, SdCapture, SdResponse,
};
