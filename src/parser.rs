//! The controller's view of G-code parsing. Lexing and parsing live
//! outside this crate; the pipeline only needs something that turns a
//! text line into an ordered batch of driver commands.

use crate::{command::CommandQueue, traits::Driver};

/// Parses text lines into driver commands. A parser is stateful (modal
/// G-code carries state between lines), so the pipeline creates one per
/// target per build segment.
pub trait GcodeParser: Send {
    /// Parse one line, appending the resulting commands to `queue`.
    fn parse(&mut self, line: &str, queue: &mut CommandQueue);
}

/// Builds parser instances targeting a particular driver. The target is
/// handed in as a read-only query so the parser can resolve
/// machine-specific details up front.
pub trait ParserFactory: Send + Sync {
    /// A fresh parser targeting `target`.
    fn make_parser(&self, target: &dyn Driver) -> Box<dyn GcodeParser>;
}
