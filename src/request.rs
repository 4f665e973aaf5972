//! Requests are the intents external callers submit to the worker. They
//! are drained in submission order; there is no priority lane.

use std::{fmt, sync::Arc};

use crate::{command::DriverCommand, source::GcodeSource};

/// Which transport a build's commands are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobTarget {
    /// No target selected.
    #[default]
    None,
    /// Commands execute on the physical machine.
    Machine,
    /// Commands execute on the simulator only.
    Simulator,
    /// Commands are captured to storage on the machine.
    RemoteFile,
    /// Commands are captured to a host-side file.
    File,
}

/// An intent submitted to the machine worker.
pub enum JobRequest {
    /// Establish a connection to the device.
    Connect,
    /// Reset the device.
    Reset,
    /// Pause the current build.
    Pause,
    /// Resume a paused build.
    Unpause,
    /// Abort the current build and cool the toolheads.
    Stop,
    /// Tear down the connection to the device.
    Disconnect,
    /// Walk away from a remote build without stopping it; any other build
    /// is stopped. Terminates the worker either way.
    DisconnectRemoteBuild,
    /// Build the given source on the simulator.
    Simulate {
        /// The G-code to simulate.
        source: Arc<dyn GcodeSource>,
    },
    /// Build the given source on the machine in real time.
    BuildDirect {
        /// The G-code to build.
        source: Arc<dyn GcodeSource>,
    },
    /// Build the given source into a host-side file.
    BuildToFile {
        /// The G-code to build.
        source: Arc<dyn GcodeSource>,
        /// Name of the capture file.
        remote_name: String,
    },
    /// Build the given source onto the machine's own storage.
    BuildToRemoteFile {
        /// The G-code to build.
        source: Arc<dyn GcodeSource>,
        /// Name of the file on the device.
        remote_name: String,
    },
    /// Replay a previously captured file from the machine's storage.
    BuildRemote {
        /// Name of the file on the device.
        remote_name: String,
    },
    /// Run a single command on the driver, interleaved with any build.
    RunCommand {
        /// The command to execute.
        command: Box<dyn DriverCommand>,
    },
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobRequest::Connect => "Connect",
            JobRequest::Reset => "Reset",
            JobRequest::Pause => "Pause",
            JobRequest::Unpause => "Unpause",
            JobRequest::Stop => "Stop",
            JobRequest::Disconnect => "Disconnect",
            JobRequest::DisconnectRemoteBuild => "DisconnectRemoteBuild",
            JobRequest::Simulate { .. } => "Simulate",
            JobRequest::BuildDirect { .. } => "BuildDirect",
            JobRequest::BuildToFile { .. } => "BuildToFile",
            JobRequest::BuildToRemoteFile { .. } => "BuildToRemoteFile",
            JobRequest::BuildRemote { .. } => "BuildRemote",
            JobRequest::RunCommand { .. } => "RunCommand",
        };
        f.write_str(name)
    }
}
