//! Error taxonomy for builds and drivers.

use thiserror::Error;

/// Why a build terminated without completing.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The worker was told to shut down mid-build.
    #[error("build was interrupted")]
    Interrupted,

    /// A user-initiated stop or reset was observed mid-build.
    #[error("build manually aborted")]
    Aborted,

    /// The driver refused to carry the build further.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors surfaced by a device driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No driver is attached to the controller.
    #[error("no driver attached")]
    NotAttached,

    /// The transport to the device failed.
    #[error("device i/o error: {0}")]
    Io(String),

    /// The device reported an error condition.
    #[error("device reported: {0}")]
    Device(String),
}
