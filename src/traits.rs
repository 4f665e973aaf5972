use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::DriverError,
    model::{MachineModel, Position},
};

/// Read-only view of the machine a driver talks to. This is the interface
/// handed to G-code parsers so they can resolve machine-specific details
/// without being able to touch the device.
pub trait DriverQuery {
    /// The machine description this driver operates.
    fn machine(&self) -> &MachineModel;
}

/// The core device transport. A driver owns the connection to one
/// machine; exactly one command executes against it at a time.
///
/// Optional capabilities (capture, serial ownership, onboard parameters)
/// are probed at runtime through the `as_*` accessors, which return
/// `None` unless the driver overrides them.
#[async_trait]
pub trait Driver: DriverQuery + Send + Sync {
    /// Establish the connection to the device.
    async fn initialize(&mut self) -> Result<(), DriverError>;

    /// Tear the connection down. The driver may be re-initialized later.
    async fn uninitialize(&mut self) -> Result<(), DriverError>;

    /// True once [Driver::initialize] has succeeded and the connection is
    /// still believed healthy.
    fn is_initialized(&self) -> bool;

    /// Release every resource held by the driver. The driver is dead
    /// afterwards.
    async fn dispose(&mut self);

    /// Reset the device to a known state.
    async fn reset(&mut self) -> Result<(), DriverError>;

    /// Stop all motion. A `hard` stop also discards everything queued on
    /// the device side.
    async fn stop(&mut self, hard: bool) -> Result<(), DriverError>;

    /// Ask the device to hold its current position.
    async fn pause(&mut self) -> Result<(), DriverError>;

    /// Resume from a [Driver::pause].
    async fn unpause(&mut self) -> Result<(), DriverError>;

    /// True once the device has drained everything queued on it.
    async fn is_finished(&self) -> Result<bool, DriverError>;

    /// Surface any asynchronous error the device has flagged since the
    /// last check.
    async fn check_errors(&mut self) -> Result<(), DriverError>;

    /// Read the current position back from the device, reconciling the
    /// host's view with reality.
    async fn current_position(&mut self) -> Result<Position, DriverError>;

    /// Mark the host's position as stale. The next
    /// [Driver::current_position] must ask the device.
    fn invalidate_position(&mut self);

    /// Poll the toolhead temperatures into the machine model.
    async fn read_temperature(&mut self) -> Result<(), DriverError>;

    /// Mutable access to the machine description.
    fn machine_mut(&mut self) -> &mut MachineModel;

    /// Capture to a host-side file, if the driver supports it.
    fn as_file_capture(&mut self) -> Option<&mut dyn FileCapture> {
        None
    }

    /// Capture to and replay from on-device storage, if supported.
    fn as_sd_capture(&mut self) -> Option<&mut dyn SdCapture> {
        None
    }

    /// Serial-port ownership, if the driver holds a port.
    #[cfg(feature = "serial")]
    fn as_serial_owner(&mut self) -> Option<&mut dyn UsesSerial> {
        None
    }

    /// Parameters stored on the device itself, if readable.
    fn as_onboard_parameters(&self) -> Option<&dyn OnboardParameters> {
        None
    }
}

/// Outcome of an on-device storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdResponse {
    /// The operation succeeded.
    Success,
    /// No card is present in the slot.
    NoCard,
    /// The card did not initialize.
    InitFailed,
    /// The partition table could not be read.
    PartitionFailed,
    /// The filesystem could not be opened.
    FsFailed,
    /// The root directory could not be read.
    RootDirFailed,
    /// The card's write lock is on.
    Locked,
    /// The named file was not found on the card.
    NoFile,
    /// Any other failure.
    Generic,
}

impl SdResponse {
    /// True for [SdResponse::Success].
    pub fn is_success(&self) -> bool {
        matches!(self, SdResponse::Success)
    }

    /// The fixed user-facing message for a failure response; `None` for
    /// success.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            SdResponse::Success => None,
            SdResponse::NoCard => Some(
                "No SD card was detected. Please make sure you have a working, formatted\n\
                 SD card in the motherboard's SD slot and try again.",
            ),
            SdResponse::InitFailed => Some(
                "The SD card could not be initialized. Please make sure that\n\
                 the SD card works properly.",
            ),
            SdResponse::PartitionFailed => Some(
                "The SD card's partition table could not be read. Please check\n\
                 that the card is partitioned properly.\n\
                 If you believe your SD card is OK, try resetting your device and trying again.",
            ),
            SdResponse::FsFailed => Some(
                "The filesystem on the SD card could not be opened. Please make sure\n\
                 that the SD card has a single partition formatted with a FAT16 filesystem.",
            ),
            SdResponse::RootDirFailed => Some(
                "The root directory on the SD card could not be read. Please\n\
                 check to see if the SD card was formatted properly.",
            ),
            SdResponse::Locked => Some(
                "The SD card cannot be written to because it is locked. Remove the card,\n\
                 switch the lock off, and try again.",
            ),
            SdResponse::NoFile => Some("The build file could not be found on the SD card."),
            SdResponse::Generic => Some("Unknown SD card error."),
        }
    }
}

/// Capture the command stream to a host-side file instead of executing it.
#[async_trait]
pub trait FileCapture: Send {
    /// Start capturing; subsequent commands land in the named file.
    async fn begin_file_capture(&mut self, path: &str) -> Result<(), DriverError>;

    /// Close the capture file.
    async fn end_file_capture(&mut self) -> Result<(), DriverError>;
}

/// Capture to, and replay from, storage on the device itself.
#[async_trait]
pub trait SdCapture: Send {
    /// Start capturing to the named file on the card.
    async fn begin_capture(&mut self, name: &str) -> Result<SdResponse, DriverError>;

    /// End the capture, returning the number of bytes written.
    async fn end_capture(&mut self) -> Result<u64, DriverError>;

    /// Ask the device to replay a previously captured file on its own.
    async fn playback(&mut self, name: &str) -> Result<SdResponse, DriverError>;
}

/// Drivers that own a serial port. The controller releases the port when
/// the machine detaches so the cable is safe to unplug.
#[cfg(feature = "serial")]
pub trait UsesSerial: Send {
    /// Hand the driver a port, or `None` to release the current one.
    fn set_serial(&mut self, port: Option<tokio_serial::SerialStream>);
}

/// Drivers that can report parameters stored on the device.
#[async_trait]
pub trait OnboardParameters: Send + Sync {
    /// The machine name stored onboard, if one is set.
    async fn machine_name(&self) -> Option<String>;
}

/// A driver that consumes a command stream to predict its cost instead of
/// executing it.
pub trait EstimationDriver: Driver {
    /// Estimated wall-clock time of everything run through the driver so
    /// far.
    fn build_time(&self) -> Duration;
}

/// Builds driver instances from the opaque `driver` configuration table.
pub trait DriverFactory: Send + Sync {
    /// The main device driver.
    fn driver(&self, config: Option<&toml::Value>) -> anyhow::Result<Box<dyn Driver>>;

    /// The simulator stream, fed in parallel with builds. `None` if the
    /// factory has no simulator.
    fn simulator(&self) -> Option<Box<dyn Driver>> {
        None
    }

    /// The driver used by [crate::Controller::estimate]. `None` disables
    /// estimation.
    fn estimator(&self) -> Option<Box<dyn EstimationDriver>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd_messages() {
        assert!(SdResponse::Success.user_message().is_none());
        assert!(SdResponse::Locked.user_message().unwrap().contains("locked"));
        assert!(SdResponse::NoCard.user_message().unwrap().contains("No SD card"));
        assert!(SdResponse::Generic.user_message().is_some());
    }
}
