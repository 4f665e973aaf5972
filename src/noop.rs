//! `noop` implements a no-op driver, one that will accept every command
//! and do exactly nothing with it. It claims the capture capabilities so
//! the full controller surface can be exercised without hardware; it also
//! serves as the stock simulator stand-in.

use async_trait::async_trait;

use crate::{
    error::DriverError,
    model::{MachineModel, Position},
    traits::{Driver, DriverQuery, FileCapture, SdCapture, SdResponse},
};

/// A driver that no-ops, well, everything.
pub struct Noop {
    machine: MachineModel,
    initialized: bool,
    position: Option<Position>,
}

impl Noop {
    /// A no-op driver operating a machine with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            machine: MachineModel::named(name),
            initialized: false,
            position: None,
        }
    }
}

impl DriverQuery for Noop {
    fn machine(&self) -> &MachineModel {
        &self.machine
    }
}

#[async_trait]
impl Driver for Noop {
    async fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialized = true;
        Ok(())
    }

    async fn uninitialize(&mut self) -> Result<(), DriverError> {
        self.initialized = false;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn dispose(&mut self) {
        self.initialized = false;
    }

    async fn reset(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop(&mut self, _hard: bool) -> Result<(), DriverError> {
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn unpause(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn is_finished(&self) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn check_errors(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn current_position(&mut self) -> Result<Position, DriverError> {
        let position = self.position.unwrap_or_default();
        self.position = Some(position);
        Ok(position)
    }

    fn invalidate_position(&mut self) {
        self.position = None;
    }

    async fn read_temperature(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn machine_mut(&mut self) -> &mut MachineModel {
        &mut self.machine
    }

    fn as_file_capture(&mut self) -> Option<&mut dyn FileCapture> {
        Some(self)
    }

    fn as_sd_capture(&mut self) -> Option<&mut dyn SdCapture> {
        Some(self)
    }
}

#[async_trait]
impl FileCapture for Noop {
    async fn begin_file_capture(&mut self, _path: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn end_file_capture(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl SdCapture for Noop {
    async fn begin_capture(&mut self, _name: &str) -> Result<SdResponse, DriverError> {
        Ok(SdResponse::Success)
    }

    async fn end_capture(&mut self) -> Result<u64, DriverError> {
        Ok(0)
    }

    async fn playback(&mut self, _name: &str) -> Result<SdResponse, DriverError> {
        Ok(SdResponse::Success)
    }
}
