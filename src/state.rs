//! The machine-wide state: a lifecycle phase plus a pause flag. State
//! transitions are the only way the worker changes behaviour, and every
//! transition is observable through a state-change event.

/// Primary phase of the machine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No device attached; the serial port, if any, has been released.
    NotAttached,
    /// Driver initialization is in progress.
    Connecting,
    /// Connected and idle, ready for a job.
    Ready,
    /// Streaming a build to the driver, a capture target, or the simulator.
    Building,
    /// The device is running a build from its own storage.
    BuildingRemote,
    /// A stop was requested; the driver is being halted.
    Stopping,
    /// A reset was requested; the driver is being reset.
    Reset,
}

/// Composite machine state. Snapshots handed to callers are plain copies;
/// mutating one has no effect on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    state: State,
    paused: bool,
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineState {
    /// The detached initial state.
    pub fn new() -> Self {
        Self {
            state: State::NotAttached,
            paused: false,
        }
    }

    /// An unpaused state in the given phase.
    pub fn with_state(state: State) -> Self {
        Self { state, paused: false }
    }

    /// The lifecycle phase.
    pub fn state(&self) -> State {
        self.state
    }

    /// True while a build is in progress, local or remote.
    pub fn is_building(&self) -> bool {
        matches!(self.state, State::Building | State::BuildingRemote)
    }

    /// True once a connection to the device has been established.
    pub fn is_connected(&self) -> bool {
        !matches!(self.state, State::NotAttached | State::Connecting)
    }

    /// True when connected and idle.
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// True while a build is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Move to a new phase. Leaving the building phases clears the pause
    /// flag, so `paused` implies `is_building` at all times.
    pub fn set_state(&mut self, state: State) {
        self.state = state;
        if !self.is_building() {
            self.paused = false;
        }
    }

    /// Set the pause flag. Only meaningful while building; ignored
    /// otherwise.
    pub fn set_paused(&mut self, paused: bool) {
        if self.is_building() {
            self.paused = paused;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        let s = MachineState::with_state(State::Building);
        assert!(s.is_building());
        assert!(s.is_connected());
        assert!(!s.is_ready());

        let s = MachineState::with_state(State::Connecting);
        assert!(!s.is_connected());

        assert!(MachineState::with_state(State::Ready).is_ready());
    }

    #[test]
    fn pause_requires_building() {
        let mut s = MachineState::with_state(State::Ready);
        s.set_paused(true);
        assert!(!s.is_paused());

        s.set_state(State::Building);
        s.set_paused(true);
        assert!(s.is_paused());
    }

    #[test]
    fn leaving_build_clears_pause() {
        let mut s = MachineState::with_state(State::Building);
        s.set_paused(true);
        s.set_state(State::Stopping);
        assert!(!s.is_paused());

        let mut s = MachineState::with_state(State::Building);
        s.set_paused(true);
        s.set_state(State::BuildingRemote);
        assert!(s.is_paused());
    }
}
