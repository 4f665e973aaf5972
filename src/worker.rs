//! The machine worker: a background task that owns the driver and does
//! all the talking to the device. External callers only ever enqueue
//! requests; the worker drains them in submission order and dispatches on
//! the machine phase.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;

use crate::{
    command::CommandError,
    controller::Inner,
    request::{JobRequest, JobTarget},
    source::GcodeSource,
    state::State,
};

pub(crate) struct Worker {
    pub(crate) inner: Arc<Inner>,
    pub(crate) requests: mpsc::UnboundedReceiver<JobRequest>,
    pub(crate) running: bool,
    pub(crate) current_source: Option<Arc<dyn GcodeSource>>,
    pub(crate) remote_name: Option<String>,
    pub(crate) lines_total: usize,
    pub(crate) start_time: Option<Instant>,
    pub(crate) polling_enabled: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) last_polled: Option<Instant>,
}

impl Worker {
    pub(crate) fn new(inner: Arc<Inner>, requests: mpsc::UnboundedReceiver<JobRequest>) -> Self {
        Self {
            inner,
            requests,
            running: true,
            current_source: None,
            remote_name: None,
            lines_total: 0,
            start_time: None,
            polling_enabled: false,
            poll_interval: Duration::from_millis(1000),
            last_polled: None,
        }
    }

    /// Main worker loop. Runs until a disconnect request lands or the
    /// controller interrupts it; anything else that goes wrong is logged
    /// and the loop keeps dispatching.
    pub(crate) async fn run(mut self) {
        tracing::debug!("machine worker started");
        loop {
            if self.inner.interrupted() {
                tracing::warn!("machine worker interrupted");
                return;
            }

            self.drain_requests().await;

            let phase = self.inner.machine_state().state();
            if !self.running && phase != State::Stopping {
                break;
            }

            match phase {
                State::Building => match self.inner.target() {
                    JobTarget::RemoteFile => {
                        if !self.start_build_to_remote_file().await {
                            self.inner.set_phase(State::Stopping);
                        }
                    }
                    JobTarget::File => {
                        if !self.start_build_to_file().await {
                            self.inner.set_phase(State::Stopping);
                        }
                    }
                    _ => self.build_internal().await,
                },

                State::BuildingRemote => self.build_remote_internal().await,

                State::Connecting => self.connect_driver().await,

                State::Stopping => {
                    self.stop_driver_hard().await;
                    self.inner.set_phase(State::Ready);
                }

                State::Reset => {
                    self.reset_driver().await;
                    self.read_name().await;
                    self.inner.set_phase(State::Ready);
                }

                State::NotAttached => {
                    self.release_serial().await;
                    self.inner.notify.notified().await;
                }

                State::Ready => {
                    self.inner.notify.notified().await;
                }
            }
        }
        tracing::debug!("machine worker terminated");
    }

    /// Apply every request waiting in the queue, in submission order.
    pub(crate) async fn drain_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            self.run_request(request).await;
        }
    }

    async fn run_request(&mut self, request: JobRequest) {
        tracing::debug!(request = ?request, "applying request");
        match request {
            JobRequest::Connect => {
                if self.inner.machine_state().state() == State::NotAttached {
                    self.inner.set_phase(State::Connecting);
                }
            }

            JobRequest::Reset => {
                if self.inner.machine_state().is_connected() {
                    self.inner.set_phase(State::Reset);
                }
            }

            JobRequest::Simulate { source } => {
                self.current_source = Some(source);
                self.inner.set_target(JobTarget::Simulator);
                self.inner.set_phase(State::Building);
            }

            JobRequest::BuildDirect { source } => {
                self.current_source = Some(source);
                self.inner.set_target(JobTarget::Machine);
                self.inner.set_phase(State::Building);
            }

            JobRequest::BuildToFile { source, remote_name } => {
                self.current_source = Some(source);
                self.remote_name = Some(remote_name);
                self.inner.set_target(JobTarget::File);
                self.inner.set_phase(State::Building);
            }

            JobRequest::BuildToRemoteFile { source, remote_name } => {
                self.current_source = Some(source);
                self.remote_name = Some(remote_name);
                self.inner.set_target(JobTarget::RemoteFile);
                self.inner.set_phase(State::Building);
            }

            JobRequest::BuildRemote { remote_name } => {
                self.remote_name = Some(remote_name);
                self.inner.set_phase(State::BuildingRemote);
            }

            JobRequest::Pause => {
                let mut state = self.inner.machine_state();
                if state.is_building() && !state.is_paused() {
                    state.set_paused(true);
                    self.inner.set_state(state);
                }
            }

            JobRequest::Unpause => {
                let mut state = self.inner.machine_state();
                if state.is_building() && state.is_paused() {
                    state.set_paused(false);
                    self.inner.set_state(state);
                }
            }

            JobRequest::Stop => {
                // Cool the toolheads whether or not a build is running.
                {
                    let mut guard = self.inner.driver.lock().await;
                    if let Some(driver) = guard.as_deref_mut() {
                        let tool = driver.machine_mut().current_tool_mut();
                        tool.set_target_temperature(0.0);
                        tool.set_platform_target_temperature(0.0);
                    }
                }
                if self.inner.machine_state().is_building() {
                    self.inner.set_phase(State::Stopping);
                }
            }

            JobRequest::Disconnect => {
                let mut guard = self.inner.driver.lock().await;
                if let Some(driver) = guard.as_deref_mut() {
                    if let Err(e) = driver.uninitialize().await {
                        tracing::error!(error = %e, "uninitialize failed");
                    }
                }
                drop(guard);
                self.inner.set_phase(State::NotAttached);
            }

            JobRequest::DisconnectRemoteBuild => {
                if self.inner.machine_state().state() == State::BuildingRemote {
                    // Send no further packets; the machine finishes on
                    // its own.
                    self.running = false;
                    return;
                }
                if self.inner.machine_state().is_building() {
                    self.inner.set_phase(State::Stopping);
                }
                self.running = false;
            }

            JobRequest::RunCommand { command } => loop {
                let mut guard = self.inner.driver.lock().await;
                let Some(driver) = guard.as_deref_mut() else {
                    tracing::error!("no driver attached, dropping ad-hoc command");
                    break;
                };
                match command.run(driver).await {
                    Ok(()) => break,
                    Err(CommandError::Retry) => continue,
                    Err(CommandError::Stop(condition)) => {
                        tracing::debug!(message = %condition.message, "ad-hoc command raised a stop, ignoring");
                        break;
                    }
                }
            },
        }
    }

    async fn connect_driver(&mut self) {
        let initialized = {
            let mut guard = self.inner.driver.lock().await;
            match guard.as_deref_mut() {
                Some(driver) => match driver.initialize().await {
                    Ok(()) => driver.is_initialized(),
                    Err(e) => {
                        tracing::error!(error = %e, "driver initialization failed");
                        false
                    }
                },
                None => {
                    tracing::error!("no driver to initialize");
                    false
                }
            }
        };

        if initialized {
            self.read_name().await;
            self.inner.set_phase(State::Ready);
        } else {
            self.inner.set_phase(State::NotAttached);
        }
    }

    /// Read the machine name stored on the device, falling back to the
    /// configured name when the device has none.
    async fn read_name(&self) {
        let name = {
            let guard = self.inner.driver.lock().await;
            match guard.as_deref() {
                Some(driver) => match driver.as_onboard_parameters() {
                    Some(params) => params.machine_name().await,
                    None => None,
                },
                None => None,
            }
        };
        if let Some(name) = name {
            if !name.is_empty() {
                self.inner.set_name(name);
            }
        }
    }

    pub(crate) async fn stop_driver_hard(&self) {
        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            if let Err(e) = driver.stop(true).await {
                tracing::error!(error = %e, "hard stop failed");
            }
        }
    }

    async fn reset_driver(&self) {
        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            if let Err(e) = driver.reset().await {
                tracing::error!(error = %e, "driver reset failed");
            }
        }
    }

    /// Release the serial port while detached so the cable is safe to
    /// unplug.
    async fn release_serial(&self) {
        #[cfg(feature = "serial")]
        {
            let mut guard = self.inner.driver.lock().await;
            if let Some(driver) = guard.as_deref_mut() {
                if let Some(serial) = driver.as_serial_owner() {
                    serial.set_serial(None);
                }
            }
        }
    }
}
