//! The build pipeline: pulls lines from a G-code source, parses them into
//! commands, and feeds those to the driver (and, in parallel, to the
//! simulator) while honouring pause, stop, retry and halt conditions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    command::{CommandError, CommandQueue, StopKind},
    error::BuildError,
    events::ProgressEvent,
    request::JobTarget,
    source::{GcodeSource, StringListSource},
    state::State,
    traits::SdResponse,
    worker::Worker,
};

/// How often the pipeline re-checks the device while waiting for it to
/// drain its queue at the end of a segment.
const FINISH_POLL: Duration = Duration::from_millis(100);

/// How often temperatures are polled during a build.
const STATUS_POLL: Duration = Duration::from_millis(1000);

impl Worker {
    /// True when the simulator stream should receive the parsed commands:
    /// either the build targets the simulator, or the preferences ask for
    /// machine builds to be mirrored into it.
    fn simulator_active(&self) -> bool {
        self.inner.has_simulator
            && (self.inner.target() == JobTarget::Simulator || self.inner.prefs.show_simulator)
    }

    /// Build one G-code segment. Returns `Ok(true)` if the segment ran to
    /// its end (or a stop condition ended it deliberately), `Ok(false)` if
    /// the machine left the building state underneath us.
    pub(crate) async fn build_codes(&mut self, source: Arc<dyn GcodeSource>) -> Result<bool, BuildError> {
        if !self.inner.machine_state().is_building() {
            return Ok(false);
        }

        // One parser per target; modal parser state is per-segment.
        let mut driver_parser = {
            let guard = self.inner.driver.lock().await;
            let Some(driver) = guard.as_deref() else {
                tracing::error!("no driver attached, refusing to build");
                return Ok(false);
            };
            self.inner.parser_factory.make_parser(driver)
        };
        let mut driver_queue = CommandQueue::new();

        let mut simulator_parser = {
            let guard = self.inner.simulator.lock().await;
            guard.as_deref().map(|sim| self.inner.parser_factory.make_parser(sim))
        };
        let mut simulator_queue = CommandQueue::new();

        let mut lines = source.lines();
        let mut retry = false;

        loop {
            // Read and process the next line, unless the head of the
            // queue asked to be retried.
            if !retry {
                if self.inner.interrupted() {
                    return Err(BuildError::Interrupted);
                }

                let Some(line) = lines.next() else { break };
                self.inner.bump_lines_processed();

                if self.simulator_active() {
                    if let Some(parser) = simulator_parser.as_mut() {
                        parser.parse(&line, &mut simulator_queue);
                    }
                }
                if !self.inner.is_simulating() {
                    driver_parser.parse(&line, &mut driver_queue);
                }

                // Run everything against the simulator; it swallows
                // retries and stop conditions.
                if self.simulator_active() && !simulator_queue.is_empty() {
                    let mut guard = self.inner.simulator.lock().await;
                    if let Some(simulator) = guard.as_deref_mut() {
                        for command in simulator_queue.drain(..) {
                            if let Err(CommandError::Stop(condition)) = command.run(simulator).await {
                                tracing::trace!(message = %condition.message, "simulator ignored stop condition");
                            }
                        }
                    } else {
                        simulator_queue.clear();
                    }
                }
            }

            // Run the queued commands on the machine, peeking so a retry
            // leaves the head command in place.
            if !self.inner.is_simulating() {
                retry = false;
                let mut stop = None;
                {
                    let mut guard = self.inner.driver.lock().await;
                    let Some(driver) = guard.as_deref_mut() else {
                        tracing::error!("driver went away mid-build");
                        return Ok(false);
                    };
                    while let Some(command) = driver_queue.front() {
                        match command.run(driver).await {
                            Ok(()) => {
                                driver_queue.pop_front();
                            }
                            Err(CommandError::Retry) => {
                                tracing::debug!("command delivery failed, retrying");
                                retry = true;
                                break;
                            }
                            Err(CommandError::Stop(condition)) => {
                                stop = Some(condition);
                                break;
                            }
                        }
                    }
                }

                if let Some(condition) = stop {
                    match condition.kind {
                        StopKind::UnconditionalHalt => {
                            self.inner
                                .prompt
                                .info("Unconditional halt: build ended", &condition.message)
                                .await;
                            return Ok(true);
                        }
                        StopKind::ProgramEnd => {
                            self.inner
                                .prompt
                                .info("Program end: build ended", &condition.message)
                                .await;
                            return Ok(true);
                        }
                        StopKind::ProgramRewind => {
                            // Rewind is not supported; end the build.
                            self.inner
                                .prompt
                                .info("Program rewind: build ended", &condition.message)
                                .await;
                            return Ok(true);
                        }
                        StopKind::OptionalHalt => {
                            if self.inner.prompt.confirm(&condition.message).await {
                                driver_queue.pop_front();
                            } else {
                                return Ok(true);
                            }
                        }
                    }
                }
            }

            // Did the device flag anything since the last line?
            if !self.inner.is_simulating() {
                let mut guard = self.inner.driver.lock().await;
                if let Some(driver) = guard.as_deref_mut() {
                    if let Err(e) = driver.check_errors().await {
                        tracing::error!(error = %e, "device flagged an error");
                    }
                }
            }

            // Pause reaches down into the driver, not just this loop.
            if self.inner.machine_state().is_paused() {
                if !self.inner.is_simulating() {
                    self.pause_driver().await;
                }
                while self.inner.machine_state().is_paused() {
                    if self.inner.interrupted() {
                        return Err(BuildError::Interrupted);
                    }
                    self.inner.notify.notified().await;
                    self.drain_requests().await;
                }
                if !self.inner.is_simulating() {
                    self.unpause_driver().await;
                }
            }

            let phase = self.inner.machine_state().state();
            if matches!(phase, State::Stopping | State::Reset) {
                if !self.inner.is_simulating() {
                    self.stop_driver_hard().await;
                }
                return Err(BuildError::Aborted);
            }
            if phase != State::Building {
                return Ok(false);
            }

            if self.polling_enabled {
                let due = self.last_polled.map_or(true, |last| last.elapsed() >= self.poll_interval);
                if due {
                    self.last_polled = Some(Instant::now());
                    self.poll_status().await;
                }
            }

            self.inner.emit_progress(ProgressEvent {
                elapsed: self.start_time.map(|start| start.elapsed()).unwrap_or_default(),
                estimated_total: self.inner.estimated_build_time(),
                lines_processed: self.inner.lines_processed(),
                lines_total: self.lines_total,
            });

            // Let pause/stop/ad-hoc commands land mid-line.
            self.drain_requests().await;
        }

        // Wait for the device to drain everything queued on it. Stops
        // arriving after the last line still take effect here.
        if !self.inner.is_simulating() {
            loop {
                let finished = {
                    let guard = self.inner.driver.lock().await;
                    match guard.as_deref() {
                        Some(driver) => match driver.is_finished().await {
                            Ok(finished) => finished,
                            Err(e) => {
                                tracing::error!(error = %e, "finish poll failed, assuming drained");
                                true
                            }
                        },
                        None => true,
                    }
                };
                if finished {
                    break;
                }

                let phase = self.inner.machine_state().state();
                if matches!(phase, State::Stopping | State::Reset) {
                    self.stop_driver_hard().await;
                    return Err(BuildError::Aborted);
                }
                if phase != State::Building {
                    return Ok(false);
                }
                if self.inner.interrupted() {
                    return Err(BuildError::Interrupted);
                }

                self.drain_requests().await;
                tokio::time::sleep(FINISH_POLL).await;
            }
        }

        Ok(true)
    }

    /// Build the current source, bracketed with the warmup and cooldown
    /// blocks, and land in the right terminal state.
    pub(crate) async fn build_internal(&mut self) {
        let Some(source) = self.current_source.clone() else {
            tracing::error!("no gcode source selected, cannot build");
            self.inner.set_phase(State::Ready);
            return;
        };

        let warmup: Arc<dyn GcodeSource> = Arc::new(StringListSource::new(self.inner.warmup.clone()));
        let cooldown: Arc<dyn GcodeSource> = Arc::new(StringListSource::new(self.inner.cooldown.clone()));

        self.start_time = Some(Instant::now());
        self.inner.reset_lines_processed();
        self.lines_total = warmup.line_count() + cooldown.line_count() + source.line_count();

        self.start_status_polling(STATUS_POLL);
        let result = self.run_segments(warmup, source, cooldown).await;
        match result {
            Ok(()) => {
                let next = if self.driver_initialized().await {
                    State::Ready
                } else {
                    State::NotAttached
                };
                self.inner.set_phase(next);
            }
            Err(BuildError::Interrupted) => {
                tracing::warn!("machine worker interrupted mid-build");
            }
            Err(e) => {
                if self.inner.is_simulating() {
                    tracing::warn!(error = %e, "simulated build ended early");
                    let next = if self.driver_initialized().await {
                        State::Ready
                    } else {
                        State::NotAttached
                    };
                    self.inner.set_phase(next);
                } else {
                    // Reestablish the connection to verify the machine
                    // state after an abort or failure.
                    tracing::warn!(error = %e, "build ended early, reconnecting");
                    self.inner.set_phase(State::Connecting);
                }
            }
        }
        self.stop_status_polling();
    }

    async fn run_segments(
        &mut self,
        warmup: Arc<dyn GcodeSource>,
        source: Arc<dyn GcodeSource>,
        cooldown: Arc<dyn GcodeSource>,
    ) -> Result<(), BuildError> {
        if !self.inner.is_simulating() {
            let mut guard = self.inner.driver.lock().await;
            if let Some(driver) = guard.as_deref_mut() {
                // Reconcile the host's idea of the position with reality.
                driver.current_position().await?;
            }
        }

        tracing::info!("running warmup commands");
        self.build_codes(warmup).await?;

        tracing::info!("running build");
        self.build_codes(source).await?;

        tracing::info!("running cooldown commands");
        self.build_codes(cooldown).await?;

        if !self.inner.is_simulating() {
            let mut guard = self.inner.driver.lock().await;
            if let Some(driver) = guard.as_deref_mut() {
                driver.invalidate_position();
            }
        }
        Ok(())
    }

    /// Capture a build onto the machine's own storage. Returns false if
    /// the capture could not start or end.
    pub(crate) async fn start_build_to_remote_file(&mut self) -> bool {
        let Some(name) = self.remote_name.clone() else {
            return false;
        };

        let response = {
            let mut guard = self.inner.driver.lock().await;
            let Some(driver) = guard.as_deref_mut() else {
                return false;
            };
            let Some(capture) = driver.as_sd_capture() else {
                tracing::error!("driver cannot capture to on-device storage");
                return false;
            };
            match capture.begin_capture(&name).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "could not begin capture");
                    return false;
                }
            }
        };
        if !self.process_sd_response(response).await {
            return false;
        }

        self.build_internal().await;

        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            if let Some(capture) = driver.as_sd_capture() {
                match capture.end_capture().await {
                    Ok(bytes) => tracing::info!(bytes, "capture complete"),
                    Err(e) => tracing::error!(error = %e, "could not end capture"),
                }
            }
        }
        true
    }

    /// Capture a build into a host-side file through the driver.
    pub(crate) async fn start_build_to_file(&mut self) -> bool {
        let Some(name) = self.remote_name.clone() else {
            return false;
        };

        {
            let mut guard = self.inner.driver.lock().await;
            let Some(driver) = guard.as_deref_mut() else {
                return false;
            };
            let Some(capture) = driver.as_file_capture() else {
                tracing::error!("driver cannot capture to a file");
                return false;
            };
            if let Err(e) = capture.begin_file_capture(&name).await {
                tracing::error!(error = %e, "could not begin file capture");
                return false;
            }
        }

        self.build_internal().await;

        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            if let Some(capture) = driver.as_file_capture() {
                if let Err(e) = capture.end_file_capture().await {
                    tracing::error!(error = %e, "could not end file capture");
                }
            }
        }
        true
    }

    /// Run a build from the machine's own storage, polling for completion
    /// while honouring pause and stop.
    pub(crate) async fn build_remote_internal(&mut self) {
        let Some(name) = self.remote_name.clone() else {
            tracing::warn!("no remote file selected");
            self.inner.set_phase(State::Stopping);
            return;
        };
        if self.inner.machine_state().state() != State::BuildingRemote {
            return;
        }

        let response = {
            let mut guard = self.inner.driver.lock().await;
            match guard.as_deref_mut() {
                Some(driver) => {
                    if let Err(e) = driver.current_position().await {
                        tracing::error!(error = %e, "could not reconcile position");
                    }
                    match driver.as_sd_capture() {
                        Some(capture) => match capture.playback(&name).await {
                            Ok(response) => Some(response),
                            Err(e) => {
                                tracing::error!(error = %e, "playback failed");
                                None
                            }
                        },
                        None => {
                            tracing::error!("driver cannot replay from on-device storage");
                            None
                        }
                    }
                }
                None => None,
            }
        };
        let Some(response) = response else {
            self.inner.set_phase(State::Stopping);
            return;
        };
        if !self.process_sd_response(response).await {
            self.inner.set_phase(State::Stopping);
            return;
        }

        while self.running {
            let finished = {
                let guard = self.inner.driver.lock().await;
                match guard.as_deref() {
                    Some(driver) => match driver.is_finished().await {
                        Ok(finished) => finished,
                        Err(e) => {
                            tracing::error!(error = %e, "finish poll failed, assuming drained");
                            true
                        }
                    },
                    None => true,
                }
            };
            if finished {
                break;
            }

            self.drain_requests().await;

            if self.inner.machine_state().is_paused() {
                self.pause_driver().await;
                while self.inner.machine_state().is_paused() {
                    if self.inner.interrupted() {
                        return;
                    }
                    self.inner.notify.notified().await;
                    self.drain_requests().await;
                }
                self.unpause_driver().await;
            }

            if self.inner.machine_state().state() != State::BuildingRemote {
                return;
            }
            if self.inner.interrupted() {
                return;
            }

            // A pause or stop notifies us ahead of the timeout.
            let _ = tokio::time::timeout(Duration::from_secs(1), self.inner.notify.notified()).await;
        }

        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            driver.invalidate_position();
        }
        drop(guard);
        self.inner.set_phase(State::Ready);
    }

    /// Translate an SD response into a user dialog. Returns true when the
    /// operation may proceed.
    pub(crate) async fn process_sd_response(&self, response: SdResponse) -> bool {
        match response.user_message() {
            None => true,
            Some(message) => {
                self.inner.prompt.info("SD card error", message).await;
                false
            }
        }
    }

    /// Poll the toolhead temperatures and publish them, if monitoring is
    /// switched on.
    async fn poll_status(&self) {
        if !self.inner.machine_state().is_building() || self.inner.is_simulating() {
            return;
        }
        if !self.inner.prefs.monitor_temp {
            return;
        }

        let tool = {
            let mut guard = self.inner.driver.lock().await;
            let Some(driver) = guard.as_deref_mut() else {
                return;
            };
            if let Err(e) = driver.read_temperature().await {
                tracing::error!(error = %e, "temperature poll failed");
                return;
            }
            driver.machine().current_tool().clone()
        };
        self.inner.emit_tool_status(tool);
    }

    async fn pause_driver(&self) {
        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            if let Err(e) = driver.pause().await {
                tracing::error!(error = %e, "driver pause failed");
            }
        }
    }

    async fn unpause_driver(&self) {
        let mut guard = self.inner.driver.lock().await;
        if let Some(driver) = guard.as_deref_mut() {
            if let Err(e) = driver.unpause().await {
                tracing::error!(error = %e, "driver unpause failed");
            }
        }
    }

    async fn driver_initialized(&self) -> bool {
        self.inner
            .driver
            .lock()
            .await
            .as_ref()
            .map_or(false, |driver| driver.is_initialized())
    }

    fn start_status_polling(&mut self, interval: Duration) {
        self.polling_enabled = true;
        self.poll_interval = interval;
        self.last_polled = None;
    }

    fn stop_status_polling(&mut self) {
        self.polling_enabled = false;
    }
}
