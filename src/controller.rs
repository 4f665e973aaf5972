//! The public face of a machine. A [Controller] owns one background
//! worker; every operation on the machine is a request scheduled onto
//! that worker.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};

use crate::{
    command::{CommandError, CommandQueue, DriverCommand},
    config::{MachineConfig, Preferences},
    events::{MachineListener, ProgressEvent, StateChangeEvent, ToolStatusEvent},
    model::{MachineModel, ToolModel},
    parser::ParserFactory,
    prompt::UserPrompt,
    request::{JobRequest, JobTarget},
    source::GcodeSource,
    state::{MachineState, State},
    traits::{Driver, DriverFactory},
    worker::Worker,
};

/// Shared handle to the driver slot. The slot is `None` between detach
/// and the next successful connect; readers must tolerate that.
pub type DriverSlot = Arc<tokio::sync::Mutex<Option<Box<dyn Driver>>>>;

/// State shared between the controller and its worker.
pub(crate) struct Inner {
    pub(crate) prefs: Preferences,
    pub(crate) warmup: Vec<String>,
    pub(crate) cooldown: Vec<String>,
    pub(crate) prompt: Arc<dyn UserPrompt>,
    pub(crate) parser_factory: Arc<dyn ParserFactory>,
    pub(crate) driver: DriverSlot,
    pub(crate) simulator: DriverSlot,
    pub(crate) has_simulator: bool,
    pub(crate) notify: Notify,
    state: Mutex<MachineState>,
    sender: Mutex<mpsc::UnboundedSender<JobRequest>>,
    listeners: Mutex<Vec<Arc<dyn MachineListener>>>,
    name: Mutex<String>,
    target: Mutex<JobTarget>,
    lines_processed: AtomicUsize,
    estimated_build_time: Mutex<Duration>,
    interrupted: AtomicBool,
}

impl Inner {
    /// Snapshot of the machine state.
    pub(crate) fn machine_state(&self) -> MachineState {
        *self.state.lock()
    }

    /// Replace the machine state. A change emits a state-change event and
    /// wakes the worker; setting the current state again is a no-op.
    pub(crate) fn set_state(&self, new: MachineState) {
        let prev = {
            let mut guard = self.state.lock();
            let prev = *guard;
            if prev == new {
                return;
            }
            *guard = new;
            prev
        };
        self.emit_state_change(prev, new);
        self.notify.notify_one();
    }

    /// Move to a new phase, keeping the pause flag where it still applies.
    pub(crate) fn set_phase(&self, phase: State) {
        let mut next = self.machine_state();
        next.set_state(phase);
        self.set_state(next);
    }

    pub(crate) fn target(&self) -> JobTarget {
        *self.target.lock()
    }

    pub(crate) fn set_target(&self, target: JobTarget) {
        *self.target.lock() = target;
    }

    /// True while a build is routed to the simulator only.
    pub(crate) fn is_simulating(&self) -> bool {
        self.machine_state().state() == State::Building && self.target() == JobTarget::Simulator
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub(crate) fn lines_processed(&self) -> usize {
        self.lines_processed.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_lines_processed(&self) {
        self.lines_processed.store(0, Ordering::SeqCst);
    }

    pub(crate) fn bump_lines_processed(&self) {
        self.lines_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn estimated_build_time(&self) -> Duration {
        *self.estimated_build_time.lock()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    /// Enqueue a request and wake the worker.
    pub(crate) fn schedule(&self, request: JobRequest) {
        if self.sender.lock().send(request).is_err() {
            tracing::debug!("request dropped, machine worker is not running");
        }
        self.notify.notify_one();
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn MachineListener>> {
        self.listeners.lock().clone()
    }

    pub(crate) fn emit_state_change(&self, previous: MachineState, current: MachineState) {
        let event = StateChangeEvent { previous, current };
        for listener in self.listeners_snapshot() {
            listener.state_changed(&event);
        }
    }

    pub(crate) fn emit_progress(&self, event: ProgressEvent) {
        for listener in self.listeners_snapshot() {
            listener.progress(&event);
        }
    }

    pub(crate) fn emit_tool_status(&self, tool: ToolModel) {
        let event = ToolStatusEvent { tool };
        for listener in self.listeners_snapshot() {
            listener.tool_status(&event);
        }
    }
}

/// Controls a single machine through a background worker. All operations
/// (building, stopping, pausing) run asynchronously on the worker; calls
/// ordinarily trigger an operation and return immediately.
pub struct Controller {
    inner: Arc<Inner>,
    drivers: Arc<dyn DriverFactory>,
    worker: Mutex<Option<JoinHandle<()>>>,
    source: Mutex<Option<Arc<dyn GcodeSource>>>,
    model: MachineModel,
}

impl Controller {
    /// Create a controller for the configured machine. The driver (and
    /// simulator, if the preferences ask for one) are built immediately;
    /// the connection is only established by [Controller::connect].
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: MachineConfig,
        preferences: Preferences,
        drivers: Arc<dyn DriverFactory>,
        parsers: Arc<dyn ParserFactory>,
        prompt: Arc<dyn UserPrompt>,
    ) -> Result<Self> {
        tracing::info!(machine = %config.name, "loading machine");

        let driver = drivers.driver(config.driver.as_ref())?;
        let simulator = if preferences.simulator {
            drivers.simulator()
        } else {
            None
        };
        let has_simulator = simulator.is_some();
        let model = MachineModel::named(&config.name);

        // Placeholder channel; spawn_worker installs the live one.
        let (sender, _) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            prefs: preferences,
            warmup: config.warmup_lines(),
            cooldown: config.cooldown_lines(),
            prompt,
            parser_factory: parsers,
            driver: Arc::new(tokio::sync::Mutex::new(Some(driver))),
            simulator: Arc::new(tokio::sync::Mutex::new(simulator)),
            has_simulator,
            notify: Notify::new(),
            state: Mutex::new(MachineState::new()),
            sender: Mutex::new(sender),
            listeners: Mutex::new(Vec::new()),
            name: Mutex::new(config.name),
            target: Mutex::new(JobTarget::None),
            lines_processed: AtomicUsize::new(0),
            estimated_build_time: Mutex::new(Duration::ZERO),
            interrupted: AtomicBool::new(false),
        });

        let controller = Self {
            inner,
            drivers,
            worker: Mutex::new(None),
            source: Mutex::new(None),
            model,
        };
        controller.spawn_worker();
        Ok(controller)
    }

    fn spawn_worker(&self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.inner.sender.lock() = sender;
        let worker = Worker::new(self.inner.clone(), receiver);
        *self.worker.lock() = Some(tokio::spawn(worker.run()));
    }

    /// Establish a connection to the device. Re-creates the worker if a
    /// previous [Controller::dispose] terminated it.
    pub fn connect(&self) {
        let dead = self.worker.lock().as_ref().map_or(true, JoinHandle::is_finished);
        if dead {
            self.inner.interrupted.store(false, Ordering::SeqCst);
            self.spawn_worker();
        }
        self.inner.schedule(JobRequest::Connect);
    }

    /// Tear down the connection to the device.
    pub fn disconnect(&self) {
        self.inner.schedule(JobRequest::Disconnect);
    }

    /// Reset the device.
    pub fn reset(&self) {
        self.inner.schedule(JobRequest::Reset);
    }

    /// Pause the current build.
    pub fn pause(&self) {
        self.inner.schedule(JobRequest::Pause);
    }

    /// Resume a paused build.
    pub fn unpause(&self) {
        self.inner.schedule(JobRequest::Unpause);
    }

    /// Abort the current build and cool the toolheads.
    pub fn stop(&self) {
        self.inner.schedule(JobRequest::Stop);
    }

    /// Replace the G-code source used by [Controller::execute],
    /// [Controller::simulate] and [Controller::upload].
    pub fn set_code_source(&self, source: Arc<dyn GcodeSource>) {
        *self.source.lock() = Some(source);
    }

    fn current_source(&self) -> Result<Arc<dyn GcodeSource>> {
        self.source
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no gcode source has been set"))
    }

    /// Build the current source on the machine in real time.
    pub async fn execute(&self) -> Result<()> {
        let source = self.current_source()?;
        self.estimate().await?;
        tracing::info!("beginning build");
        self.inner.schedule(JobRequest::BuildDirect { source });
        Ok(())
    }

    /// Build the current source on the simulator.
    pub async fn simulate(&self) -> Result<()> {
        let source = self.current_source()?;
        self.estimate().await?;
        tracing::info!("beginning simulation");
        self.inner.schedule(JobRequest::Simulate { source });
        Ok(())
    }

    /// Capture the current source to the named file on the machine's own
    /// storage.
    pub fn upload(&self, remote_name: &str) -> Result<()> {
        let source = self.current_source()?;
        self.inner.schedule(JobRequest::BuildToRemoteFile {
            source,
            remote_name: remote_name.to_owned(),
        });
        Ok(())
    }

    /// Capture the current source to a host-side file.
    ///
    /// Not implemented; [Controller::schedule] a
    /// [JobRequest::BuildToFile] directly if the attached driver supports
    /// host-side capture.
    pub fn build_to_file(&self, _path: &str) -> Result<()> {
        anyhow::bail!("building to a host-side file is not implemented");
    }

    /// Enqueue a raw request onto the worker. The command methods on this
    /// type are thin wrappers around this.
    pub fn schedule(&self, request: JobRequest) {
        self.inner.schedule(request);
    }

    /// Replay a previously captured file from the machine's storage.
    pub fn build_remote(&self, remote_name: &str) {
        self.inner.schedule(JobRequest::BuildRemote {
            remote_name: remote_name.to_owned(),
        });
    }

    /// Run a single command on the driver, interleaved with any build.
    pub fn run_command(&self, command: Box<dyn DriverCommand>) {
        self.inner.schedule(JobRequest::RunCommand { command });
    }

    /// Run the current source through the estimation driver, recording the
    /// estimated build time used in progress events. A no-op when the
    /// factory supplies no estimator or no source is set.
    pub async fn estimate(&self) -> Result<()> {
        let Some(source) = self.source.lock().clone() else {
            return Ok(());
        };
        let Some(mut estimator) = self.drivers.estimator() else {
            return Ok(());
        };

        let mut parser = self.inner.parser_factory.make_parser(&*estimator);
        let mut queue = CommandQueue::new();
        for line in source.lines() {
            parser.parse(&line, &mut queue);
            for command in queue.drain(..) {
                match command.run(estimator.as_mut()).await {
                    Ok(()) => {}
                    Err(CommandError::Retry) | Err(CommandError::Stop(_)) => {}
                }
            }
        }

        let estimate = estimator.build_time();
        *self.inner.estimated_build_time.lock() = estimate;
        tracing::info!(estimate = ?estimate, "estimated build time");
        Ok(())
    }

    /// Snapshot of the machine state at the time of the call.
    pub fn machine_state(&self) -> MachineState {
        self.inner.machine_state()
    }

    /// Display name of the machine. Onboard parameters may have replaced
    /// the configured name after a connect.
    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    /// The machine description loaded from configuration.
    pub fn model(&self) -> &MachineModel {
        &self.model
    }

    /// Lines handed to the parser in the current or last build. Useful for
    /// finding where to continue after an abort or pause.
    pub fn lines_processed(&self) -> usize {
        self.inner.lines_processed()
    }

    /// True while a build is routed to the simulator only.
    pub fn is_simulating(&self) -> bool {
        self.inner.is_simulating()
    }

    /// True when the current target executes commands interactively (the
    /// machine or the simulator) rather than capturing them.
    pub fn is_interactive_target(&self) -> bool {
        matches!(self.inner.target(), JobTarget::Machine | JobTarget::Simulator)
    }

    /// The transport the current build's commands are routed to.
    pub fn target(&self) -> JobTarget {
        self.inner.target()
    }

    /// True once the driver reports an established connection.
    pub async fn is_initialized(&self) -> bool {
        self.inner
            .driver
            .lock()
            .await
            .as_ref()
            .map_or(false, |driver| driver.is_initialized())
    }

    /// True while the current build is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.machine_state().is_paused()
    }

    /// Shared handle to the driver slot. Prefer the controller surface;
    /// driving the device directly races the worker.
    pub fn driver(&self) -> DriverSlot {
        tracing::warn!("the driver should not be driven directly");
        self.inner.driver.clone()
    }

    /// Shared handle to the simulator slot.
    pub fn simulator_driver(&self) -> DriverSlot {
        self.inner.simulator.clone()
    }

    /// Register a listener. It immediately receives a state-change event
    /// carrying the current state.
    pub fn add_machine_state_listener(&self, listener: Arc<dyn MachineListener>) {
        self.inner.listeners.lock().push(listener.clone());
        let current = self.inner.machine_state();
        listener.state_changed(&StateChangeEvent {
            previous: current,
            current,
        });
    }

    /// Unregister a listener. Emissions already in flight still reach it.
    pub fn remove_machine_state_listener(&self, listener: &Arc<dyn MachineListener>) {
        self.inner
            .listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    /// Shut the controller down: terminate the worker (5 second grace,
    /// then interrupt), dispose the drivers, and detach.
    pub async fn dispose(&self) {
        self.inner.schedule(JobRequest::DisconnectRemoteBuild);

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                tracing::warn!("machine worker did not stop in time, interrupting");
                self.inner.interrupted.store(true, Ordering::SeqCst);
                self.inner.notify.notify_one();
                if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        }

        if let Some(driver) = self.inner.driver.lock().await.as_deref_mut() {
            driver.dispose().await;
        }
        if let Some(simulator) = self.inner.simulator.lock().await.as_deref_mut() {
            simulator.dispose().await;
        }

        self.inner.set_state(MachineState::new());
    }
}
