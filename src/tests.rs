use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use crate::{
    CommandError, CommandQueue, Controller, Driver, DriverCommand, DriverError, DriverFactory, DriverQuery,
    EstimationDriver, FileCapture, GcodeParser, JobRequest, MachineConfig, MachineListener, MachineModel,
    MachineState, ParserFactory, Position, Preferences, ProgressEvent, SdCapture, SdResponse, State, StateChangeEvent,
    StopCondition, StopKind, StringListSource, UserPrompt,
};

/// Counters and logs shared between a test and the driver the controller
/// owns.
#[derive(Default)]
struct DriverProbe {
    pause_calls: AtomicUsize,
    unpause_calls: AtomicUsize,
    hard_stops: AtomicUsize,
    begin_captures: Mutex<Vec<String>>,
    file_captures: Mutex<Vec<String>>,
    playbacks: Mutex<Vec<String>>,
    /// What `is_finished` reports. Defaults to drained.
    finished: AtomicBool,
}

impl DriverProbe {
    fn new() -> Arc<Self> {
        let probe = Self::default();
        probe.finished.store(true, Ordering::SeqCst);
        Arc::new(probe)
    }
}

struct TestDriver {
    machine: MachineModel,
    initialized: bool,
    probe: Arc<DriverProbe>,
    sd_begin_response: SdResponse,
    build_time: Duration,
}

impl TestDriver {
    fn new(name: &str, probe: Arc<DriverProbe>, sd_begin_response: SdResponse) -> Self {
        Self {
            machine: MachineModel::named(name),
            initialized: false,
            probe,
            sd_begin_response,
            build_time: Duration::ZERO,
        }
    }
}

impl DriverQuery for TestDriver {
    fn machine(&self) -> &MachineModel {
        &self.machine
    }
}

#[async_trait]
impl Driver for TestDriver {
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

    async fn stop(&mut self, hard: bool) -> Result<(), DriverError> {
        if hard {
            self.probe.hard_stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), DriverError> {
        self.probe.pause_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unpause(&mut self) -> Result<(), DriverError> {
        self.probe.unpause_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_finished(&self) -> Result<bool, DriverError> {
        Ok(self.probe.finished.load(Ordering::SeqCst))
    }

    async fn check_errors(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn current_position(&mut self) -> Result<Position, DriverError> {
        Ok(Position::default())
    }

    fn invalidate_position(&mut self) {}

    async fn read_temperature(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn machine_mut(&mut self) -> &mut MachineModel {
        &mut self.machine
    }

    fn as_sd_capture(&mut self) -> Option<&mut dyn SdCapture> {
        Some(self)
    }

    fn as_file_capture(&mut self) -> Option<&mut dyn FileCapture> {
        Some(self)
    }
}

#[async_trait]
impl FileCapture for TestDriver {
    async fn begin_file_capture(&mut self, path: &str) -> Result<(), DriverError> {
        self.probe.file_captures.lock().push(path.to_owned());
        Ok(())
    }

    async fn end_file_capture(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl SdCapture for TestDriver {
    async fn begin_capture(&mut self, name: &str) -> Result<SdResponse, DriverError> {
        self.probe.begin_captures.lock().push(name.to_owned());
        Ok(self.sd_begin_response)
    }

    async fn end_capture(&mut self) -> Result<u64, DriverError> {
        Ok(42)
    }

    async fn playback(&mut self, name: &str) -> Result<SdResponse, DriverError> {
        self.probe.playbacks.lock().push(name.to_owned());
        Ok(SdResponse::Success)
    }
}

impl EstimationDriver for TestDriver {
    fn build_time(&self) -> Duration {
        self.build_time
    }
}

/// Per-line command behaviour, keyed by line text in the parser script.
#[derive(Clone)]
enum Behavior {
    Succeed,
    RetryThen {
        remaining: Arc<AtomicUsize>,
        attempts: Arc<AtomicUsize>,
    },
    Stop(StopKind),
}

struct ScriptedCommand {
    line: String,
    log: Arc<Mutex<Vec<String>>>,
    behavior: Behavior,
    delay: Duration,
}

#[async_trait]
impl DriverCommand for ScriptedCommand {
    async fn run(&self, _driver: &mut dyn Driver) -> Result<(), CommandError> {
        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::RetryThen { remaining, attempts } => {
                attempts.fetch_add(1, Ordering::SeqCst);
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(CommandError::Retry);
                }
            }
            Behavior::Stop(kind) => {
                return Err(CommandError::Stop(StopCondition::new(*kind, "halt requested")));
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().push(self.line.clone());
        Ok(())
    }
}

/// One command per line; the behaviour script only applies to the live
/// driver's stream.
struct ScriptedParser {
    log: Arc<Mutex<Vec<String>>>,
    behaviors: Option<Arc<Mutex<HashMap<String, Behavior>>>>,
    delay: Duration,
}

impl GcodeParser for ScriptedParser {
    fn parse(&mut self, line: &str, queue: &mut CommandQueue) {
        let behavior = self
            .behaviors
            .as_ref()
            .and_then(|behaviors| behaviors.lock().get(line).cloned())
            .unwrap_or(Behavior::Succeed);
        queue.push_back(Box::new(ScriptedCommand {
            line: line.to_owned(),
            log: self.log.clone(),
            behavior,
            delay: self.delay,
        }));
    }
}

struct ScriptedFactory {
    live_log: Arc<Mutex<Vec<String>>>,
    sim_log: Arc<Mutex<Vec<String>>>,
    estimator_log: Arc<Mutex<Vec<String>>>,
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    line_delay: Duration,
}

impl ParserFactory for ScriptedFactory {
    fn make_parser(&self, target: &dyn Driver) -> Box<dyn GcodeParser> {
        match target.machine().name() {
            "simulator" => Box::new(ScriptedParser {
                log: self.sim_log.clone(),
                behaviors: None,
                delay: Duration::ZERO,
            }),
            "estimator" => Box::new(ScriptedParser {
                log: self.estimator_log.clone(),
                behaviors: None,
                delay: Duration::ZERO,
            }),
            _ => Box::new(ScriptedParser {
                log: self.live_log.clone(),
                behaviors: Some(self.behaviors.clone()),
                delay: self.line_delay,
            }),
        }
    }
}

struct TestFactory {
    probe: Arc<DriverProbe>,
    sim_probe: Arc<DriverProbe>,
    sd_begin_response: SdResponse,
    estimate: Option<Duration>,
}

impl DriverFactory for TestFactory {
    fn driver(&self, _config: Option<&toml::Value>) -> anyhow::Result<Box<dyn Driver>> {
        Ok(Box::new(TestDriver::new(
            "test machine",
            self.probe.clone(),
            self.sd_begin_response,
        )))
    }

    fn simulator(&self) -> Option<Box<dyn Driver>> {
        Some(Box::new(TestDriver::new(
            "simulator",
            self.sim_probe.clone(),
            SdResponse::Success,
        )))
    }

    fn estimator(&self) -> Option<Box<dyn EstimationDriver>> {
        let estimate = self.estimate?;
        let mut driver = TestDriver::new("estimator", DriverProbe::new(), SdResponse::Success);
        driver.build_time = estimate;
        Some(Box::new(driver))
    }
}

/// Records everything the controller emits.
#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<MachineState>>,
    progress_events: Mutex<Vec<ProgressEvent>>,
}

impl Recorder {
    fn saw_phase(&self, phase: State) -> bool {
        self.states.lock().iter().any(|s| s.state() == phase)
    }

    fn progress_count(&self) -> usize {
        self.progress_events.lock().len()
    }
}

impl MachineListener for Recorder {
    fn state_changed(&self, event: &StateChangeEvent) {
        self.states.lock().push(event.current);
    }

    fn progress(&self, event: &ProgressEvent) {
        self.progress_events.lock().push(*event);
    }
}

struct ScriptedPrompt {
    confirm_answer: bool,
    infos: Mutex<Vec<String>>,
    confirms: Mutex<Vec<String>>,
}

#[async_trait]
impl UserPrompt for ScriptedPrompt {
    async fn info(&self, title: &str, _message: &str) {
        self.infos.lock().push(title.to_owned());
    }

    async fn confirm(&self, message: &str) -> bool {
        self.confirms.lock().push(message.to_owned());
        self.confirm_answer
    }
}

struct RigOptions {
    warmup: &'static str,
    cooldown: &'static str,
    preferences: Preferences,
    confirm_answer: bool,
    sd_begin_response: SdResponse,
    line_delay: Duration,
    estimate: Option<Duration>,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            warmup: "",
            cooldown: "",
            preferences: Preferences::default(),
            confirm_answer: false,
            sd_begin_response: SdResponse::Success,
            line_delay: Duration::ZERO,
            estimate: None,
        }
    }
}

struct Rig {
    controller: Controller,
    probe: Arc<DriverProbe>,
    live_log: Arc<Mutex<Vec<String>>>,
    sim_log: Arc<Mutex<Vec<String>>>,
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    recorder: Arc<Recorder>,
    prompt: Arc<ScriptedPrompt>,
}

impl Rig {
    fn new(options: RigOptions) -> Self {
        let probe = DriverProbe::new();
        let sim_probe = DriverProbe::new();
        let live_log = Arc::new(Mutex::new(Vec::new()));
        let sim_log = Arc::new(Mutex::new(Vec::new()));
        let behaviors = Arc::new(Mutex::new(HashMap::new()));
        let prompt = Arc::new(ScriptedPrompt {
            confirm_answer: options.confirm_answer,
            infos: Mutex::new(Vec::new()),
            confirms: Mutex::new(Vec::new()),
        });

        let config = MachineConfig {
            name: "test machine".into(),
            driver: None,
            warmup: (!options.warmup.is_empty()).then(|| options.warmup.to_owned()),
            cooldown: (!options.cooldown.is_empty()).then(|| options.cooldown.to_owned()),
        };
        let factory = Arc::new(TestFactory {
            probe: probe.clone(),
            sim_probe,
            sd_begin_response: options.sd_begin_response,
            estimate: options.estimate,
        });
        let parsers = Arc::new(ScriptedFactory {
            live_log: live_log.clone(),
            sim_log: sim_log.clone(),
            estimator_log: Arc::new(Mutex::new(Vec::new())),
            behaviors: behaviors.clone(),
            line_delay: options.line_delay,
        });

        let controller =
            Controller::new(config, options.preferences, factory, parsers, prompt.clone()).expect("controller");

        let recorder = Arc::new(Recorder::default());
        controller.add_machine_state_listener(recorder.clone());

        Self {
            controller,
            probe,
            live_log,
            sim_log,
            behaviors,
            recorder,
            prompt,
        }
    }

    async fn connect(&self) {
        self.controller.connect();
        self.wait_for(|| self.controller.machine_state().is_ready()).await;
    }

    /// Poll until `condition` holds, panicking after five seconds.
    async fn wait_for(&self, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within five seconds");
    }

    /// Wait until a build was observed starting and the machine is back
    /// at rest.
    async fn wait_for_build_end(&self) {
        self.wait_for(|| {
            let started =
                self.recorder.saw_phase(State::Building) || self.recorder.saw_phase(State::BuildingRemote);
            let state = self.controller.machine_state();
            started && (state.is_ready() || state.state() == State::NotAttached)
        })
        .await;
    }
}

fn numbered_lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("G1 X{i}")).collect()
}

#[tokio::test]
async fn direct_build_runs_all_segments_in_order() {
    let rig = Rig::new(RigOptions {
        warmup: "M104 S200",
        cooldown: "M104 S0",
        ..Default::default()
    });
    rig.connect().await;

    rig.controller
        .set_code_source(Arc::new(StringListSource::new(vec!["G1 X10".into(), "G1 X20".into()])));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    assert_eq!(
        *rig.live_log.lock(),
        vec!["M104 S200", "G1 X10", "G1 X20", "M104 S0"]
    );
    assert_eq!(rig.controller.lines_processed(), 4);
    assert_eq!(rig.recorder.progress_count(), 4);
    assert!(rig.controller.machine_state().is_ready());

    // Progress never overshoots, and the last event accounts for every
    // line.
    let events = rig.recorder.progress_events.lock();
    assert!(events.iter().all(|e| e.lines_processed <= e.lines_total));
    let last = events.last().unwrap();
    assert_eq!(last.lines_processed, 4);
    assert_eq!(last.lines_total, 4);
}

#[tokio::test]
async fn pause_roundtrip_dispatches_every_line_once() {
    let rig = Rig::new(RigOptions {
        line_delay: Duration::from_millis(5),
        ..Default::default()
    });
    rig.connect().await;

    let lines = numbered_lines(100);
    rig.controller.set_code_source(Arc::new(StringListSource::new(lines.clone())));
    rig.controller.execute().await.unwrap();

    rig.wait_for(|| rig.recorder.progress_count() >= 10).await;
    rig.controller.pause();
    rig.wait_for(|| rig.probe.pause_calls.load(Ordering::SeqCst) == 1).await;
    assert!(rig.controller.is_paused());

    tokio::time::sleep(Duration::from_millis(200)).await;
    rig.controller.unpause();
    rig.wait_for_build_end().await;

    assert_eq!(rig.probe.pause_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.probe.unpause_calls.load(Ordering::SeqCst), 1);
    // Pausing neither consumed nor duplicated commands.
    assert_eq!(*rig.live_log.lock(), lines);
}

#[tokio::test]
async fn stop_aborts_build_and_reconnects() {
    let rig = Rig::new(RigOptions {
        line_delay: Duration::from_millis(5),
        ..Default::default()
    });
    rig.connect().await;

    rig.controller
        .set_code_source(Arc::new(StringListSource::new(numbered_lines(100))));
    rig.controller.execute().await.unwrap();

    rig.wait_for(|| rig.recorder.progress_count() >= 10).await;
    rig.controller.stop();
    rig.wait_for_build_end().await;

    assert!(rig.probe.hard_stops.load(Ordering::SeqCst) >= 1);
    // The abort goes back through connecting to verify the machine state.
    assert!(rig.recorder.saw_phase(State::Stopping));
    assert!(rig.recorder.saw_phase(State::Connecting));
    assert!(rig.controller.machine_state().is_ready());
    assert!(rig.recorder.progress_count() < 100);
    assert!(rig.live_log.lock().len() < 100);
}

#[tokio::test]
async fn optional_halt_declined_ends_build() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let mut lines = numbered_lines(10);
    lines[4] = "M1".into();
    rig.behaviors.lock().insert("M1".into(), Behavior::Stop(StopKind::OptionalHalt));

    rig.controller.set_code_source(Arc::new(StringListSource::new(lines)));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    assert!(rig.controller.machine_state().is_ready());
    assert_eq!(*rig.live_log.lock(), numbered_lines(4));
    // The halt line was consumed; nothing after it was.
    assert_eq!(rig.controller.lines_processed(), 5);
    assert_eq!(rig.prompt.confirms.lock().len(), 1);
    assert!(!rig.recorder.saw_phase(State::Connecting));
}

#[tokio::test]
async fn optional_halt_accepted_continues_build() {
    let rig = Rig::new(RigOptions {
        confirm_answer: true,
        ..Default::default()
    });
    rig.connect().await;

    let mut lines = numbered_lines(10);
    lines[4] = "M1".into();
    rig.behaviors.lock().insert("M1".into(), Behavior::Stop(StopKind::OptionalHalt));

    rig.controller.set_code_source(Arc::new(StringListSource::new(lines.clone())));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    assert!(rig.controller.machine_state().is_ready());
    // Everything but the halt command itself was dispatched.
    let expected: Vec<String> = lines.into_iter().filter(|l| l != "M1").collect();
    assert_eq!(*rig.live_log.lock(), expected);
    assert_eq!(rig.controller.lines_processed(), 10);
}

#[tokio::test]
async fn unconditional_halt_shows_dialog_and_ends_build() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let mut lines = numbered_lines(6);
    lines[2] = "M0".into();
    rig.behaviors
        .lock()
        .insert("M0".into(), Behavior::Stop(StopKind::UnconditionalHalt));

    rig.controller.set_code_source(Arc::new(StringListSource::new(lines)));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    assert!(rig.controller.machine_state().is_ready());
    assert_eq!(*rig.live_log.lock(), numbered_lines(2));
    assert!(rig
        .prompt
        .infos
        .lock()
        .iter()
        .any(|title| title.contains("Unconditional halt")));
}

#[tokio::test]
async fn retry_reruns_the_same_command() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let attempts = Arc::new(AtomicUsize::new(0));
    rig.behaviors.lock().insert(
        "G1 X0".into(),
        Behavior::RetryThen {
            remaining: Arc::new(AtomicUsize::new(2)),
            attempts: attempts.clone(),
        },
    );

    let lines = numbered_lines(3);
    rig.controller.set_code_source(Arc::new(StringListSource::new(lines.clone())));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    // Two retries, then success: three executions, one dispatch.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(*rig.live_log.lock(), lines);
    assert_eq!(rig.controller.lines_processed(), 3);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn simulated_build_leaves_the_machine_alone() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let lines = numbered_lines(5);
    rig.controller.set_code_source(Arc::new(StringListSource::new(lines.clone())));
    rig.controller.simulate().await.unwrap();
    rig.wait_for_build_end().await;

    assert!(rig.live_log.lock().is_empty());
    assert_eq!(*rig.sim_log.lock(), lines);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn simulator_mirrors_machine_builds() {
    let rig = Rig::new(RigOptions {
        preferences: Preferences {
            show_simulator: true,
            ..Default::default()
        },
        ..Default::default()
    });
    rig.connect().await;

    let lines = numbered_lines(5);
    rig.controller.set_code_source(Arc::new(StringListSource::new(lines.clone())));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    assert_eq!(*rig.live_log.lock(), lines);
    assert_eq!(*rig.sim_log.lock(), lines);
}

#[tokio::test]
async fn upload_to_locked_card_shows_dialog_and_stops() {
    let rig = Rig::new(RigOptions {
        sd_begin_response: SdResponse::Locked,
        ..Default::default()
    });
    rig.connect().await;

    rig.controller
        .set_code_source(Arc::new(StringListSource::new(numbered_lines(5))));
    rig.controller.upload("part.s3g").unwrap();
    rig.wait_for(|| rig.recorder.saw_phase(State::Stopping)).await;
    rig.wait_for_build_end().await;

    assert!(rig.live_log.lock().is_empty());
    assert_eq!(*rig.probe.begin_captures.lock(), vec!["part.s3g"]);
    assert!(rig.prompt.infos.lock().iter().any(|title| title == "SD card error"));
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn upload_captures_the_build() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let lines = numbered_lines(5);
    rig.controller.set_code_source(Arc::new(StringListSource::new(lines.clone())));
    rig.controller.upload("part.s3g").unwrap();
    rig.wait_for_build_end().await;

    assert_eq!(*rig.probe.begin_captures.lock(), vec!["part.s3g"]);
    assert_eq!(*rig.live_log.lock(), lines);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn remote_build_plays_back_and_finishes() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    rig.controller.build_remote("part.s3g");
    rig.wait_for_build_end().await;

    assert_eq!(*rig.probe.playbacks.lock(), vec!["part.s3g"]);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn remote_build_honours_stop() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;
    rig.probe.finished.store(false, Ordering::SeqCst);

    rig.controller.build_remote("part.s3g");
    rig.wait_for(|| rig.controller.machine_state().state() == State::BuildingRemote)
        .await;

    rig.controller.stop();
    rig.wait_for_build_end().await;

    assert!(rig.probe.hard_stops.load(Ordering::SeqCst) >= 1);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn connect_is_idempotent() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let seen = rig.recorder.states.lock().len();
    rig.controller.connect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(rig.controller.machine_state().is_ready());
    assert_eq!(rig.recorder.states.lock().len(), seen);
}

#[tokio::test]
async fn stop_while_idle_changes_nothing() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    rig.controller.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(rig.controller.machine_state().is_ready());
    assert!(!rig.recorder.saw_phase(State::Stopping));
}

#[tokio::test]
async fn disconnect_detaches_the_driver() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;
    assert!(rig.controller.is_initialized().await);

    rig.controller.disconnect();
    rig.wait_for(|| rig.controller.machine_state().state() == State::NotAttached)
        .await;
    assert!(!rig.controller.is_initialized().await);
}

#[tokio::test]
async fn listener_registration_delivers_current_state() {
    let rig = Rig::new(RigOptions::default());

    let late = Arc::new(Recorder::default());
    rig.controller.add_machine_state_listener(late.clone());

    let states = late.states.lock();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state(), State::NotAttached);
}

#[tokio::test]
async fn removed_listener_stops_receiving_events() {
    let rig = Rig::new(RigOptions::default());

    let listener: Arc<Recorder> = Arc::new(Recorder::default());
    let as_listener: Arc<dyn MachineListener> = listener.clone();
    rig.controller.add_machine_state_listener(listener.clone());
    rig.controller.remove_machine_state_listener(&as_listener);

    rig.connect().await;
    assert_eq!(listener.states.lock().len(), 1);
}

#[tokio::test]
async fn dispose_terminates_and_connect_revives() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    rig.controller.dispose().await;
    assert_eq!(rig.controller.machine_state().state(), State::NotAttached);

    rig.connect().await;
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn estimate_feeds_progress_events() {
    let rig = Rig::new(RigOptions {
        estimate: Some(Duration::from_secs(42)),
        ..Default::default()
    });
    rig.connect().await;

    rig.controller
        .set_code_source(Arc::new(StringListSource::new(numbered_lines(3))));
    rig.controller.execute().await.unwrap();
    rig.wait_for_build_end().await;

    let events = rig.recorder.progress_events.lock();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.estimated_total == Duration::from_secs(42)));
}

#[tokio::test]
async fn scheduled_build_to_file_captures_through_the_driver() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let lines = numbered_lines(5);
    rig.controller.schedule(JobRequest::BuildToFile {
        source: Arc::new(StringListSource::new(lines.clone())),
        remote_name: "out.gcode".into(),
    });
    rig.wait_for_build_end().await;

    assert_eq!(*rig.probe.file_captures.lock(), vec!["out.gcode"]);
    assert_eq!(*rig.live_log.lock(), lines);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn run_command_retries_until_done() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    let attempts = Arc::new(AtomicUsize::new(0));
    rig.controller.run_command(Box::new(ScriptedCommand {
        line: "M105".into(),
        log: rig.live_log.clone(),
        behavior: Behavior::RetryThen {
            remaining: Arc::new(AtomicUsize::new(1)),
            attempts: attempts.clone(),
        },
        delay: Duration::ZERO,
    }));

    rig.wait_for(|| rig.live_log.lock().contains(&"M105".to_owned())).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(rig.controller.machine_state().is_ready());
}

#[tokio::test]
async fn reset_returns_to_ready() {
    let rig = Rig::new(RigOptions::default());
    rig.connect().await;

    rig.controller.reset();
    rig.wait_for(|| rig.recorder.saw_phase(State::Reset)).await;
    rig.wait_for(|| rig.controller.machine_state().is_ready()).await;
}

#[tokio::test]
async fn build_to_file_is_not_implemented() {
    let rig = Rig::new(RigOptions::default());
    assert!(rig.controller.build_to_file("out.gcode").is_err());
}
