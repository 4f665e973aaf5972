use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt::format::FmtSpan, FmtSubscriber};

use machine_control::{
    noop::Noop, CommandQueue, Controller, Driver, DriverCommand, DriverFactory, GcodeFile, GcodeParser, GcodeSource,
    HeadlessPrompt, MachineConfig, MachineListener, ParserFactory, Preferences, ProgressEvent, StateChangeEvent,
};

/// Drive a single G-code machine from the command line.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "machine-control")]
struct Cli {
    /// verbosity of logging output [trace, debug, info, warn, error]
    #[arg(long, short, default_value = "info")]
    log_level: String,

    /// Machine configuration file to use
    #[arg(long, short, default_value = "machine.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gcode file through the controller against the built-in no-op
    /// driver, printing progress. Exercises a configuration end to end
    /// without touching hardware.
    Build {
        /// The gcode file to run.
        file: PathBuf,

        /// Route the build to the simulator stream only.
        #[arg(long)]
        simulate: bool,
    },
}

/// Factory producing no-op drivers for dry runs.
struct NoopFactory;

impl DriverFactory for NoopFactory {
    fn driver(&self, _config: Option<&toml::Value>) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Noop::new("noop")))
    }

    fn simulator(&self) -> Option<Box<dyn Driver>> {
        Some(Box::new(Noop::new("simulator")))
    }
}

/// A command that does nothing beyond recording the line it came from.
struct PassthroughCommand(String);

#[async_trait::async_trait]
impl DriverCommand for PassthroughCommand {
    async fn run(&self, _driver: &mut dyn Driver) -> std::result::Result<(), machine_control::CommandError> {
        tracing::trace!(line = %self.0, "dispatched");
        Ok(())
    }
}

/// One pass-through command per line. Real G-code parsing lives outside
/// this crate; a dry run only needs the control loop exercised.
struct PassthroughParser;

impl GcodeParser for PassthroughParser {
    fn parse(&mut self, line: &str, queue: &mut CommandQueue) {
        queue.push_back(Box::new(PassthroughCommand(line.to_owned())));
    }
}

struct PassthroughFactory;

impl ParserFactory for PassthroughFactory {
    fn make_parser(&self, _target: &dyn Driver) -> Box<dyn GcodeParser> {
        Box::new(PassthroughParser)
    }
}

struct ConsoleListener;

impl MachineListener for ConsoleListener {
    fn state_changed(&self, event: &StateChangeEvent) {
        tracing::info!(
            from = ?event.previous.state(),
            to = ?event.current.state(),
            "machine state changed"
        );
    }

    fn progress(&self, event: &ProgressEvent) {
        tracing::info!(
            lines = event.lines_processed,
            total = event.lines_total,
            elapsed = ?event.elapsed,
            "progress"
        );
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) -> Result<()> {
    for _ in 0..600 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("timed out waiting for {what}");
}

async fn cmd_build(config: MachineConfig, file: &PathBuf, simulate: bool) -> Result<()> {
    let controller = Controller::new(
        config,
        Preferences::default(),
        Arc::new(NoopFactory),
        Arc::new(PassthroughFactory),
        Arc::new(HeadlessPrompt),
    )?;
    controller.add_machine_state_listener(Arc::new(ConsoleListener));

    controller.connect();
    wait_until("connection", || controller.machine_state().is_ready()).await?;

    let source = Arc::new(GcodeFile::open(file).await?);
    let total = source.line_count();
    controller.set_code_source(source);
    if simulate {
        controller.simulate().await?;
    } else {
        controller.execute().await?;
    }

    wait_until("build end", || {
        !controller.machine_state().is_building() && controller.lines_processed() >= total
    })
    .await?;

    tracing::info!(lines = controller.lines_processed(), "build finished");
    controller.dispose().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::from_str(&cli.log_level)?)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = MachineConfig::from_file(std::path::Path::new(&cli.config))
        .map_err(|_| anyhow::anyhow!("Config file not found at {}", &cli.config))?;

    match cli.command {
        Commands::Build { ref file, simulate } => cmd_build(config, file, simulate).await,
    }
}
