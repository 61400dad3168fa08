//! Tilt decoder command-line entry point.
//!
//! ```bash
//! # Baseline session on the simulated rig, saving a template
//! main --mode baseline --trials 40 --template-out templates/rat7.json
//!
//! # Closed loop against the live event bridge
//! main --source live --address 127.0.0.1:7411 --mode closed-loop \
//!      --template-in templates/rat7.json --remap 9:1,11:2,12:3,14:4
//! ```
//!
//! Type `q` and Enter to stop after the current trial.

use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tilt_decoder::actuators::{ActuatorSink, ConsoleActuator};
use tilt_decoder::config::{load_config, SessionConfig};
use tilt_decoder::error::SessionError;
use tilt_decoder::processing::events::Label;
use tilt_decoder::processing::templates::{load_for_session, Relabel};
use tilt_decoder::processing::trial::policy::CollectionPolicy;
use tilt_decoder::processing::trial::StopHandle;
use tilt_decoder::recorder::{spawn_live_view, MockSampleSource, Recorder};
use tilt_decoder::session::{Session, SessionMode, SessionOutcome, SessionReport};
use tilt_decoder::sources::{EventSource, MockRig, MockRigConfig, NetworkEventSource};

#[derive(Parser, Debug)]
#[command(name = "tilt-decoder")]
#[command(author, version, about = "Closed-loop PSTH decoder for the tilt task", long_about = None)]
struct Cli {
    /// YAML session configuration; defaults describe the 4-class rig
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where events come from
    #[arg(long, value_enum, default_value_t = SourceKind::Mock)]
    source: SourceKind,

    /// Event bridge address for the live source
    #[arg(long, default_value = "127.0.0.1:7411")]
    address: String,

    #[arg(short, long, value_enum, default_value_t = ModeArg::Baseline)]
    mode: ModeArg,

    #[arg(long)]
    template_in: Option<PathBuf>,

    #[arg(long)]
    template_out: Option<PathBuf>,

    /// Template label remap, e.g. 9:1,11:2,12:3,14:4
    #[arg(long, value_parser = parse_remap)]
    remap: Option<BTreeMap<Label, Label>>,

    /// Number of trials; must be divisible by the number of labels
    #[arg(short = 'n', long, default_value_t = 40)]
    trials: usize,

    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Fatal collection timeout since the motion command
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Give up waiting for a first spike after this long; 0 disables
    #[arg(long)]
    no_spike_wait_ms: Option<u64>,

    /// Re-run trials that collected no spikes
    #[arg(long)]
    retry_failed: bool,

    #[arg(long)]
    max_retries: Option<usize>,

    /// Record analog channels to this CSV file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Keep a rolling live view of the recording
    #[arg(long)]
    live_view: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SourceKind {
    Mock,
    Live,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Baseline,
    ClosedLoop,
    Sham,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Baseline => SessionMode::Baseline,
            ModeArg::ClosedLoop => SessionMode::ClosedLoop,
            ModeArg::Sham => SessionMode::Sham,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    NoWait,
    DeadlineRelative,
    FixedWallClock,
}

impl From<PolicyArg> for CollectionPolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::NoWait => CollectionPolicy::NoWait,
            PolicyArg::DeadlineRelative => CollectionPolicy::DeadlineRelative,
            PolicyArg::FixedWallClock => CollectionPolicy::FixedWallClock,
        }
    }
}

fn parse_remap(s: &str) -> Result<BTreeMap<Label, Label>, String> {
    s.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (from, to) = pair
                .split_once(':')
                .ok_or_else(|| format!("expected FROM:TO, got {:?}", pair))?;
            let parse = |v: &str| v.trim().parse::<Label>().map_err(|e| format!("{:?}: {}", v, e));
            Ok((parse(from)?, parse(to)?))
        })
        .collect()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
    }

    let mode = SessionMode::from(cli.mode);
    match run(&cli) {
        Ok(outcome) => {
            outcome.report.print_summary();
            if let Some(path) = &outcome.template {
                println!("{} {}", "template saved to".green(), path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            if let Some(history) = e.history() {
                SessionReport::from_history(mode, history).print_summary();
            }
            if let Some(record) = e.partial_record() {
                eprintln!(
                    "{} trial {} (label {}): trigger {:?}, {} events",
                    "interrupted".yellow().bold(),
                    record.trial_index,
                    record.label,
                    record.trigger_time,
                    record.events.len()
                );
            }
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn apply_overrides(config: &mut SessionConfig, cli: &Cli) {
    if let Some(path) = &cli.template_in {
        config.output.template_in = Some(path.clone());
    }
    if let Some(path) = &cli.template_out {
        config.output.template_out = Some(path.clone());
    }
    if let Some(remap) = &cli.remap {
        config.template_remap = remap.clone();
    }
    if let Some(policy) = cli.policy {
        config.collection.policy = policy.into();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.collection.timeout_ms = timeout_ms;
    }
    if let Some(wait_ms) = cli.no_spike_wait_ms {
        config.collection.no_spike_wait_ms = (wait_ms > 0).then_some(wait_ms);
    }
    if cli.retry_failed {
        config.retry.enabled = true;
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(path) = &cli.record {
        config.recorder.enabled = true;
        config.recorder.path = path.clone();
    }
    if cli.live_view {
        config.recorder.live_view = true;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
}

/// Requests a stop when the operator types `q`.
fn spawn_stop_watcher(stop: StopHandle) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().eq_ignore_ascii_case("q") {
                info!("stop requested; finishing the current trial");
                stop.request();
                break;
            }
        }
    });
}

fn run(cli: &Cli) -> Result<SessionOutcome, SessionError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };
    apply_overrides(&mut config, cli);
    config.validate()?;

    let template = match &config.output.template_in {
        Some(path) => {
            let relabel = Relabel::new(config.template_remap.clone())?;
            Some(load_for_session(path, &config.binning, &config.task, &relabel)?)
        }
        None => None,
    };

    let (source, actuator): (Box<dyn EventSource>, Box<dyn ActuatorSink>) = match cli.source {
        SourceKind::Mock => {
            let (source, actuator) = MockRig::new(MockRigConfig::from_session(&config));
            (Box::new(source), Box::new(actuator))
        }
        SourceKind::Live => {
            let poll = Duration::from_millis(config.collection.poll_interval_ms);
            let source = NetworkEventSource::connect(&cli.address, poll)?;
            (Box::new(source), Box::new(ConsoleActuator::new()))
        }
    };

    let stop = StopHandle::new();
    spawn_stop_watcher(stop.clone());

    let mut session = Session::new(&config, cli.mode.into())
        .with_stop(stop)
        .with_metadata("source", source.name())
        .with_metadata("trials_requested", cli.trials);
    if let Some(template) = template {
        session = session.with_template(template);
    }

    let mut live_view = None;
    if config.recorder.enabled {
        let rec = &config.recorder;
        let live = if rec.live_view {
            let (tx, rx) = mpsc::sync_channel(rec.queue_capacity);
            let window = (rec.sample_rate_hz * 2.0) as usize;
            live_view = Some(spawn_live_view(rx, window));
            Some(tx)
        } else {
            None
        };
        let samples = MockSampleSource::new(rec.channels, rec.sample_rate_hz, config.seed);
        session = session.with_recorder(Recorder::spawn(rec, Box::new(samples), live)?);
    }

    info!("session {} ready; type q to stop after the current trial", session.session_id());
    let outcome = session.run(cli.trials, source, actuator);

    if let Some((view, _handle)) = live_view {
        if let Ok(view) = view.lock() {
            info!(batches = view.batches_seen(), range = ?view.time_range(), "live view closed");
        }
    }
    outcome
}
