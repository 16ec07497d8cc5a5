//! patconv entrypoint.
//!
//! Wires configuration, logging, the channel map, and one conversion
//! stream together. Diagnostics from the core arrive over a channel and
//! are relayed to the log with their severity colouring; the process exit
//! code mirrors the conversion outcome (0 ok, 1 cancelled, 2 error).

use anyhow::{Context, Result};
use clap::Parser;
use core_channelmap::ChannelMap;
use core_convert::{ConvertOutcome, StilToVctStream};
use core_events::{EventSink, ParseEvent, Severity};
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "patconv", version, about = "STIL to VCT pattern converter")]
struct Args {
    /// Source STIL file.
    pub input: PathBuf,
    /// Target VCT file; defaults to the input with a `.vct` extension.
    /// The `.rex` timing sibling derives from this path.
    pub output: Option<PathBuf>,
    /// Signal-to-channel map (CSV with Signal,Channel columns).
    #[arg(long = "channel-map")]
    pub channel_map: Option<PathBuf>,
    /// Configuration file path (overrides discovery of `patconv.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Print the signal inventory and exit.
    #[arg(long)]
    pub overview: bool,
    /// Mirror every core event into the debug log.
    #[arg(long)]
    pub debug: bool,
    /// Append log records to this file instead of stderr.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

/// Sink handed to the conversion: forwards events to the relay thread.
struct ChannelSink {
    tx: Sender<ParseEvent>,
}

impl EventSink for ChannelSink {
    fn event(&mut self, event: ParseEvent) {
        let _ = self.tx.send(event);
    }
}

fn configure_logging(args: &Args, default_filter: &str) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
    if let Some(path) = &args.log_file {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file = tracing_appender::rolling::never(
            dir.unwrap_or_else(|| std::path::Path::new(".")),
            path.file_name().context("log file path has no file name")?,
        );
        let (writer, guard) = tracing_appender::non_blocking(file);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(None)
    }
}

/// Relay core events to the log, coloured by severity.
fn relay(event: &ParseEvent) {
    match event {
        ParseEvent::ParseError { message, statement } => match Severity::of(event) {
            Severity::Warning => warn!(target: "convert", "{message}"),
            _ => {
                if statement.is_empty() {
                    error!(target: "convert", "{message}");
                } else {
                    error!(target: "convert", statement = %statement, "{message}");
                }
            }
        },
        ParseEvent::Log { message } => match Severity::of(event) {
            Severity::Error => error!(target: "convert", "{message}"),
            Severity::Warning => warn!(target: "convert", "{message}"),
            Severity::Info => info!(target: "convert", "{message}"),
        },
        ParseEvent::ParseComplete { vector_count } => {
            info!(target: "convert", vectors = vector_count, "pattern parse complete");
        }
        _ => {}
    }
}

fn load_channel_map(args: &Args) -> Result<ChannelMap> {
    let Some(path) = &args.channel_map else {
        warn!(target: "runtime", "no --channel-map given; every channel stays unassigned");
        return Ok(ChannelMap::new());
    };
    let mut warnings = Vec::new();
    let map = core_channelmap::load_csv(path, &mut warnings)
        .with_context(|| format!("loading channel map {}", path.display()))?;
    for w in warnings {
        warn!(target: "runtime", "{w}");
    }
    info!(target: "runtime", signals = map.len(), "channel map loaded");
    Ok(map)
}

fn run(args: Args) -> Result<ConvertOutcome> {
    let config = core_config::load_from(args.config.clone())?;
    let _log_guard = configure_logging(&args, &config.file.log.filter)?;
    info!(target: "runtime", input = %args.input.display(), "startup");

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("vct"));

    let (tx, rx) = crossbeam_channel::unbounded::<ParseEvent>();
    let printer = thread::spawn(move || {
        for event in rx {
            relay(&event);
        }
    });

    let sink = ChannelSink { tx };
    let mut stream = StilToVctStream::new(&args.input, &output, sink, args.debug);
    stream.apply_config(&config.file);

    let outcome = if args.overview {
        match stream.read_stil_overview(true) {
            Ok(used) => {
                info!(target: "runtime", signals = used.len(), "overview complete");
                ConvertOutcome::Ok
            }
            Err(e) => {
                error!(target: "runtime", "overview failed: {e}");
                ConvertOutcome::Error
            }
        }
    } else {
        stream.set_channel_mapping(load_channel_map(&args)?);
        stream.convert()
    };

    drop(stream);
    let _ = printer.join();
    Ok(outcome)
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(ConvertOutcome::Ok) => ExitCode::SUCCESS,
        Ok(ConvertOutcome::Cancelled) => ExitCode::from(1),
        Ok(ConvertOutcome::Error) => ExitCode::from(2),
        Err(e) => {
            eprintln!("patconv: {e:#}");
            ExitCode::from(2)
        }
    }
}
