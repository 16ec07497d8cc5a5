//! Conversion orchestrator: one `StilToVctStream` per conversion.
//!
//! Wires the header scanner, the timing formatter, the pattern transformer,
//! and the VCT/REX emitters together behind the programmatic surface the
//! caller sees: `read_stil_overview`, channel-mapping accessors,
//! `refresh_signals_and_remap`, `convert`, `stop`.
//!
//! Parser state and symbol tables live inside this object; two concurrent
//! conversions never share anything but their own event sinks.

use core_channelmap::{ChannelMap, RemapReport};
use core_events::{EventSink, ParseEvent, Severity};
use core_pattern::{ParseOutcome, PatternError, PatternStreamParser};
use core_symbols::{SymbolError, SymbolTables, scan_header};
use core_timing::TimingError;
use core_vct::{MicroInstructionMap, TimingFormatter, VctCharMap, VctEmitter, VctError};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Vct(#[from] VctError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Caller-visible conversion result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    Ok,
    Cancelled,
    Error,
}

/// Result of reconciling a changed source file against an older mapping.
#[derive(Debug, Default)]
pub struct RefreshResult {
    pub ok: bool,
    pub new_signals: Vec<String>,
    pub report: RemapReport,
    pub error: Option<String>,
}

pub struct StilToVctStream<S: EventSink> {
    input: PathBuf,
    output: PathBuf,
    sink: S,
    debug: bool,
    tables: Option<SymbolTables>,
    mapping: ChannelMap,
    char_map: VctCharMap,
    instr_map: MicroInstructionMap,
    disabled: HashSet<String>,
    stop: Arc<AtomicBool>,
}

impl<S: EventSink> StilToVctStream<S> {
    pub fn new(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        sink: S,
        debug: bool,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            sink,
            debug,
            tables: None,
            mapping: ChannelMap::new(),
            char_map: VctCharMap::new(),
            instr_map: MicroInstructionMap::new(),
            disabled: HashSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Apply configuration: extra character-map entries and the
    /// disabled-instruction deny-list.
    pub fn apply_config(&mut self, cfg: &core_config::ConfigFile) {
        for line in &cfg.mapping.char_map {
            self.char_map.load_lines(line);
        }
        self.disabled
            .extend(cfg.instructions.disabled.iter().cloned());
    }

    pub fn set_channel_mapping(&mut self, mapping: ChannelMap) {
        self.mapping = mapping;
    }

    pub fn get_channel_mapping(&self) -> &ChannelMap {
        &self.mapping
    }

    /// Cancellation handle; safe to clone into another thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Scan the header region and return the used signal names.
    pub fn read_stil_overview(&mut self, print_log: bool) -> Result<Vec<String>, SymbolError> {
        let scan = scan_header(&self.input)?;
        for warning in &scan.warnings {
            self.sink.event(ParseEvent::Log {
                message: warning.clone(),
            });
        }
        let used = scan.tables.used_signals();
        if print_log {
            for name in &used {
                let direction = scan
                    .tables
                    .direction_of(name)
                    .map(|d| d.as_str())
                    .unwrap_or("?");
                let groups = scan
                    .tables
                    .groups
                    .iter()
                    .filter(|g| g.signals.iter().any(|s| s == name))
                    .count();
                self.sink.event(ParseEvent::Log {
                    message: format!("signal {name} ({direction}), member of {groups} group(s)"),
                });
            }
        }
        self.tables = Some(scan.tables);
        Ok(used)
    }

    /// Re-read the source's signals and carry the old mapping over where
    /// the signals still exist.
    pub fn refresh_signals_and_remap(&mut self, old_mapping: &ChannelMap) -> RefreshResult {
        let mut result = RefreshResult::default();
        let new_signals = match self.read_stil_overview(false) {
            Ok(signals) => signals,
            Err(e) => {
                result.error = Some(e.to_string());
                return result;
            }
        };
        if new_signals.is_empty() {
            result.error = Some("no signals found in the source file".to_string());
            return result;
        }
        result.report = core_channelmap::reconcile(old_mapping, &new_signals);
        self.mapping = result.report.mapping.clone();
        result.new_signals = new_signals;
        result.ok = true;
        result
    }

    /// Run the conversion. Diagnostics flow through the sink; the outcome
    /// mirrors the CLI exit codes (ok / cancelled / error).
    pub fn convert(&mut self) -> ConvertOutcome {
        match self.convert_inner() {
            Ok(outcome) => outcome,
            Err(e) => {
                self.sink.event(ParseEvent::ParseError {
                    message: format!("conversion failed: {e}"),
                    statement: String::new(),
                });
                ConvertOutcome::Error
            }
        }
    }

    fn convert_inner(&mut self) -> Result<ConvertOutcome, ConvertError> {
        if self.tables.is_none() {
            self.read_stil_overview(false)?;
        }
        if self.stop.load(Ordering::Relaxed) {
            return Ok(ConvertOutcome::Cancelled);
        }
        let Some(tables) = self.tables.as_ref() else {
            return Ok(ConvertOutcome::Error);
        };

        self.sink.event(ParseEvent::Log {
            message: "generating VCT file...".to_string(),
        });

        let mut formatter = TimingFormatter::new(tables, &self.mapping);
        let formatted_timing = formatter.format_all(&tables.timings)?;
        let wft_mapping = formatter.wft_mapping();

        let file_size = std::fs::metadata(&self.input).map(|m| m.len()).unwrap_or(0);
        let source_name = self
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let out = BufWriter::new(File::create(&self.output)?);
        let mut emitter = VctEmitter::new(
            out,
            tables,
            &self.mapping,
            &self.char_map,
            &self.instr_map,
            wft_mapping,
            source_name,
        );
        emitter.write_banner()?;
        emitter.write_timing_section(&formatted_timing)?;

        write_rex(&self.output, &formatted_timing, &mut self.sink)?;

        if self.stop.load(Ordering::Relaxed) {
            return Ok(ConvertOutcome::Cancelled);
        }
        emitter.write_drvr_section()?;
        emitter.begin_vector_section()?;

        let mut parser =
            PatternStreamParser::with_stop(tables, self.disabled.clone(), Arc::clone(&self.stop));
        let bytes_read = parser.bytes_read_handle();
        let reader = BufReader::new(File::open(&self.input)?);
        let mut tee = Tee {
            emitter: &mut emitter,
            user: &mut self.sink,
            rows: 0,
            bytes_read,
            file_size,
            debug: self.debug,
        };
        let outcome = parser.parse_patterns(reader, &mut tee)?;

        if let Some(e) = emitter.take_io_error() {
            return Err(ConvertError::Io(e));
        }
        emitter.finish(outcome == ParseOutcome::Complete)?;

        Ok(match outcome {
            ParseOutcome::Complete => {
                self.sink.event(ParseEvent::Log {
                    message: format!(
                        "VCT file complete: {} ({} vectors)",
                        self.output.display(),
                        parser.state.vector_count
                    ),
                });
                ConvertOutcome::Ok
            }
            ParseOutcome::Stopped => {
                self.sink.event(ParseEvent::Log {
                    message: format!(
                        "conversion stopped, {} vectors written",
                        parser.state.vector_count
                    ),
                });
                ConvertOutcome::Cancelled
            }
            ParseOutcome::Fatal => ConvertOutcome::Error,
        })
    }
}

/// Timing-only sibling file, same path with the `.rex` extension.
fn write_rex<S: EventSink>(
    vct_path: &Path,
    formatted_timing: &str,
    sink: &mut S,
) -> Result<(), ConvertError> {
    let rex_path = vct_path.with_extension("rex");
    if formatted_timing.is_empty() {
        sink.event(ParseEvent::Log {
            message: "Warning: no timing definitions, skipping the .rex file".to_string(),
        });
        return Ok(());
    }
    let mut out = BufWriter::new(File::create(&rex_path)?);
    out.write_all(formatted_timing.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    sink.event(ParseEvent::Log {
        message: format!("REX file complete: {}", rex_path.display()),
    });
    Ok(())
}

/// Fan events out to the VCT emitter and the caller's sink, inserting
/// progress lines at the original cadence (every 2000 rows below 10k,
/// every 5000 above).
struct Tee<'a, 'b, W: Write, U: EventSink> {
    emitter: &'a mut VctEmitter<'b, W>,
    user: &'a mut U,
    rows: u64,
    bytes_read: Arc<AtomicU64>,
    file_size: u64,
    debug: bool,
}

impl<W: Write, U: EventSink> EventSink for Tee<'_, '_, W, U> {
    fn event(&mut self, event: ParseEvent) {
        self.emitter.event(event.clone());
        if self.debug {
            tracing::debug!(target: "convert.events", severity = %Severity::of(&event), ?event);
        }
        match &event {
            ParseEvent::Vector { .. } | ParseEvent::MicroInstruction { .. } => {
                self.rows += 1;
                let interval = if self.rows <= 10_000 { 2_000 } else { 5_000 };
                if self.rows % interval == 0 {
                    let progress = if self.file_size > 0 {
                        self.bytes_read.load(Ordering::Relaxed) as f64 / self.file_size as f64
                            * 100.0
                    } else {
                        100.0
                    };
                    self.user.event(ParseEvent::Log {
                        message: format!(
                            "processed {} vector rows, progress {progress:.1}%...",
                            self.rows
                        ),
                    });
                }
            }
            _ => {}
        }
        self.user.event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_events::VecSink;

    const DEMO: &str = r#"STIL 1.0;
Signals {
    clk In;
    q Out;
}
SignalGroups {
    all = 'clk';
}
Timing t1 {
    WaveformTable wt1 {
        Period '10ns';
        Waveforms {
            clk { 01 { '0ns' D/U; '5ns' D/U; } }
        }
    }
}
PatternBurst burst1 {
    PatList { p1; }
}
PatternExec {
    Timing t1;
    PatternBurst burst1;
}
Pattern p1 {
    W wt1;
    V { all = 0; }
    V { all = 1; }
    Stop;
}
"#;

    fn demo_files() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("demo.stil");
        let output = dir.path().join("demo.vct");
        std::fs::write(&input, DEMO).unwrap();
        (dir, input, output)
    }

    fn mapping() -> ChannelMap {
        let mut m = ChannelMap::new();
        m.set("clk", vec![0]);
        m
    }

    #[test]
    fn minimal_pattern_end_to_end() {
        let (_dir, input, output) = demo_files();
        let mut stream = StilToVctStream::new(&input, &output, VecSink::new(), false);
        stream.set_channel_mapping(mapping());
        assert_eq!(stream.convert(), ConvertOutcome::Ok);

        let vct = std::fs::read_to_string(&output).unwrap();
        assert!(vct.contains("#VECTOR"));
        assert!(vct.contains("#VECTOREND"));
        assert!(vct.contains(";   DRVR   0: clk"));
        assert!(vct.contains("CS_Loop:"));
        // Two pattern rows: an implicit advance, then the halt from `Stop`.
        assert!(vct.contains("; 0x000000"));
        assert!(vct.contains("; 0x000001"));
        assert!(vct.contains("  HALT"));

        let rex = std::fs::read_to_string(output.with_extension("rex")).unwrap();
        assert!(rex.starts_with("RRADR 0"));
        assert!(rex.contains("REP_RATE 10"));
        assert!(rex.contains("CLOCK0 <0> 0,5"));
    }

    #[test]
    fn overview_lists_used_signals() {
        let (_dir, input, output) = demo_files();
        let mut stream = StilToVctStream::new(&input, &output, VecSink::new(), false);
        let used = stream.read_stil_overview(true).unwrap();
        assert_eq!(used, vec!["clk"]);
    }

    #[test]
    fn refresh_remaps_old_channels() {
        let (_dir, input, output) = demo_files();
        let mut stream = StilToVctStream::new(&input, &output, VecSink::new(), false);
        let mut old = ChannelMap::new();
        old.set("clk", vec![4]);
        old.set("stale", vec![9]);
        let result = stream.refresh_signals_and_remap(&old);
        assert!(result.ok);
        assert_eq!(result.report.mapped, vec!["clk"]);
        assert_eq!(result.report.removed, vec!["stale"]);
        assert_eq!(stream.get_channel_mapping().channels_of("clk"), Some(&[4u16][..]));
    }

    #[test]
    fn stop_before_convert_is_cancelled() {
        let (_dir, input, output) = demo_files();
        let mut stream = StilToVctStream::new(&input, &output, VecSink::new(), false);
        stream.stop();
        assert_eq!(stream.convert(), ConvertOutcome::Cancelled);
    }

    #[test]
    fn disabled_instruction_yields_error_without_trailer() {
        let (_dir, input, output) = demo_files();
        let mut stream = StilToVctStream::new(&input, &output, VecSink::new(), false);
        stream.set_channel_mapping(mapping());
        let cfg = core_config::ConfigFile {
            instructions: core_config::InstructionConfig {
                disabled: vec!["Stop".to_string()],
            },
            ..Default::default()
        };
        stream.apply_config(&cfg);
        assert_eq!(stream.convert(), ConvertOutcome::Error);
        let vct = std::fs::read_to_string(&output).unwrap();
        assert!(vct.contains("#VECTOR"));
        assert!(!vct.contains("#VECTOREND"));
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = StilToVctStream::new(
            dir.path().join("absent.stil"),
            dir.path().join("out.vct"),
            VecSink::new(),
            false,
        );
        assert_eq!(stream.convert(), ConvertOutcome::Error);
    }

    #[test]
    fn non_stil_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.stil");
        std::fs::write(&input, "WGL 2.0;\n").unwrap();
        let mut stream =
            StilToVctStream::new(&input, dir.path().join("out.vct"), VecSink::new(), false);
        assert_eq!(stream.convert(), ConvertOutcome::Error);
    }
}
