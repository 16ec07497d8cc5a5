//! Pattern transformer and control-flow rewriter.
//!
//! Consumes sliced pattern statements and emits the event stream the VCT
//! emitter renders. The interesting machinery lives in three places:
//!
//! * the one-slot **pending vector**: a plain `V` row is held back so the
//!   next micro-instruction statement can retroactively annotate it (the
//!   target equipment attaches control opcodes to the preceding cycle);
//! * the **deferred list**: while inside `Loop` / `MatchLoop` /
//!   breakpoint brackets, rows accumulate as tagged variants until the
//!   construct closes and is rewritten into flat `LI`/`JNI`/`RPT`
//!   (`MBGN`/`MEND`/`IMATCH`, `BreakPoint S`/`E`) sequences;
//! * **Call/Macro expansion**: procedure bodies are re-sliced and run
//!   through the same state, with the caller's vector overrides winning
//!   over the body's own data and the waveform table restored on return.
//!
//! Invariants (checked at parse-complete):
//! * `loop_depth == 0` and `bracket_depth == 0`;
//! * the pending slot is empty;
//! * vector addresses advanced by exactly one per emitted row, micro-only
//!   rows included.

use core_events::{EventSink, ParseEvent, VectorRow};
use core_symbols::SymbolTables;
use core_syntax::SyntaxError;
use core_syntax::slicer::{Sliced, StatementSlicer, slice_str};
use core_syntax::statement::{Statement, VecData, parse_statements};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

const MATCHLOOP_INFINITE: &str = "0xFFFFFF";
const MAX_EXPANSION_DEPTH: u32 = 16;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How a parse run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// End of stream reached; `#VECTOREND` may be written.
    Complete,
    /// The stop flag was observed between statements.
    Stopped,
    /// A deny-listed instruction aborted the run.
    Fatal,
}

// -------------------------------------------------------------------------------------------------
// Internal row / deferred-list model
// -------------------------------------------------------------------------------------------------

/// Label (or back-edge parameter) that may still be unresolved: auto labels
/// take the printed address of the row that ends up carrying the `LI`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelRef {
    Text(String),
    Auto(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParamRef {
    Text(String),
    Auto(u32),
}

/// A not-yet-emitted vector row.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
    cells: Vec<(String, String)>,
    instr: String,
    param: ParamRef,
    label: Option<LabelRef>,
}

impl Row {
    fn is_plain(&self) -> bool {
        self.instr.is_empty() || self.instr == "ADV"
    }

    fn stamp(&mut self, instr: &str, param: ParamRef, label: Option<LabelRef>) {
        self.instr = instr.to_string();
        self.param = param;
        if label.is_some() {
            self.label = label;
        }
    }
}

/// Deferred-list variants (the closed set replacing the source project's
/// dict-shaped messages).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Deferred {
    Vector(Row),
    Waveform(String),
    Annotation(String),
    LoopMarker {
        matching: bool,
        depth: u32,
        count: String,
        label: Option<String>,
    },
    BreakMarker,
    Instruction {
        instr: String,
        param: ParamRef,
        label: Option<LabelRef>,
    },
}

/// Mutable per-conversion parser state. Never shared between conversions.
#[derive(Debug, Default)]
pub struct ParserState {
    pub current_wft: String,
    pub vector_count: u64,
    next_address: u64,
    loop_depth: u32,
    bracket_depth: u32,
    expansion_depth: u32,
    pending: Option<Row>,
    pending_label: Option<String>,
    deferred: Vec<Deferred>,
    /// Call/Macro override table; scoped per expansion.
    replacement: HashMap<String, String>,
    /// Last seen WFC per key, for partial-row completion.
    last_wfc: HashMap<String, String>,
    /// Ordered row keys; seeded from the scanned pattern header.
    header_keys: Vec<String>,
    seen_patterns: HashSet<String>,
    auto_seq: u32,
    auto_labels: HashMap<u32, String>,
}

// -------------------------------------------------------------------------------------------------
// Parser
// -------------------------------------------------------------------------------------------------

enum PatternGate {
    Run,
    Skip,
    Fatal,
}

pub struct PatternStreamParser<'a> {
    tables: &'a SymbolTables,
    disabled: HashSet<String>,
    stop: Arc<AtomicBool>,
    bytes_read: Arc<AtomicU64>,
    pub state: ParserState,
}

impl<'a> PatternStreamParser<'a> {
    pub fn new(tables: &'a SymbolTables, disabled: HashSet<String>) -> Self {
        Self::with_stop(tables, disabled, Arc::new(AtomicBool::new(false)))
    }

    /// Build a parser sharing an externally owned stop flag.
    pub fn with_stop(
        tables: &'a SymbolTables,
        disabled: HashSet<String>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let mut state = ParserState::default();
        state.header_keys = tables.pattern_header.clone();
        Self {
            tables,
            disabled,
            stop,
            bytes_read: Arc::new(AtomicU64::new(0)),
            state,
        }
    }

    /// Shared stop flag; setting it ends the run at the next statement
    /// boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Counter of input bytes consumed so far, for progress reporting.
    pub fn bytes_read_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_read)
    }

    /// Drive a full pattern pass over `reader`, emitting events into `sink`.
    pub fn parse_patterns<R: BufRead>(
        &mut self,
        reader: R,
        sink: &mut dyn EventSink,
    ) -> Result<ParseOutcome, PatternError> {
        let mut slicer = StatementSlicer::new(reader);

        sink.event(ParseEvent::ParseStart);
        for (key, value) in &self.tables.headers {
            sink.event(ParseEvent::Header {
                key: key.clone(),
                value: value.clone(),
            });
        }
        let burst_name = self
            .tables
            .selected_burst()
            .map(|b| b.name.clone())
            .unwrap_or_default();
        sink.event(ParseEvent::VectorStart { burst: burst_name });

        let outcome = loop {
            if self.stop.load(Ordering::Relaxed) {
                self.finish_interrupted(sink);
                break ParseOutcome::Stopped;
            }
            let item = match slicer.next_item() {
                Ok(Some(item)) => {
                    self.bytes_read.store(slicer.bytes_read(), Ordering::Relaxed);
                    item
                }
                Ok(None) => {
                    self.finish_complete(sink);
                    break ParseOutcome::Complete;
                }
                Err(e) => {
                    sink.event(ParseEvent::ParseError {
                        message: format!("read error: {e}"),
                        statement: String::new(),
                    });
                    return Err(e.into());
                }
            };
            match item {
                Sliced::PatternOpen(name) => match self.open_pattern(&name, sink) {
                    PatternGate::Run => {}
                    PatternGate::Skip => slicer.skip_current_pattern()?,
                    PatternGate::Fatal => {
                        self.flush_pending(sink);
                        sink.event(ParseEvent::ParseComplete {
                            vector_count: self.state.vector_count,
                        });
                        break ParseOutcome::Fatal;
                    }
                },
                Sliced::PatternClose => {}
                other => {
                    if !self.process_item(other, sink) {
                        break ParseOutcome::Fatal;
                    }
                }
            }
        };
        tracing::info!(
            target: "convert.pattern",
            vectors = self.state.vector_count,
            ?outcome,
            "pattern pass finished"
        );
        Ok(outcome)
    }

    fn open_pattern(&mut self, name: &str, sink: &mut dyn EventSink) -> PatternGate {
        if !self.state.seen_patterns.insert(name.to_string()) {
            sink.event(ParseEvent::ParseError {
                message: format!("pattern '{name}' appears more than once"),
                statement: String::new(),
            });
            return PatternGate::Fatal;
        }
        if let Some(burst) = self.tables.selected_burst() {
            if !burst.patterns.iter().any(|p| p == name) {
                sink.event(ParseEvent::Log {
                    message: format!(
                        "pattern '{name}' is not part of burst '{}', skipped",
                        burst.name
                    ),
                });
                return PatternGate::Skip;
            }
        }
        PatternGate::Run
    }

    /// Process one sliced item. Returns `false` on a fatal (deny-listed)
    /// instruction.
    fn process_item(&mut self, item: Sliced, sink: &mut dyn EventSink) -> bool {
        match item {
            Sliced::Statement(text) => match parse_statements(&text) {
                Ok(stmts) => {
                    for stmt in stmts {
                        if !self.process_statement(stmt, sink) {
                            return false;
                        }
                    }
                    true
                }
                Err(e) => {
                    // Recoverable: report, discard, continue at the next
                    // boundary. The address counter does not advance.
                    sink.event(ParseEvent::ParseError {
                        message: e.to_string(),
                        statement: text.chars().take(200).collect(),
                    });
                    true
                }
            },
            Sliced::BracketOpen => {
                self.state.deferred.push(Deferred::BreakMarker);
                self.state.bracket_depth += 1;
                true
            }
            Sliced::BracketClose => {
                self.close_bracket(sink);
                true
            }
            Sliced::PatternOpen(_) | Sliced::PatternClose => true,
        }
    }

    fn process_statement(&mut self, stmt: Statement, sink: &mut dyn EventSink) -> bool {
        match stmt {
            Statement::Label(name) => {
                if !self.in_deferred_region() {
                    self.flush_pending(sink);
                }
                if let Some(old) = self.state.pending_label.replace(name) {
                    sink.event(ParseEvent::Label { name: old });
                }
                true
            }
            Statement::Annotation(text) => {
                if self.in_deferred_region() {
                    self.state.deferred.push(Deferred::Annotation(text));
                } else {
                    self.flush_pending(sink);
                    sink.event(ParseEvent::Annotation { text });
                }
                true
            }
            Statement::Waveform(wft) => {
                self.state.current_wft = wft.clone();
                if self.in_deferred_region() {
                    self.state.deferred.push(Deferred::Waveform(wft));
                } else {
                    self.flush_pending(sink);
                    sink.event(ParseEvent::WaveformChange { wft });
                }
                true
            }
            Statement::Vector { label, rows } => {
                if let Some(label) = label {
                    if !self.in_deferred_region() {
                        self.flush_pending(sink);
                    }
                    if let Some(old) = self.state.pending_label.replace(label) {
                        sink.event(ParseEvent::Label { name: old });
                    }
                }
                let row = self.build_row(rows);
                if self.in_deferred_region() {
                    self.state.deferred.push(Deferred::Vector(row));
                } else {
                    self.flush_pending(sink);
                    self.state.pending = Some(row);
                }
                true
            }
            Statement::Loop { label, count, body } => {
                self.run_loop(label, count, body, false, sink)
            }
            Statement::MatchLoop { label, count, body } => {
                self.run_loop(label, count, body, true, sink)
            }
            Statement::Call {
                label,
                name,
                overrides,
            } => self.expand_invocation(label, name, overrides, false, sink),
            Statement::Macro {
                label,
                name,
                overrides,
            } => self.expand_invocation(label, name, overrides, true, sink),
            Statement::Micro { label, name, param } => {
                self.process_micro(label, name, param, sink)
            }
        }
    }

    fn in_deferred_region(&self) -> bool {
        self.state.loop_depth > 0 || self.state.bracket_depth > 0
    }

    // ---------------------------------------------------------------------------------------------
    // Row construction
    // ---------------------------------------------------------------------------------------------

    /// Build a row over the pattern-header keys, reusing the previous WFC
    /// for keys this statement omits and applying any Call override.
    fn build_row(&mut self, rows: Vec<VecData>) -> Row {
        if self.state.header_keys.is_empty() {
            self.state.header_keys = rows.iter().map(|r| r.key.clone()).collect();
        }
        let provided: HashMap<&str, &str> = rows
            .iter()
            .map(|r| (r.key.as_str(), r.wfc.as_str()))
            .collect();

        let mut cells: Vec<(String, String)> = Vec::with_capacity(self.state.header_keys.len());
        for key in &self.state.header_keys {
            let wfc = provided
                .get(key.as_str())
                .map(|w| (*w).to_string())
                .or_else(|| self.state.last_wfc.get(key).cloned())
                .unwrap_or_default();
            cells.push((key.clone(), wfc));
        }
        for row in &rows {
            if !self.state.header_keys.iter().any(|k| k == &row.key) {
                cells.push((row.key.clone(), row.wfc.clone()));
            }
        }
        for (key, wfc) in &mut cells {
            if let Some(outer) = self.state.replacement.get(key) {
                *wfc = outer.clone();
            }
            self.state.last_wfc.insert(key.clone(), wfc.clone());
        }

        Row {
            cells,
            instr: String::new(),
            param: ParamRef::Text(String::new()),
            label: self.state.pending_label.take().map(LabelRef::Text),
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Emission
    // ---------------------------------------------------------------------------------------------

    fn resolve_label(&mut self, label: Option<LabelRef>, address: u64) -> String {
        match label {
            None => String::new(),
            Some(LabelRef::Text(t)) => t,
            Some(LabelRef::Auto(id)) => {
                let text = format!("0x{address:06X}");
                self.state.auto_labels.insert(id, text.clone());
                text
            }
        }
    }

    fn resolve_param(&mut self, param: ParamRef) -> String {
        match param {
            ParamRef::Text(t) => t,
            ParamRef::Auto(id) => self
                .state
                .auto_labels
                .get(&id)
                .cloned()
                .unwrap_or_else(|| "0x000000".to_string()),
        }
    }

    fn emit_row(&mut self, row: Row, sink: &mut dyn EventSink) {
        let address = self.state.next_address;
        self.state.next_address += 1;
        self.state.vector_count += 1;

        let label = self.resolve_label(row.label, address);
        let param = self.resolve_param(row.param);
        let mut out = VectorRow::new();
        for (key, wfc) in row.cells {
            out.push(key, wfc);
        }
        out.stamp(&row.instr, &param, &label);
        out.set_address(address);
        sink.event(ParseEvent::Vector {
            row: out,
            instr: row.instr,
            param,
        });
    }

    fn emit_micro(
        &mut self,
        label: Option<LabelRef>,
        instr: String,
        param: ParamRef,
        sink: &mut dyn EventSink,
    ) {
        let address = self.state.next_address;
        self.state.next_address += 1;
        self.state.vector_count += 1;
        let label = self.resolve_label(label, address);
        let param = self.resolve_param(param);
        sink.event(ParseEvent::MicroInstruction {
            label,
            instr,
            param,
            address,
        });
    }

    fn flush_pending(&mut self, sink: &mut dyn EventSink) {
        if let Some(row) = self.state.pending.take() {
            self.emit_row(row, sink);
        }
    }

    /// Emit the deferred list once every construct is closed.
    fn drain_deferred(&mut self, sink: &mut dyn EventSink) {
        if self.in_deferred_region() {
            return;
        }
        self.flush_pending(sink);
        let items = std::mem::take(&mut self.state.deferred);
        for item in items {
            match item {
                Deferred::Vector(row) => self.emit_row(row, sink),
                Deferred::Instruction {
                    instr,
                    param,
                    label,
                } => self.emit_micro(label, instr, param, sink),
                Deferred::Annotation(text) => sink.event(ParseEvent::Annotation { text }),
                Deferred::Waveform(wft) => sink.event(ParseEvent::WaveformChange { wft }),
                Deferred::LoopMarker { .. } | Deferred::BreakMarker => {}
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Micro-instruction statements
    // ---------------------------------------------------------------------------------------------

    fn is_known_micro(name: &str) -> bool {
        matches!(
            name,
            "Stop"
                | "Goto"
                | "Call"
                | "Macro"
                | "Return"
                | "IddqTestPoint"
                | "IDDQTestPoint"
                | "BreakPoint"
        )
    }

    /// Returns `false` (fatal) for deny-listed instructions.
    fn process_micro(
        &mut self,
        label: Option<String>,
        name: String,
        param: String,
        sink: &mut dyn EventSink,
    ) -> bool {
        if self.disabled.contains(&name) {
            sink.event(ParseEvent::ParseError {
                message: format!("instruction '{name}' is not supported (disabled)"),
                statement: String::new(),
            });
            self.flush_pending(sink);
            sink.event(ParseEvent::ParseComplete {
                vector_count: self.state.vector_count,
            });
            return false;
        }
        if !Self::is_known_micro(&name) {
            sink.event(ParseEvent::Log {
                message: format!("Warning: unknown statement '{name}', forwarded as-is"),
            });
        }

        let label = label.or_else(|| self.state.pending_label.take());
        let label_ref = label.map(LabelRef::Text);
        if self.in_deferred_region() {
            self.state.deferred.push(Deferred::Instruction {
                instr: name,
                param: ParamRef::Text(param),
                label: label_ref,
            });
            return true;
        }

        match self.state.pending.take() {
            Some(mut row) if row.is_plain() => {
                row.stamp(&name, ParamRef::Text(param), label_ref);
                self.emit_row(row, sink);
            }
            Some(row) => {
                self.emit_row(row, sink);
                self.emit_micro(label_ref, name, ParamRef::Text(param), sink);
            }
            None => {
                self.emit_micro(label_ref, name, ParamRef::Text(param), sink);
            }
        }
        true
    }

    // ---------------------------------------------------------------------------------------------
    // Loop / MatchLoop rewriting
    // ---------------------------------------------------------------------------------------------

    fn run_loop(
        &mut self,
        label: Option<String>,
        count: String,
        body: Vec<Statement>,
        matching: bool,
        sink: &mut dyn EventSink,
    ) -> bool {
        let label = label.or_else(|| self.state.pending_label.take());
        let depth = self.state.loop_depth;
        self.state.deferred.push(Deferred::LoopMarker {
            matching,
            depth,
            count,
            label,
        });
        self.state.loop_depth += 1;
        for stmt in body {
            if !self.process_statement(stmt, sink) {
                return false;
            }
        }
        self.close_loop(sink);
        true
    }

    fn close_loop(&mut self, sink: &mut dyn EventSink) {
        self.state.loop_depth -= 1;

        // Pop back to our marker.
        let marker_pos = self
            .state
            .deferred
            .iter()
            .rposition(|d| matches!(d, Deferred::LoopMarker { .. }));
        let Some(marker_pos) = marker_pos else {
            return;
        };
        let mut body: Vec<Deferred> = self.state.deferred.split_off(marker_pos + 1);
        let Some(Deferred::LoopMarker {
            matching,
            depth,
            count,
            label,
        }) = self.state.deferred.pop()
        else {
            return;
        };

        let vector_count = body
            .iter()
            .filter(|d| matches!(d, Deferred::Vector(_)))
            .count();
        if vector_count == 0 {
            // Empty body: ignored, no warning. Non-vector items survive.
            self.state.deferred.append(&mut body);
            self.drain_deferred(sink);
            return;
        }

        let infinite = matching
            && (count.eq_ignore_ascii_case("infinite") || count == "MATCHLOOP_INF");
        let n = parse_count(&count).unwrap_or_else(|| {
            if !infinite {
                sink.event(ParseEvent::ParseError {
                    message: format!("Warning: loop count '{count}' is not a number, using 1"),
                    statement: String::new(),
                });
            }
            1
        });

        let (open_instr, back_instr, repeat_instr) = if matching {
            ("MBGN".to_string(), "MEND".to_string(), "IMATCH")
        } else {
            (format!("LI{depth}"), format!("JNI{depth}"), "RPT")
        };
        let open_param = if infinite {
            MATCHLOOP_INFINITE.to_string()
        } else {
            (n.saturating_sub(1)).to_string()
        };
        let repeat_param = if infinite {
            MATCHLOOP_INFINITE.to_string()
        } else {
            n.to_string()
        };

        if vector_count == 1 {
            // A single vector collapses the whole construct into one
            // repeat row.
            for item in &mut body {
                if let Deferred::Vector(row) = item {
                    row.stamp(
                        repeat_instr,
                        ParamRef::Text(repeat_param.clone()),
                        label.clone().map(LabelRef::Text),
                    );
                }
            }
            if self.in_deferred_region() {
                self.state.deferred.append(&mut body);
            } else {
                // The repeat row stays in the pending slot: a following
                // loop may still split it to carry its own open
                // instruction.
                self.flush_pending(sink);
                for item in body {
                    match item {
                        Deferred::Vector(row) => self.state.pending = Some(row),
                        Deferred::Instruction {
                            instr,
                            param,
                            label,
                        } => self.emit_micro(label, instr, param, sink),
                        Deferred::Annotation(text) => {
                            sink.event(ParseEvent::Annotation { text });
                        }
                        Deferred::Waveform(wft) => {
                            sink.event(ParseEvent::WaveformChange { wft });
                        }
                        Deferred::LoopMarker { .. } | Deferred::BreakMarker => {}
                    }
                }
            }
            return;
        }

        let label_ref = match label {
            Some(text) => LabelRef::Text(text),
            None => {
                self.state.auto_seq += 1;
                LabelRef::Auto(self.state.auto_seq)
            }
        };
        let back_param = match &label_ref {
            LabelRef::Text(t) => ParamRef::Text(t.clone()),
            LabelRef::Auto(id) => ParamRef::Auto(*id),
        };

        // Attach the loop-open instruction to the vector preceding the
        // body, when one is available and willing.
        let preceding = self
            .state
            .deferred
            .iter_mut()
            .rev()
            .find_map(|d| match d {
                Deferred::Vector(row) => Some(row),
                _ => None,
            })
            .or(self.state.pending.as_mut());

        enum OpenSite {
            Attached,
            InsertCopy(Row),
            BareBeforeBody,
            NoPreceding,
        }
        let site = match preceding {
            Some(row) if row.is_plain() => {
                row.stamp(
                    &open_instr,
                    ParamRef::Text(open_param.clone()),
                    Some(label_ref.clone()),
                );
                OpenSite::Attached
            }
            Some(row) if row.instr == "RPT" => {
                let rpt = match &row.param {
                    ParamRef::Text(p) => parse_count(p).filter(|v| *v >= 2),
                    ParamRef::Auto(_) => None,
                };
                match rpt {
                    Some(rpt) => {
                        // Split: shave one repeat off and let a copy carry
                        // the loop-open annotation.
                        let mut copy = row.clone();
                        row.param = ParamRef::Text((rpt - 1).to_string());
                        copy.stamp(
                            &open_instr,
                            ParamRef::Text(open_param.clone()),
                            Some(label_ref.clone()),
                        );
                        OpenSite::InsertCopy(copy)
                    }
                    None => OpenSite::BareBeforeBody,
                }
            }
            Some(_) => OpenSite::BareBeforeBody,
            None => OpenSite::NoPreceding,
        };
        match site {
            OpenSite::Attached => {}
            OpenSite::InsertCopy(copy) => body.insert(0, Deferred::Vector(copy)),
            OpenSite::BareBeforeBody => body.insert(
                0,
                Deferred::Instruction {
                    instr: open_instr.clone(),
                    param: ParamRef::Text(open_param.clone()),
                    label: Some(label_ref.clone()),
                },
            ),
            OpenSite::NoPreceding => {
                // Nothing before the loop at all: the body's first plain
                // vector carries the annotation, else a bare micro row.
                let mut attached = false;
                if let Some(Deferred::Vector(first)) = body
                    .iter_mut()
                    .find(|d| matches!(d, Deferred::Vector(_)))
                {
                    if first.is_plain() {
                        first.stamp(
                            &open_instr,
                            ParamRef::Text(open_param.clone()),
                            Some(label_ref.clone()),
                        );
                        attached = true;
                    }
                }
                if !attached {
                    body.insert(
                        0,
                        Deferred::Instruction {
                            instr: open_instr.clone(),
                            param: ParamRef::Text(open_param.clone()),
                            label: Some(label_ref.clone()),
                        },
                    );
                }
            }
        }

        // Back edge on the last vector of the body.
        let last_is_vector = matches!(body.last(), Some(Deferred::Vector(row)) if row.is_plain());
        if last_is_vector {
            if let Some(Deferred::Vector(row)) = body.last_mut() {
                row.stamp(&back_instr, back_param, None);
            }
        } else {
            body.push(Deferred::Instruction {
                instr: back_instr,
                param: back_param,
                label: None,
            });
        }

        self.state.deferred.append(&mut body);
        self.drain_deferred(sink);
    }

    // ---------------------------------------------------------------------------------------------
    // BreakPoint brackets
    // ---------------------------------------------------------------------------------------------

    fn close_bracket(&mut self, sink: &mut dyn EventSink) {
        if self.state.bracket_depth == 0 {
            sink.event(ParseEvent::ParseError {
                message: "Warning: stray breakpoint close bracket".to_string(),
                statement: String::new(),
            });
            return;
        }
        self.state.bracket_depth -= 1;

        let marker_pos = self
            .state
            .deferred
            .iter()
            .rposition(|d| matches!(d, Deferred::BreakMarker));
        let Some(marker_pos) = marker_pos else {
            return;
        };
        let mut body: Vec<Deferred> = self.state.deferred.split_off(marker_pos + 1);
        self.state.deferred.pop(); // the marker

        for item in &body {
            if let Deferred::Instruction { instr, .. } = item {
                sink.event(ParseEvent::ParseError {
                    message: format!(
                        "breakpoint region contains micro-instruction '{instr}'"
                    ),
                    statement: String::new(),
                });
            }
        }

        let vector_positions: Vec<usize> = body
            .iter()
            .enumerate()
            .filter_map(|(i, d)| matches!(d, Deferred::Vector(_)).then_some(i))
            .collect();

        match vector_positions.as_slice() {
            [] => {
                sink.event(ParseEvent::ParseError {
                    message: "Warning: breakpoint region contains no vectors".to_string(),
                    statement: String::new(),
                });
            }
            [only] => {
                if let Deferred::Vector(row) = &mut body[*only] {
                    if !row.is_plain() {
                        sink.event(ParseEvent::ParseError {
                            message:
                                "breakpoint region vector already carries a micro-instruction"
                                    .to_string(),
                            statement: String::new(),
                        });
                    }
                    row.stamp("BreakPoint", ParamRef::Text("S E".to_string()), None);
                }
            }
            [first, inner @ .., last] => {
                for pos in inner {
                    if let Deferred::Vector(row) = &body[*pos] {
                        if !row.is_plain() {
                            sink.event(ParseEvent::ParseError {
                                message: format!(
                                    "breakpoint region contains micro-instruction '{}'",
                                    row.instr
                                ),
                                statement: String::new(),
                            });
                        }
                    }
                }
                if let Deferred::Vector(row) = &mut body[*first] {
                    row.stamp("BreakPoint", ParamRef::Text("S".to_string()), None);
                }
                if let Deferred::Vector(row) = &mut body[*last] {
                    row.stamp("BreakPoint", ParamRef::Text("E".to_string()), None);
                }
            }
        }

        self.state.deferred.append(&mut body);
        self.drain_deferred(sink);
    }

    // ---------------------------------------------------------------------------------------------
    // Call / Macro expansion
    // ---------------------------------------------------------------------------------------------

    fn expand_invocation(
        &mut self,
        label: Option<String>,
        name: String,
        overrides: Vec<VecData>,
        is_macro: bool,
        sink: &mut dyn EventSink,
    ) -> bool {
        if let Some(label) = label {
            if !self.in_deferred_region() {
                self.flush_pending(sink);
            }
            if let Some(old) = self.state.pending_label.replace(label) {
                sink.event(ParseEvent::Label { name: old });
            }
        }

        let kind = if is_macro { "macro" } else { "procedure" };
        let table = if is_macro {
            &self.tables.macros
        } else {
            &self.tables.procedures
        };
        let Some(body) = table.get(&name).cloned() else {
            sink.event(ParseEvent::ParseError {
                message: format!("Warning: {kind} '{name}' not found, emitting bare CALL"),
                statement: String::new(),
            });
            return self.process_micro(None, "Call".to_string(), name, sink);
        };

        if self.state.expansion_depth >= MAX_EXPANSION_DEPTH {
            sink.event(ParseEvent::ParseError {
                message: format!(
                    "Warning: {kind} '{name}' exceeds the expansion depth limit, emitting bare CALL"
                ),
                statement: String::new(),
            });
            return self.process_micro(None, "Call".to_string(), name, sink);
        }

        let items = match slice_str(&body) {
            Ok(items) => items,
            Err(e) => {
                sink.event(ParseEvent::ParseError {
                    message: format!("Warning: {kind} '{name}' body failed to parse: {e}"),
                    statement: body.chars().take(100).collect(),
                });
                return self.process_micro(None, "Call".to_string(), name, sink);
            }
        };

        sink.event(ParseEvent::ProcedureCall {
            name: name.clone(),
            body: body.clone(),
            address: self.state.next_address,
        });

        // Scoped substitution: the caller's data wins inside the body, the
        // caller's waveform table is restored on return.
        let saved_replacement = self.state.replacement.clone();
        for row in overrides {
            self.state.replacement.insert(row.key, row.wfc);
        }
        let saved_wft = self.state.current_wft.clone();
        self.state.expansion_depth += 1;

        let mut ok = true;
        for item in items {
            if !self.process_item(item, sink) {
                ok = false;
                break;
            }
        }

        self.state.expansion_depth -= 1;
        self.state.replacement = saved_replacement;
        if ok && self.state.current_wft != saved_wft {
            self.state.current_wft = saved_wft.clone();
            if !self.in_deferred_region() {
                self.flush_pending(sink);
                sink.event(ParseEvent::WaveformChange { wft: saved_wft });
            } else {
                self.state.deferred.push(Deferred::Waveform(saved_wft));
            }
        }
        ok
    }

    // ---------------------------------------------------------------------------------------------
    // End-of-run paths
    // ---------------------------------------------------------------------------------------------

    fn finish_complete(&mut self, sink: &mut dyn EventSink) {
        if self.state.loop_depth != 0 || self.state.bracket_depth != 0 {
            sink.event(ParseEvent::ParseError {
                message: format!(
                    "Warning: unbalanced constructs at end of input (loop depth {}, bracket depth {})",
                    self.state.loop_depth, self.state.bracket_depth
                ),
                statement: String::new(),
            });
            self.state.loop_depth = 0;
            self.state.bracket_depth = 0;
        }
        self.drain_deferred(sink);
        self.flush_pending(sink);
        if let Some(label) = self.state.pending_label.take() {
            sink.event(ParseEvent::Label { name: label });
        }
        sink.event(ParseEvent::ParseComplete {
            vector_count: self.state.vector_count,
        });
    }

    fn finish_interrupted(&mut self, sink: &mut dyn EventSink) {
        // Labels and pending rows must not be left dangling.
        self.state.loop_depth = 0;
        self.state.bracket_depth = 0;
        self.drain_deferred(sink);
        self.flush_pending(sink);
        if let Some(label) = self.state.pending_label.take() {
            sink.event(ParseEvent::Label { name: label });
        }
        sink.event(ParseEvent::Log {
            message: format!(
                "conversion stopped after {} vectors",
                self.state.vector_count
            ),
        });
    }
}

fn parse_count(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    token.parse().ok()
}
