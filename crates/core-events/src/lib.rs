//! Core event types for the STIL -> VCT conversion pipeline.
//!
//! Every stage of a conversion communicates through the closed set of
//! variants in [`ParseEvent`]; the core never prints or logs on its own.
//! Consumers implement [`EventSink`] (the VCT emitter, the CLI relay, test
//! collectors) and receive events in the strict serial order the pattern
//! transformer produces them.
//!
//! Design invariants:
//! * Events from one conversion are totally ordered; sinks may assume a
//!   `ParseStart` .. `ParseComplete` bracket except when the run is stopped
//!   or fails fatally (deny-listed instruction), in which case
//!   `ParseComplete` may follow an error directly or be absent.
//! * A [`VectorRow`] carries one [`VectorEntry`] per signal/group key of the
//!   pattern header; instruction, parameter, label, and address are
//!   replicated across the entries of a row (the downstream row format is
//!   column-oriented and reads them off any entry).
//! * Addresses increase by exactly one per `Vector` and per
//!   `MicroInstruction` event.

use std::fmt;

// -------------------------------------------------------------------------------------------------
// Vector rows
// -------------------------------------------------------------------------------------------------

/// One per-channel-group cell of a vector row: the 6-tuple
/// `(signal-or-group, wfc-string, instr, param, label, address)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorEntry {
    /// Signal or signal-group key as written in the `V { key = ... }` block.
    pub key: String,
    /// Expanded waveform-character string (repeat compression already undone).
    pub wfc: String,
    /// Micro-instruction name attached to the row; empty for a plain row.
    pub instr: String,
    /// Micro-instruction parameter (loop count, jump target, ...).
    pub param: String,
    /// Label decorating the row; empty when none.
    pub label: String,
    /// Vector address assigned at emission time.
    pub address: u64,
}

/// An ordered vector row. All entries of an emitted row share the same
/// `instr`/`param`/`label`/`address`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorRow {
    pub entries: Vec<VectorEntry>,
}

impl VectorRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, wfc: impl Into<String>) {
        self.entries.push(VectorEntry {
            key: key.into(),
            wfc: wfc.into(),
            instr: String::new(),
            param: String::new(),
            label: String::new(),
            address: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instruction carried by the row (entries are uniform; the first wins).
    pub fn instr(&self) -> &str {
        self.entries.first().map_or("", |e| e.instr.as_str())
    }

    pub fn param(&self) -> &str {
        self.entries.first().map_or("", |e| e.param.as_str())
    }

    pub fn label(&self) -> &str {
        self.entries.first().map_or("", |e| e.label.as_str())
    }

    pub fn address(&self) -> u64 {
        self.entries.first().map_or(0, |e| e.address)
    }

    /// A row is plain when it carries no instruction (or only the default
    /// advance), i.e. a later micro-instruction may still rewrite it.
    pub fn is_plain(&self) -> bool {
        let instr = self.instr();
        instr.is_empty() || instr == "ADV"
    }

    /// Stamp every entry with the given instruction triple.
    pub fn stamp(&mut self, instr: &str, param: &str, label: &str) {
        for e in &mut self.entries {
            e.instr = instr.to_string();
            e.param = param.to_string();
            e.label = label.to_string();
        }
    }

    /// Assign the emission address on every entry.
    pub fn set_address(&mut self, address: u64) {
        for e in &mut self.entries {
            e.address = address;
        }
    }

    /// Overwrite the label on every entry.
    pub fn set_label(&mut self, label: &str) {
        for e in &mut self.entries {
            e.label = label.to_string();
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Events
// -------------------------------------------------------------------------------------------------

/// The closed event vocabulary of one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// Pattern parsing is about to begin.
    ParseStart,
    /// One recognised STIL header key/value pair (Title, Date, Source, ...).
    Header { key: String, value: String },
    /// The vector section starts; `burst` names the selected pattern burst.
    VectorStart { burst: String },
    /// `W` statement switched the active waveform table.
    WaveformChange { wft: String },
    /// `Ann {* ... *}` annotation body.
    Annotation { text: String },
    /// A label that could not attach to a row and stands on its own line.
    Label { name: String },
    /// One complete vector row ready for emission.
    Vector {
        row: VectorRow,
        instr: String,
        param: String,
    },
    /// A procedure or macro invocation whose body was expanded in-line.
    /// Emitted before any event produced by the expanded body.
    ProcedureCall {
        name: String,
        body: String,
        address: u64,
    },
    /// A micro-instruction-only row (all channels unoccupied).
    MicroInstruction {
        label: String,
        instr: String,
        param: String,
        address: u64,
    },
    /// Parsing finished; `vector_count` rows were emitted.
    ParseComplete { vector_count: u64 },
    /// Free-form progress/diagnostic text for the caller's log.
    Log { message: String },
    /// A statement failed to parse or violated a structural rule.
    ParseError { message: String, statement: String },
}

/// Colour class a caller may apply to a relayed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Classify an event for display. Errors are red, warnings yellow,
    /// everything else default; `Log` lines are sniffed for the original
    /// translator's "Warning:" prefix so recoverable diagnostics keep their
    /// colour through the single-sink funnel.
    pub fn of(event: &ParseEvent) -> Severity {
        match event {
            ParseEvent::ParseError { message, .. } => {
                if message.starts_with("Warning") || message.starts_with("warning") {
                    Severity::Warning
                } else {
                    Severity::Error
                }
            }
            ParseEvent::Log { message } => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("error") || lower.contains("failed") {
                    Severity::Error
                } else if lower.contains("warning") {
                    Severity::Warning
                } else {
                    Severity::Info
                }
            }
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Sinks
// -------------------------------------------------------------------------------------------------

/// Receiver of conversion events. Implementations must not assume they are
/// called from any particular thread, but all calls for one conversion come
/// from the same thread in order.
pub trait EventSink {
    fn event(&mut self, event: ParseEvent);
}

/// Discards every event. Useful for header-only scans.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&mut self, _event: ParseEvent) {}
}

/// Records every event for later inspection (test collector).
#[derive(Debug, Default)]
pub struct VecSink {
    pub events: Vec<ParseEvent>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ParseEvent::ParseError { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for VecSink {
    fn event(&mut self, event: ParseEvent) {
        tracing::trace!(target: "convert.events", ?event, "collected");
        self.events.push(event);
    }
}

impl<F: FnMut(ParseEvent)> EventSink for F {
    fn event(&mut self, event: ParseEvent) {
        self(event)
    }
}
