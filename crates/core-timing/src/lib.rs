//! Waveform timing analysis.
//!
//! Takes the raw waveform definitions collected by the header scanner and
//! derives, per waveform character:
//! * the vector-replacement character folded into the vector stream,
//! * the edge format (NORMAL / DNRZ / RZ / RO / C / CC, or none),
//! * the driver/strobe classification used by the CLOCKn/STROBEn emitter.
//!
//! Multi-character definitions are split into one record per character; the
//! parent aggregates its children's raw edge patterns to infer a table-wide
//! format (`RZ`, `RO`) or the paired `N`/`P` replacements.
//!
//! Invariants:
//! * `vector_replacement` is at most one character.
//! * A record classified `Unknown` never reaches the CLOCK/STROBE output.

pub mod units;

pub use units::{TimeUnit, TimeUnitConverter};

use smallvec::SmallVec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimingError {
    #[error("unparsable time literal: '{0}'")]
    BadTimeLiteral(String),
    #[error("timing tables exceed the {0} available RRADR slots")]
    RradrOverflow(usize),
}

/// Signal direction as declared in the STIL `Signals` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDirection {
    In,
    Out,
    InOut,
    Supply,
    Pseudo,
}

impl SignalDirection {
    pub fn parse(s: &str) -> Option<SignalDirection> {
        match s {
            "In" => Some(SignalDirection::In),
            "Out" => Some(SignalDirection::Out),
            "InOut" => Some(SignalDirection::InOut),
            "Supply" => Some(SignalDirection::Supply),
            "Pseudo" => Some(SignalDirection::Pseudo),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalDirection::In => "In",
            SignalDirection::Out => "Out",
            SignalDirection::InOut => "InOut",
            SignalDirection::Supply => "Supply",
            SignalDirection::Pseudo => "Pseudo",
        }
    }
}

/// Driver/strobe classification of one analysed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrobeClass {
    /// Not classifiable (Supply/Pseudo signals); skipped by the formatter.
    #[default]
    Unknown,
    /// Compare edge: emits a STROBEn line.
    Strobe,
    /// Drive edge: emits a CLOCKn line.
    Driver,
    /// InOut signal: emits both a CLOCKn and a STROBEn line.
    Bidirectional,
}

/// One `(time, events)` pair of a waveform definition. `events` holds the
/// concatenated event letters for that time slot (one letter per WFC in a
/// multi-character definition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub time: String,
    pub events: String,
}

/// A waveform definition as read from the Timing block, before analysis.
#[derive(Debug, Clone, Default)]
pub struct RawWaveform {
    pub wft: String,
    pub period: String,
    pub signal: String,
    pub wfc: String,
    pub edges: SmallVec<[Edge; 4]>,
}

/// An analysed per-character timing record.
#[derive(Debug, Clone, Default)]
pub struct TimingData {
    pub wft: String,
    pub period: String,
    pub signal: String,
    /// Exactly one character after splitting.
    pub wfc: String,
    pub edges: SmallVec<[Edge; 4]>,
    pub strobe: StrobeClass,
    pub edge_format: String,
    pub vector_replacement: String,
}

impl TimingData {
    /// Number of usable edges (both a time and an event present).
    pub fn edge_count(&self) -> usize {
        self.edges
            .iter()
            .filter(|e| !e.time.is_empty() && !e.events.is_empty())
            .count()
    }
}

/// Analysis output: the flattened leaf records plus any diagnostics that the
/// caller should surface through its event sink.
#[derive(Debug, Default)]
pub struct Analysis {
    pub records: Vec<TimingData>,
    pub warnings: Vec<String>,
}

// -------------------------------------------------------------------------------------------------
// Edge-pattern classification
// -------------------------------------------------------------------------------------------------

/// Collapse an event pattern: `N` counts as `D`, consecutive duplicates
/// merge, and once more than one distinct letter remains the harmless
/// modifiers `P`, `X`, `Z` are stripped.
fn collapse_pattern(raw: &str) -> String {
    let mut collapsed = String::new();
    let mut prev = None;
    for ch in raw.chars() {
        let ch = if ch == 'N' { 'D' } else { ch };
        if prev != Some(ch) {
            collapsed.push(ch);
            prev = Some(ch);
        }
    }
    if collapsed.chars().count() > 1 {
        collapsed.retain(|c| c != 'P' && c != 'X' && c != 'Z');
    }
    collapsed
}

/// The fixed (collapsed pattern) -> (vector char, edge format) table.
/// Returns `None` for patterns outside the table.
fn classify_pattern(pattern: &str) -> Option<(&'static str, &'static str)> {
    let entry = match pattern {
        "D" => ("0", "NORMAL"),
        "U" => ("1", "NORMAL"),
        "UD" => ("0", "DNRZ"),
        "DU" => ("1", "DNRZ"),
        "UDU" => ("N", ""),
        "DUD" => ("P", ""),
        "N" => ("0", ""),
        "P" => ("Q", ""),
        "Z" | "" => ("X", ""),
        "L" => ("L", "C"),
        "H" => ("H", "C"),
        "X" => ("X", "C"),
        "T" => ("T", "C"),
        "V" => ("V", "C"),
        "l" => ("l", "CC"),
        "h" => ("h", "C"),
        "t" => ("t", "C"),
        "v" => ("v", "C"),
        _ => return None,
    };
    Some(entry)
}

/// Raw (uncollapsed) event pattern with `N` normalised to `D`; the
/// parent-level aggregation works on these. Letter case is preserved so
/// the compare-window events (`l`, `h`, `t`, `v`) reach their own table
/// rows instead of aliasing the windowless compare states.
fn raw_pattern(record: &TimingData) -> String {
    record
        .edges
        .iter()
        .filter(|e| !e.events.is_empty())
        .flat_map(|e| e.events.chars())
        .map(|c| if c == 'N' { 'D' } else { c })
        .collect()
}

fn classify_strobe(direction: Option<SignalDirection>, format: &str) -> StrobeClass {
    match direction {
        Some(SignalDirection::Out) => StrobeClass::Strobe,
        Some(SignalDirection::In) => StrobeClass::Driver,
        Some(SignalDirection::InOut) => StrobeClass::Bidirectional,
        Some(SignalDirection::Supply) | Some(SignalDirection::Pseudo) => StrobeClass::Unknown,
        None => {
            // Only the bare compare class reads as a strobe; the
            // compare-window class `CC` stays a driver.
            if format == "C" {
                StrobeClass::Strobe
            } else {
                StrobeClass::Driver
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Splitting and analysis
// -------------------------------------------------------------------------------------------------

/// Split a multi-character definition into one record per WFC. Event strings
/// whose length matches the WFC count contribute one letter per child; any
/// other length cycles (a single event letter therefore applies to every
/// child).
fn split_children(raw: &RawWaveform) -> Vec<TimingData> {
    let wfcs: Vec<char> = raw.wfc.chars().collect();
    let first_events_blank = raw
        .edges
        .first()
        .map_or(true, |e| e.events.trim().is_empty());
    if first_events_blank {
        return Vec::new();
    }
    let mut children = Vec::with_capacity(wfcs.len());
    for (i, wfc) in wfcs.iter().enumerate() {
        let mut child = TimingData {
            wft: raw.wft.clone(),
            period: raw.period.clone(),
            signal: raw.signal.clone(),
            wfc: wfc.to_string(),
            ..TimingData::default()
        };
        for edge in &raw.edges {
            if edge.events.trim().is_empty() {
                continue;
            }
            let letters: Vec<char> = edge.events.chars().collect();
            let letter = if letters.len() == wfcs.len() {
                letters[i]
            } else {
                letters[i % letters.len()]
            };
            child.edges.push(Edge {
                time: edge.time.clone(),
                events: letter.to_string(),
            });
        }
        children.push(child);
    }
    children
}

/// Analyse one raw waveform definition into its leaf records.
pub fn analyze_waveform(raw: &RawWaveform, direction: Option<SignalDirection>) -> Analysis {
    let mut out = Analysis::default();

    let mut leaves = if raw.wfc.chars().count() > 1 {
        split_children(raw)
    } else {
        vec![TimingData {
            wft: raw.wft.clone(),
            period: raw.period.clone(),
            signal: raw.signal.clone(),
            wfc: raw.wfc.clone(),
            edges: raw.edges.clone(),
            ..TimingData::default()
        }]
    };

    for leaf in &mut leaves {
        let raw_pat = raw_pattern(leaf);
        let collapsed = collapse_pattern(&raw_pat);
        match classify_pattern(&collapsed) {
            Some((replacement, format)) => {
                leaf.vector_replacement = replacement.to_string();
                leaf.edge_format = format.to_string();
            }
            None => {
                out.warnings.push(format!(
                    "Warning: edge pattern '{}' of {}:{} has no known format",
                    collapsed, leaf.signal, leaf.wfc
                ));
                leaf.vector_replacement = "X".to_string();
            }
        }
    }

    // Table-wide aggregation over the children of a split definition.
    if raw.wfc.chars().count() > 1 && !leaves.is_empty() {
        let patterns: Vec<String> = leaves.iter().map(|l| raw_pattern(l)).collect();
        let has = |p: &str| patterns.iter().any(|x| x == p);
        let parent_format = if has("UDU") && has("DUD") {
            // Children already resolved to N/P via the pattern table.
            ""
        } else if has("UUU") && has("UDU") && !has("DDD") && !has("DUD") {
            "RO"
        } else if has("DDD") && has("DUD") && !has("UUU") && !has("UDU") {
            "RZ"
        } else {
            ""
        };
        if !parent_format.is_empty() {
            for leaf in &mut leaves {
                leaf.edge_format = parent_format.to_string();
            }
        }
    }

    for leaf in &mut leaves {
        leaf.strobe = classify_strobe(direction, &leaf.edge_format);
    }

    out.records = leaves;
    out
}
