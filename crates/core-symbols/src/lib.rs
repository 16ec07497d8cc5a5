//! Header scanning and symbol tables.
//!
//! The header pass reads a STIL file up to the first `Pattern` block,
//! accumulates every prior section into one buffer, parses that buffer
//! once, and populates the symbol tables the rest of the pipeline consults:
//! signals (declaration order preserved), signal groups (qualified by
//! domain), analysed timing tables (declaration order drives RRADR
//! allocation), pattern bursts, the last-wins PatternExec selection, header
//! key/values, and the verbatim procedure/macro bodies.
//!
//! The scanner also reads ahead into the first pattern block for the first
//! complete `V { ... }` statement: its key list becomes the row-wise
//! *pattern header* that partial vector rows reuse.

use core_syntax::SyntaxError;
use core_syntax::header::{self, RawBlock};
use core_syntax::slicer::{Sliced, StatementSlicer};
use core_syntax::statement::{Statement, parse_statements};
use core_timing::{
    Analysis, Edge, RawWaveform, SignalDirection, TimingData, analyze_waveform,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("not a STIL file: input begins with '{0}'")]
    NotStil(String),
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A declared signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub name: String,
    pub direction: Option<SignalDirection>,
}

/// A signal group, qualified by its (optional) domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// `domain.group` when a domain was declared, else the bare name.
    pub qualified: String,
    pub name: String,
    pub signals: Vec<String>,
}

/// One analysed waveform table.
#[derive(Debug, Clone)]
pub struct WftTable {
    pub domain: String,
    pub name: String,
    pub period: String,
    pub records: Vec<TimingData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternBurst {
    pub name: String,
    pub signal_groups_domain: Option<String>,
    pub patterns: Vec<String>,
}

/// Everything the header pass learns about a file.
#[derive(Debug, Default)]
pub struct SymbolTables {
    pub signals: Vec<Signal>,
    pub groups: Vec<GroupEntry>,
    pub timings: Vec<WftTable>,
    pub bursts: Vec<PatternBurst>,
    pub headers: Vec<(String, String)>,
    pub procedures: HashMap<String, String>,
    pub macros: HashMap<String, String>,
    pub selected_burst: Option<String>,
    pub selected_timing_domain: Option<String>,
    /// Ordered distinct signal/group keys of the first vector row.
    pub pattern_header: Vec<String>,
}

impl SymbolTables {
    pub fn direction_of(&self, signal: &str) -> Option<SignalDirection> {
        self.signals
            .iter()
            .find(|s| s.name == signal)
            .and_then(|s| s.direction)
    }

    /// Resolve a vector-row key to its signal list: exact qualified group
    /// match first, then group name, then the signal itself.
    pub fn signals_for_key(&self, key: &str) -> Option<Vec<String>> {
        if let Some(g) = self.groups.iter().find(|g| g.qualified == key) {
            return Some(g.signals.clone());
        }
        if let Some(g) = self.groups.iter().find(|g| g.name == key) {
            return Some(g.signals.clone());
        }
        if self.signals.iter().any(|s| s.name == key) {
            return Some(vec![key.to_string()]);
        }
        None
    }

    pub fn burst(&self, name: &str) -> Option<&PatternBurst> {
        self.bursts.iter().find(|b| b.name == name)
    }

    /// The burst selected by the last PatternExec, falling back to a sole
    /// declared burst.
    pub fn selected_burst(&self) -> Option<&PatternBurst> {
        match &self.selected_burst {
            Some(name) => self.burst(name),
            None if self.bursts.len() == 1 => self.bursts.first(),
            None => None,
        }
    }

    /// Signals actually used by the pattern rows, in declaration order of
    /// the pattern header; all declared signals when no header was found.
    pub fn used_signals(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for key in &self.pattern_header {
            if let Some(signals) = self.signals_for_key(key) {
                for s in signals {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
        }
        if out.is_empty() {
            out = self.signals.iter().map(|s| s.name.clone()).collect();
        }
        out
    }
}

/// Header-pass result: tables plus the diagnostics to surface.
#[derive(Debug, Default)]
pub struct HeaderScan {
    pub tables: SymbolTables,
    pub warnings: Vec<String>,
}

/// Scan a STIL file's header region.
pub fn scan_header(path: &Path) -> Result<HeaderScan, SymbolError> {
    let reader = BufReader::new(File::open(path)?);
    scan_header_reader(reader)
}

/// Scan from any buffered reader (tests feed strings through this).
pub fn scan_header_reader<R: BufRead>(mut reader: R) -> Result<HeaderScan, SymbolError> {
    let mut buffer = String::new();
    let mut line = String::new();
    let mut saw_pattern = false;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.starts_with("Pattern ") && trimmed.contains('{') {
            saw_pattern = true;
            break;
        }
        buffer.push_str(&line);
    }

    let first_content = buffer
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("//"))
        .unwrap_or("");
    if !first_content.starts_with("STIL ") {
        return Err(SymbolError::NotStil(
            first_content.chars().take(40).collect(),
        ));
    }

    let mut scan = HeaderScan::default();
    populate_tables(&mut scan, &buffer)?;

    if saw_pattern {
        scan.tables.pattern_header = detect_pattern_header(reader, &mut scan.warnings)?;
    }
    tracing::debug!(
        target: "convert.header",
        signals = scan.tables.signals.len(),
        groups = scan.tables.groups.len(),
        wfts = scan.tables.timings.len(),
        bursts = scan.tables.bursts.len(),
        "header scan complete"
    );
    Ok(scan)
}

fn populate_tables(scan: &mut HeaderScan, buffer: &str) -> Result<(), SymbolError> {
    let blocks = header::split_blocks(buffer)?;
    for block in &blocks {
        match block.keyword.as_str() {
            "STIL" => {}
            "Header" => {
                scan.tables.headers = header::parse_header_block(&block.body)?;
            }
            "Signals" => {
                for decl in header::parse_signals(&block.body)? {
                    scan.tables.signals.push(Signal {
                        direction: SignalDirection::parse(&decl.direction),
                        name: decl.name,
                    });
                }
            }
            "SignalGroups" => {
                let domain = block.name.clone();
                for decl in header::parse_signal_groups(&block.body)? {
                    let qualified = match &domain {
                        Some(d) => format!("{d}.{}", decl.name),
                        None => decl.name.clone(),
                    };
                    scan.tables.groups.push(GroupEntry {
                        qualified,
                        name: decl.name,
                        signals: decl.signals,
                    });
                }
            }
            "Timing" => {
                let domain = block.name.clone().unwrap_or_default();
                ingest_timing(scan, &domain, block)?;
            }
            "PatternBurst" => {
                let name = block.name.clone().unwrap_or_default();
                let decl = header::parse_pattern_burst(&name, &block.body)?;
                scan.tables.bursts.push(PatternBurst {
                    name: decl.name,
                    signal_groups_domain: decl.signal_groups,
                    patterns: decl.patterns,
                });
            }
            "PatternExec" => {
                let decl = header::parse_pattern_exec(&block.body)?;
                // Last PatternExec wins.
                if decl.timing.is_some() {
                    scan.tables.selected_timing_domain = decl.timing;
                }
                if decl.burst.is_some() {
                    scan.tables.selected_burst = decl.burst;
                }
            }
            "Procedures" => {
                for (name, body) in header::parse_named_bodies(&block.body)? {
                    scan.tables.procedures.insert(name, body);
                }
            }
            "MacroDefs" => {
                for (name, body) in header::parse_named_bodies(&block.body)? {
                    scan.tables.macros.insert(name, body);
                }
            }
            other => {
                scan.warnings
                    .push(format!("Warning: unrecognised header block '{other}'"));
            }
        }
    }
    Ok(())
}

fn ingest_timing(scan: &mut HeaderScan, domain: &str, block: &RawBlock) -> Result<(), SymbolError> {
    for decl in header::parse_timing(&block.body)? {
        let mut table = WftTable {
            domain: domain.to_string(),
            name: decl.name.clone(),
            period: decl.period.clone(),
            records: Vec::new(),
        };
        for entry in &decl.entries {
            let raw = RawWaveform {
                wft: decl.name.clone(),
                period: decl.period.clone(),
                signal: entry.signal.clone(),
                wfc: entry.wfc.clone(),
                edges: entry
                    .edges
                    .iter()
                    .map(|(t, e)| Edge {
                        time: t.clone(),
                        events: e.clone(),
                    })
                    .collect(),
            };
            // Direction comes from the signal itself, or from the first
            // member when the waveform names a group.
            let lookup_name = scan
                .tables
                .signals_for_key(&entry.signal)
                .and_then(|sigs| sigs.first().cloned())
                .unwrap_or_else(|| entry.signal.clone());
            let direction = scan.tables.direction_of(&lookup_name);
            let Analysis { records, warnings } = analyze_waveform(&raw, direction);
            table.records.extend(records);
            scan.warnings.extend(warnings);
        }
        scan.tables.timings.push(table);
    }
    Ok(())
}

/// Read forward from just inside the first pattern block until the first
/// complete `V` statement, and return its distinct keys in order.
fn detect_pattern_header<R: BufRead>(
    reader: R,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>, SymbolError> {
    let mut slicer = StatementSlicer::new_mid_pattern(reader);
    while let Some(item) = slicer.next_item()? {
        let Sliced::Statement(text) = item else {
            continue;
        };
        match parse_statements(&text) {
            Ok(stmts) => {
                for stmt in &stmts {
                    if let Some(keys) = first_vector_keys(stmt) {
                        return Ok(keys);
                    }
                }
            }
            Err(_) => {
                warnings.push(format!(
                    "Warning: skipped unparsable statement while probing the pattern header: '{}'",
                    text.chars().take(60).collect::<String>()
                ));
            }
        }
    }
    Ok(Vec::new())
}

/// Distinct keys of the first `V` row found in a statement (descending into
/// loop bodies).
fn first_vector_keys(stmt: &Statement) -> Option<Vec<String>> {
    match stmt {
        Statement::Vector { rows, .. } => {
            let mut keys = Vec::new();
            for row in rows {
                if !keys.contains(&row.key) {
                    keys.push(row.key.clone());
                }
            }
            Some(keys)
        }
        Statement::Loop { body, .. } | Statement::MatchLoop { body, .. } => {
            body.iter().find_map(first_vector_keys)
        }
        _ => None,
    }
}
