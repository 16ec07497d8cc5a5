#![allow(dead_code)] // Shared across the transformer test binaries; each uses a subset.

use core_events::{ParseEvent, VecSink};
use core_pattern::{ParseOutcome, PatternStreamParser};
use core_symbols::{GroupEntry, PatternBurst, Signal, SymbolTables};
use std::collections::HashSet;
use std::io::Cursor;

/// Minimal symbol tables: signals `clk`/`data`/`q`, group `all`, plus any
/// supplied procedures and macros.
pub fn demo_tables(procedures: &[(&str, &str)], macros: &[(&str, &str)]) -> SymbolTables {
    let mut tables = SymbolTables::default();
    for name in ["clk", "data", "q"] {
        tables.signals.push(Signal {
            name: name.to_string(),
            direction: None,
        });
    }
    tables.groups.push(GroupEntry {
        qualified: "all".to_string(),
        name: "all".to_string(),
        signals: vec!["clk".into(), "data".into(), "q".into()],
    });
    for (name, body) in procedures {
        tables
            .procedures
            .insert((*name).to_string(), (*body).to_string());
    }
    for (name, body) in macros {
        tables.macros.insert((*name).to_string(), (*body).to_string());
    }
    tables
}

pub fn with_burst(mut tables: SymbolTables, patterns: &[&str]) -> SymbolTables {
    tables.bursts.push(PatternBurst {
        name: "burst1".to_string(),
        signal_groups_domain: None,
        patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
    });
    tables.selected_burst = Some("burst1".to_string());
    tables
}

/// Run a pattern body (the text inside `Pattern p1 { ... }`) through the
/// transformer and collect every event.
pub fn run(tables: &SymbolTables, body: &str) -> (VecSink, ParseOutcome) {
    run_with_disabled(tables, body, &[])
}

pub fn run_with_disabled(
    tables: &SymbolTables,
    body: &str,
    disabled: &[&str],
) -> (VecSink, ParseOutcome) {
    let text = format!("Pattern p1 {{\n{body}\n}}\n");
    let disabled: HashSet<String> = disabled.iter().map(|d| (*d).to_string()).collect();
    let mut parser = PatternStreamParser::new(tables, disabled);
    let mut sink = VecSink::new();
    let outcome = parser
        .parse_patterns(Cursor::new(text.into_bytes()), &mut sink)
        .expect("pattern pass");
    (sink, outcome)
}

/// One emitted output row (vector or micro-only), as the VCT section would
/// render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub instr: String,
    pub param: String,
    pub label: String,
    pub address: u64,
    /// `(key, wfc)` cells; empty for micro-only rows.
    pub cells: Vec<(String, String)>,
}

pub fn emitted(sink: &VecSink) -> Vec<Emitted> {
    sink.events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Vector { row, instr, param } => Some(Emitted {
                instr: instr.clone(),
                param: param.clone(),
                label: row.label().to_string(),
                address: row.address(),
                cells: row
                    .entries
                    .iter()
                    .map(|c| (c.key.clone(), c.wfc.clone()))
                    .collect(),
            }),
            ParseEvent::MicroInstruction {
                label,
                instr,
                param,
                address,
            } => Some(Emitted {
                instr: instr.clone(),
                param: param.clone(),
                label: label.clone(),
                address: *address,
                cells: Vec::new(),
            }),
            _ => None,
        })
        .collect()
}

pub fn wfc_of(row: &Emitted, key: &str) -> String {
    row.cells
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, w)| w.clone())
        .unwrap_or_default()
}
