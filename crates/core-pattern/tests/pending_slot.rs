mod common;

use common::{demo_tables, emitted, run, run_with_disabled, with_burst};
use core_events::ParseEvent;
use core_pattern::ParseOutcome;
use pretty_assertions::assert_eq;

#[test]
fn micro_attaches_to_the_previous_plain_vector() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "V { all = 000; } V { all = 111; } Stop;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].instr, "");
    assert_eq!(rows[1].instr, "Stop");
    assert_eq!(common::wfc_of(&rows[1], "all"), "111");
    assert_eq!(rows[0].address, 0);
    assert_eq!(rows[1].address, 1);
}

#[test]
fn micro_after_annotated_vector_emits_its_own_row() {
    let tables = demo_tables(&[], &[]);
    // The RPT row is not plain, so `Goto` cannot rewrite it.
    let (sink, _) = run(&tables, "Loop 3 { V { all = 111; } } Goto top;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].instr, "RPT");
    assert_eq!(rows[1].instr, "Goto");
    assert_eq!(rows[1].param, "top");
    assert!(rows[1].cells.is_empty(), "micro-only row has no channel data");
}

#[test]
fn micro_without_preceding_vector_is_micro_only() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "Stop;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].cells.is_empty());
    assert_eq!(rows[0].instr, "Stop");
}

#[test]
fn waveform_change_flushes_the_slot_first() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "V { all = 000; } W wt2; V { all = 111; }");
    let mut saw_vector = false;
    for event in &sink.events {
        match event {
            ParseEvent::Vector { row, .. } if row.address() == 0 => saw_vector = true,
            ParseEvent::WaveformChange { wft } => {
                assert_eq!(wft, "wt2");
                assert!(saw_vector, "pending row must flush before the change");
            }
            _ => {}
        }
    }
}

#[test]
fn label_attaches_to_the_next_vector_only() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "here: V { all = 010; } V { all = 111; }");
    let rows = emitted(&sink);
    assert_eq!(rows[0].label, "here");
    assert_eq!(rows[1].label, "");
}

#[test]
fn label_on_micro_statement_rides_the_stamped_row() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "V { all = 010; } brk: Stop;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].instr, "Stop");
    assert_eq!(rows[0].label, "brk");
}

#[test]
fn partial_rows_reuse_previous_wfcs() {
    let mut tables = demo_tables(&[], &[]);
    tables.pattern_header = vec!["all".to_string(), "q".to_string()];
    let (sink, _) = run(&tables, "V { all = 010; q = H; } V { all = 111; } Stop;");
    let rows = emitted(&sink);
    assert_eq!(common::wfc_of(&rows[0], "q"), "H");
    // Second row omitted `q`; the previous value is reused.
    assert_eq!(common::wfc_of(&rows[1], "q"), "H");
    assert_eq!(common::wfc_of(&rows[1], "all"), "111");
}

#[test]
fn disabled_instruction_is_fatal_with_single_error() {
    let tables = demo_tables(&[], &[]);
    let (sink, outcome) = run_with_disabled(
        &tables,
        "V { all = 000; } ScanChain chain1;",
        &["ScanChain"],
    );
    assert_eq!(outcome, ParseOutcome::Fatal);
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("not supported"));
    // Parse-complete still fires so downstream consumers unwind cleanly.
    assert!(
        sink.events
            .iter()
            .any(|e| matches!(e, ParseEvent::ParseComplete { .. }))
    );
}

#[test]
fn unknown_instruction_warns_and_forwards() {
    let tables = demo_tables(&[], &[]);
    let (sink, outcome) = run(&tables, "V { all = 000; } FlushPipe;");
    assert_eq!(outcome, ParseOutcome::Complete);
    let rows = emitted(&sink);
    assert_eq!(rows[0].instr, "FlushPipe");
    assert!(sink.events.iter().any(|e| matches!(
        e,
        ParseEvent::Log { message } if message.contains("unknown statement")
    )));
}

#[test]
fn grammar_error_skips_statement_without_advancing_addresses() {
    let tables = demo_tables(&[], &[]);
    let (sink, outcome) = run(
        &tables,
        "V { all = 000; }\n= broken = ;\nV { all = 111; } Stop;",
    );
    assert_eq!(outcome, ParseOutcome::Complete);
    assert_eq!(sink.errors().len(), 1);
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].address, 1);
}

#[test]
fn patterns_outside_the_selected_burst_are_skipped() {
    let tables = with_burst(demo_tables(&[], &[]), &["p1"]);
    let text = "Pattern p1 {\nV { all = 000; }\n}\nPattern p9 {\nV { all = 111; }\nStop;\n}\n";
    let mut parser =
        core_pattern::PatternStreamParser::new(&tables, std::collections::HashSet::new());
    let mut sink = core_events::VecSink::new();
    let outcome = parser
        .parse_patterns(std::io::Cursor::new(text.as_bytes().to_vec()), &mut sink)
        .unwrap();
    assert_eq!(outcome, ParseOutcome::Complete);
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(common::wfc_of(&rows[0], "all"), "000");
}

#[test]
fn repeated_pattern_name_is_fatal() {
    let tables = demo_tables(&[], &[]);
    let text = "Pattern p1 {\nV { all = 000; }\n}\nPattern p1 {\nStop;\n}\n";
    let mut parser =
        core_pattern::PatternStreamParser::new(&tables, std::collections::HashSet::new());
    let mut sink = core_events::VecSink::new();
    let outcome = parser
        .parse_patterns(std::io::Cursor::new(text.as_bytes().to_vec()), &mut sink)
        .unwrap();
    assert_eq!(outcome, ParseOutcome::Fatal);
    assert!(sink.errors()[0].contains("more than once"));
}

#[test]
fn stop_flag_ends_the_run_without_parse_complete() {
    let tables = demo_tables(&[], &[]);
    let mut parser =
        core_pattern::PatternStreamParser::new(&tables, std::collections::HashSet::new());
    parser.stop_handle().store(true, std::sync::atomic::Ordering::Relaxed);
    let text = "Pattern p1 {\nV { all = 000; }\nStop;\n}\n";
    let mut sink = core_events::VecSink::new();
    let outcome = parser
        .parse_patterns(std::io::Cursor::new(text.as_bytes().to_vec()), &mut sink)
        .unwrap();
    assert_eq!(outcome, ParseOutcome::Stopped);
    assert!(
        !sink
            .events
            .iter()
            .any(|e| matches!(e, ParseEvent::ParseComplete { .. }))
    );
}
