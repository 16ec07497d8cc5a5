mod common;

use common::{demo_tables, emitted, run};
use core_events::ParseEvent;
use pretty_assertions::assert_eq;

#[test]
fn call_expands_the_procedure_body() {
    let tables = demo_tables(&[("shift", "V { data = 01; }")], &[]);
    let (sink, _) = run(&tables, "Call shift;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(common::wfc_of(&rows[0], "data"), "01");
    assert!(sink.events.iter().any(|e| matches!(
        e,
        ParseEvent::ProcedureCall { name, body, .. } if name == "shift" && !body.is_empty()
    )));
}

#[test]
fn caller_override_wins_over_body_data() {
    let tables = demo_tables(&[("shift", "V { data = 01; }")], &[]);
    let (sink, _) = run(&tables, "Call shift { V { data = 10; } }");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(common::wfc_of(&rows[0], "data"), "10");
}

#[test]
fn override_applies_to_every_row_of_the_body() {
    let tables = demo_tables(
        &[("shift", "V { data = 00; } V { data = 01; } V { data = 11; }")],
        &[],
    );
    let (sink, _) = run(&tables, "Call shift { data = XX; } Stop;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(common::wfc_of(row, "data"), "XX");
    }
}

#[test]
fn override_table_is_scoped_to_the_expansion() {
    let tables = demo_tables(&[("shift", "V { data = 01; }")], &[]);
    let (sink, _) = run(&tables, "Call shift { data = 10; } V { data = 01; } Stop;");
    let rows = emitted(&sink);
    assert_eq!(common::wfc_of(&rows[0], "data"), "10");
    // Back outside the call, the caller's own data is untouched.
    assert_eq!(common::wfc_of(&rows[1], "data"), "01");
}

#[test]
fn waveform_table_is_restored_after_the_call() {
    let tables = demo_tables(&[("burst_wft", "W wt2; V { data = 0; }")], &[]);
    let (sink, _) = run(&tables, "W wt1; Call burst_wft; V { data = 1; } Stop;");
    let changes: Vec<&str> = sink
        .events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::WaveformChange { wft } => Some(wft.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec!["wt1", "wt2", "wt1"]);
}

#[test]
fn missing_procedure_emits_bare_call() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "Call nowhere;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].instr, "Call");
    assert_eq!(rows[0].param, "nowhere");
    assert!(rows[0].cells.is_empty());
    assert!(sink.errors()[0].contains("not found"));
}

#[test]
fn macro_expansion_uses_the_macro_table() {
    let tables = demo_tables(&[], &[("init", "V { all = 000; }")]);
    let (sink, _) = run(&tables, "Macro init;");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(common::wfc_of(&rows[0], "all"), "000");

    // A Call does not see macro definitions.
    let (sink, _) = run(&tables, "Call init;");
    assert!(sink.errors()[0].contains("not found"));
}

#[test]
fn procedure_call_event_precedes_body_events() {
    let tables = demo_tables(&[("shift", "V { data = 01; }")], &[]);
    let (sink, _) = run(&tables, "V { all = 111; } Call shift; Stop;");
    let call_pos = sink
        .events
        .iter()
        .position(|e| matches!(e, ParseEvent::ProcedureCall { .. }))
        .unwrap();
    let body_row_pos = sink
        .events
        .iter()
        .position(|e| matches!(e, ParseEvent::Vector { row, .. } if row.address() == 1))
        .unwrap();
    assert!(call_pos < body_row_pos);
}

#[test]
fn self_recursive_procedure_degrades_to_bare_call() {
    let tables = demo_tables(&[("again", "V { data = 0; } Call again;")], &[]);
    let (sink, _) = run(&tables, "Call again;");
    assert!(
        sink.errors()
            .iter()
            .any(|e| e.contains("expansion depth")),
        "recursion must hit the depth limit"
    );
    // The run still terminates with a parse-complete.
    assert!(
        sink.events
            .iter()
            .any(|e| matches!(e, ParseEvent::ParseComplete { .. }))
    );
}

#[test]
fn labelled_call_labels_the_first_expanded_row() {
    let tables = demo_tables(&[("shift", "V { data = 01; }")], &[]);
    let (sink, _) = run(&tables, "entry: Call shift; Stop;");
    let rows = emitted(&sink);
    assert_eq!(rows[0].label, "entry");
}
