mod common;

use common::{demo_tables, emitted, run};
use pretty_assertions::assert_eq;

#[test]
fn single_vector_region_carries_both_markers() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "[\nV { all = 010; }\n]");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].instr, "BreakPoint");
    assert_eq!(rows[0].param, "S E");
}

#[test]
fn multi_vector_region_marks_first_and_last() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(
        &tables,
        "[\nV { all = 000; }\nV { all = 010; }\nV { all = 111; }\n]",
    );
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 3);
    assert_eq!((rows[0].instr.as_str(), rows[0].param.as_str()), ("BreakPoint", "S"));
    assert_eq!(rows[1].instr, "");
    assert_eq!((rows[2].instr.as_str(), rows[2].param.as_str()), ("BreakPoint", "E"));
}

#[test]
fn vectors_before_the_region_are_not_captured() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "V { all = 111; }\n[\nV { all = 000; }\n]");
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].instr, "");
    assert_eq!(rows[1].instr, "BreakPoint");
}

#[test]
fn micro_instruction_inside_region_is_reported() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(
        &tables,
        "[\nV { all = 000; }\nV { all = 010; }\nGoto top;\nV { all = 111; }\n]",
    );
    assert!(
        sink.errors()
            .iter()
            .any(|e| e.contains("micro-instruction")),
        "unexpected instruction inside a breakpoint region must surface"
    );
}

#[test]
fn empty_region_warns() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "[\n]\nV { all = 111; } Stop;");
    assert!(sink.errors().iter().any(|e| e.contains("no vectors")));
    let rows = emitted(&sink);
    assert_eq!(rows.len(), 1);
}

#[test]
fn stray_close_bracket_warns() {
    let tables = demo_tables(&[], &[]);
    let (sink, _) = run(&tables, "]\nV { all = 111; } Stop;");
    assert!(sink.errors().iter().any(|e| e.contains("stray")));
}
