//! Pattern-statement grammar.
//!
//! Parses one complete sliced statement into the closed [`Statement`] set.
//! Vector data is repeat-expanded here so downstream code only ever sees
//! bare WFC strings. Unknown statement keywords parse into
//! [`Statement::Micro`]; the transformer decides (via the deny-list)
//! whether forwarding them is acceptable.

use crate::SyntaxError;
use crate::expand::expand_vec_data;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char as ch, multispace0, multispace1, satisfy},
    combinator::{all_consuming, opt, recognize},
    multi::{many0, many1},
    sequence::{pair, preceded, terminated},
};

/// One `key = wfc` cell of a `V { ... }` block, repeat-expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VecData {
    pub key: String,
    pub wfc: String,
}

/// A classified pattern statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// A label with no statement of its own on this slice.
    Label(String),
    /// `Ann {* ... *}` body text.
    Annotation(String),
    /// `W <wft>;` waveform-table switch.
    Waveform(String),
    /// `V { ... }` vector data row.
    Vector {
        label: Option<String>,
        rows: Vec<VecData>,
    },
    Loop {
        label: Option<String>,
        count: String,
        body: Vec<Statement>,
    },
    MatchLoop {
        label: Option<String>,
        count: String,
        body: Vec<Statement>,
    },
    Call {
        label: Option<String>,
        name: String,
        overrides: Vec<VecData>,
    },
    Macro {
        label: Option<String>,
        name: String,
        overrides: Vec<VecData>,
    },
    /// Any other single instruction (`Stop`, `Goto x`, `Return`,
    /// `IddqTestPoint`, unrecognised keywords).
    Micro {
        label: Option<String>,
        name: String,
        param: String,
    },
}

// -------------------------------------------------------------------------------------------------
// Lexical helpers
// -------------------------------------------------------------------------------------------------

pub(crate) fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

pub(crate) fn quoted(input: &str) -> IResult<&str, &str> {
    preceded(ch('"'), terminated(take_while(|c| c != '"'), ch('"')))(input)
}

pub(crate) fn name(input: &str) -> IResult<&str, &str> {
    alt((quoted, identifier))(input)
}

/// A bare parameter token: count, jump target, hex literal, ...
pub(crate) fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != ';' && c != '{' && c != '}')(input)
}

pub(crate) fn fail(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
}

fn label_prefix(input: &str) -> IResult<&str, String> {
    let (rest, label) = name(input)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = ch(':')(rest)?;
    Ok((rest, label.to_string()))
}

/// Consume a `{ ... }` chunk with balanced braces, returning the inside.
pub(crate) fn balanced_block(input: &str) -> IResult<&str, &str> {
    if !input.starts_with('{') {
        return Err(fail(input));
    }
    let mut depth = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&input[i + 1..], &input[1..i]));
                }
            }
            _ => {}
        }
    }
    Err(fail(input))
}

// -------------------------------------------------------------------------------------------------
// Statement parsers
// -------------------------------------------------------------------------------------------------

fn vec_row(input: &str) -> IResult<&str, VecData> {
    let (rest, _) = multispace0(input)?;
    let (rest, key) = name(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = ch('=')(rest)?;
    let (rest, data) = take_while(|c| c != ';' && c != '}')(rest)?;
    let (rest, _) = ch(';')(rest)?;
    Ok((
        rest,
        VecData {
            key: key.to_string(),
            wfc: expand_vec_data(data),
        },
    ))
}

fn vec_rows_block(input: &str) -> IResult<&str, Vec<VecData>> {
    let (rest, _) = multispace0(input)?;
    let (rest, _) = ch('{')(rest)?;
    let (rest, rows) = many0(vec_row)(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = ch('}')(rest)?;
    Ok((rest, rows))
}

fn v_tail(input: &str, label: Option<String>) -> IResult<&str, Statement> {
    let (rest, rows) = vec_rows_block(input)?;
    let (rest, _) = opt(preceded(multispace0, ch(';')))(rest)?;
    Ok((rest, Statement::Vector { label, rows }))
}

fn w_tail(input: &str) -> IResult<&str, Statement> {
    let (rest, _) = multispace1(input)?;
    let (rest, wft) = name(rest)?;
    let (rest, _) = opt(preceded(multispace0, ch(';')))(rest)?;
    Ok((rest, Statement::Waveform(wft.to_string())))
}

fn ann_tail(input: &str) -> IResult<&str, Statement> {
    let (rest, _) = multispace0(input)?;
    let (rest, _) = tag("{*")(rest)?;
    let (rest, text) = take_until("*}")(rest)?;
    let (rest, _) = tag("*}")(rest)?;
    let (rest, _) = opt(preceded(multispace0, ch(';')))(rest)?;
    Ok((rest, Statement::Annotation(text.trim().to_string())))
}

fn loop_tail(input: &str, label: Option<String>, matching: bool) -> IResult<&str, Statement> {
    let (rest, _) = multispace1(input)?;
    let (rest, count) = token(rest)?;
    let (rest, _) = multispace0(rest)?;
    if !rest.starts_with('{') {
        return Err(fail(rest));
    }
    let (rest, inner) = balanced_block(rest)?;
    let (_, body) = all_consuming(terminated(many0(statement), multispace0))(inner)?;
    let (rest, _) = opt(preceded(multispace0, ch(';')))(rest)?;
    let count = count.to_string();
    Ok((
        rest,
        if matching {
            Statement::MatchLoop { label, count, body }
        } else {
            Statement::Loop { label, count, body }
        },
    ))
}

/// Overrides inside `Call name { ... }`: either bare `key = wfc;` rows or
/// one or more nested `V { ... }` blocks.
fn call_overrides(input: &str) -> IResult<&str, Vec<VecData>> {
    let (rest, _) = multispace0(input)?;
    let (rest, _) = ch('{')(rest)?;
    let mut rows = Vec::new();
    let mut cur = rest;
    loop {
        let (next, _) = multispace0(cur)?;
        if let Some(stripped) = next.strip_prefix('}') {
            let (after, _) = opt(preceded(multispace0, ch(';')))(stripped)?;
            return Ok((after, rows));
        }
        if let Ok((after_v, kw)) = identifier(next) {
            if kw == "V" {
                let (after_block, mut v_rows) = vec_rows_block(after_v)?;
                let (after_block, _) = opt(preceded(multispace0, ch(';')))(after_block)?;
                rows.append(&mut v_rows);
                cur = after_block;
                continue;
            }
        }
        let (after_row, row) = vec_row(next)?;
        rows.push(row);
        cur = after_row;
    }
}

fn call_tail(input: &str, label: Option<String>, is_macro: bool) -> IResult<&str, Statement> {
    let (rest, _) = multispace1(input)?;
    let (rest, proc_name) = name(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, overrides) = if rest.starts_with('{') {
        call_overrides(rest)?
    } else {
        let (rest, _) = opt(ch(';'))(rest)?;
        (rest, Vec::new())
    };
    let name = proc_name.to_string();
    Ok((
        rest,
        if is_macro {
            Statement::Macro {
                label,
                name,
                overrides,
            }
        } else {
            Statement::Call {
                label,
                name,
                overrides,
            }
        },
    ))
}

fn micro_tail<'a>(
    input: &'a str,
    kw: &str,
    label: Option<String>,
) -> IResult<&'a str, Statement> {
    let (rest, param) = opt(preceded(multispace1, token))(input)?;
    let (rest, _) = multispace0(rest)?;
    // Terminator: `;`, an ignored braced body, or end of slice.
    let rest = if let Some(stripped) = rest.strip_prefix(';') {
        stripped
    } else if rest.starts_with('{') {
        let (rest, _) = balanced_block(rest)?;
        let (rest, _) = opt(preceded(multispace0, ch(';')))(rest)?;
        rest
    } else {
        rest
    };
    Ok((
        rest,
        Statement::Micro {
            label,
            name: kw.to_string(),
            param: param.unwrap_or("").to_string(),
        },
    ))
}

fn statement(input: &str) -> IResult<&str, Statement> {
    let (rest, _) = multispace0(input)?;
    if rest.is_empty() {
        return Err(fail(rest));
    }
    let (rest, label) = opt(label_prefix)(rest)?;
    let (rest, _) = multispace0(rest)?;
    if rest.is_empty() || rest.starts_with('}') {
        // Trailing label with nothing to attach to on this slice.
        return match label {
            Some(l) => Ok((rest, Statement::Label(l))),
            None => Err(fail(rest)),
        };
    }
    let (after_kw, kw) = identifier(rest)?;
    match kw {
        "V" => v_tail(after_kw, label),
        "W" | "WaveformTable" => w_tail(after_kw),
        "Ann" => ann_tail(after_kw),
        "Loop" => loop_tail(after_kw, label, false),
        "MatchLoop" => loop_tail(after_kw, label, true),
        "Call" => call_tail(after_kw, label, false),
        "Macro" => call_tail(after_kw, label, true),
        _ => micro_tail(after_kw, kw, label),
    }
}

/// Parse one complete statement slice. The error carries a snippet of the
/// offending text, truncated the way the diagnostics channel expects.
pub fn parse_statement(input: &str) -> Result<Statement, SyntaxError> {
    match all_consuming(terminated(statement, multispace0))(input) {
        Ok((_, stmt)) => Ok(stmt),
        Err(_) => Err(SyntaxError::Grammar(format!(
            "cannot parse statement '{}'",
            truncate(input, 200)
        ))),
    }
}

/// Parse a slice that may carry several statements on one line
/// (`V { ... } Stop;`). At least one statement must parse; the whole slice
/// must be consumed.
pub fn parse_statements(input: &str) -> Result<Vec<Statement>, SyntaxError> {
    match all_consuming(terminated(many1(statement), multispace0))(input) {
        Ok((_, stmts)) => Ok(stmts),
        Err(_) => Err(SyntaxError::Grammar(format!(
            "cannot parse statement '{}'",
            truncate(input, 200)
        ))),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn waveform_switch() {
        assert_eq!(
            parse_statement("W wt1;").unwrap(),
            Statement::Waveform("wt1".into())
        );
    }

    #[test]
    fn vector_with_expansion() {
        let stmt = parse_statement(r"V { _bidi_= \r9 X ; _pi_=NNN0N; }").unwrap();
        match stmt {
            Statement::Vector { label, rows } => {
                assert!(label.is_none());
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].key, "_bidi_");
                assert_eq!(rows[0].wfc, "XXXXXXXXX");
                assert_eq!(rows[1].wfc, "NNN0N");
            }
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn labelled_vector() {
        let stmt = parse_statement("stop: V {all = PPLLPL;}").unwrap();
        match stmt {
            Statement::Vector { label, rows } => {
                assert_eq!(label.as_deref(), Some("stop"));
                assert_eq!(rows[0].wfc, "PPLLPL");
            }
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn annotation_body() {
        let stmt = parse_statement("Ann {* Pattern:0 Vector:0 *}").unwrap();
        assert_eq!(stmt, Statement::Annotation("Pattern:0 Vector:0".into()));
    }

    #[test]
    fn loop_with_nested_body() {
        let stmt = parse_statement("Loop 5 { V { all = PPLL; } }").unwrap();
        match stmt {
            Statement::Loop { count, body, .. } => {
                assert_eq!(count, "5");
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn nested_loops_parse_recursively() {
        let stmt =
            parse_statement("Loop 2 { V { a = 1; } Loop 3 { V { a = 0; } } V { a = 1; } }")
                .unwrap();
        match stmt {
            Statement::Loop { body, .. } => {
                assert_eq!(body.len(), 3);
                assert!(matches!(body[1], Statement::Loop { .. }));
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn match_loop_with_symbolic_count() {
        let stmt = parse_statement("MatchLoop Infinite { V { a = H; } }").unwrap();
        assert!(matches!(
            stmt,
            Statement::MatchLoop { ref count, .. } if count == "Infinite"
        ));
    }

    #[test]
    fn bare_call() {
        assert_eq!(
            parse_statement("Call proc1;").unwrap(),
            Statement::Call {
                label: None,
                name: "proc1".into(),
                overrides: vec![],
            }
        );
    }

    #[test]
    fn call_with_v_override() {
        let stmt = parse_statement("Call shift { V { data = 10; } }").unwrap();
        match stmt {
            Statement::Call {
                name, overrides, ..
            } => {
                assert_eq!(name, "shift");
                assert_eq!(overrides, vec![VecData {
                    key: "data".into(),
                    wfc: "10".into()
                }]);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn call_with_bare_override_rows() {
        let stmt = parse_statement("Call shift { data = 10; clk = 1; }").unwrap();
        match stmt {
            Statement::Call { overrides, .. } => assert_eq!(overrides.len(), 2),
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn micro_statements() {
        assert_eq!(
            parse_statement("Stop;").unwrap(),
            Statement::Micro {
                label: None,
                name: "Stop".into(),
                param: "".into()
            }
        );
        assert_eq!(
            parse_statement("Goto start_lbl;").unwrap(),
            Statement::Micro {
                label: None,
                name: "Goto".into(),
                param: "start_lbl".into()
            }
        );
        assert_eq!(
            parse_statement("lp: Stop;").unwrap(),
            Statement::Micro {
                label: Some("lp".into()),
                name: "Stop".into(),
                param: "".into()
            }
        );
    }

    #[test]
    fn unknown_statement_becomes_micro() {
        let stmt = parse_statement("ScanChain chain1 { length 8; }").unwrap();
        assert_eq!(
            stmt,
            Statement::Micro {
                label: None,
                name: "ScanChain".into(),
                param: "chain1".into()
            }
        );
    }

    #[test]
    fn standalone_label() {
        assert_eq!(
            parse_statement("restart:").unwrap(),
            Statement::Label("restart".into())
        );
    }

    #[test]
    fn garbage_is_a_grammar_error() {
        let err = parse_statement("= 17 {{").unwrap_err();
        assert!(matches!(err, SyntaxError::Grammar(_)));
    }

    #[test]
    fn error_snippet_is_truncated() {
        let long = format!("V {{ a = {}; ", "X".repeat(400));
        let err = parse_statement(&long).unwrap_err();
        let msg = err.to_string();
        assert!(msg.len() < 400);
    }
}
