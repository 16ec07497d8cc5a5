//! Header-region grammar: block splitting and per-block parsers.
//!
//! The header scanner accumulates everything before the first `Pattern`
//! block into one buffer; [`split_blocks`] cuts that buffer into top-level
//! blocks (`Signals { ... }`, `Timing name { ... }`, ...) while recording
//! the byte span of each body. Procedure and macro bodies are never parsed
//! here; their spans let the symbol layer keep the raw text verbatim for
//! re-parsing at expansion time.

use crate::SyntaxError;
use crate::statement::{balanced_block, identifier, name, quoted, token};
use nom::{
    IResult,
    branch::alt,
    character::complete::{char as ch, multispace0, multispace1},
    combinator::opt,
    sequence::preceded,
};

/// One top-level block (or bare statement) of the header region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// Leading keyword (`Signals`, `Timing`, `PatternBurst`, ... or the
    /// name of a procedure when splitting a `Procedures` body).
    pub keyword: String,
    /// Optional second token before the brace (domain or block name).
    pub name: Option<String>,
    /// Body between the braces; empty for `...;` statements.
    pub body: String,
    /// Byte span of `body` within the input buffer.
    pub body_span: (usize, usize),
}

/// Split a buffer into top-level blocks and bare statements.
pub fn split_blocks(text: &str) -> Result<Vec<RawBlock>, SyntaxError> {
    let bytes = text.as_bytes();
    let mut blocks = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        // Skip whitespace and // comments.
        if bytes[pos].is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if bytes[pos] == b'/' && bytes.get(pos + 1) == Some(&b'/') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }

        // Head: tokens until `{` or `;`.
        let head_start = pos;
        while pos < bytes.len() && bytes[pos] != b'{' && bytes[pos] != b';' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(SyntaxError::Unbalanced {
                context: "header".into(),
                offset: head_start,
            });
        }
        let head = text[head_start..pos].trim();
        let mut head_tokens = head.split_whitespace();
        let keyword = head_tokens.next().unwrap_or("").trim_matches('"').to_string();
        let block_name = head_tokens.next().map(|t| t.trim_matches('"').to_string());

        if bytes[pos] == b';' {
            pos += 1;
            blocks.push(RawBlock {
                keyword,
                name: block_name,
                body: String::new(),
                body_span: (head_start, head_start),
            });
            continue;
        }

        // Braced body: find the matching close.
        let open = pos;
        let mut depth = 0i64;
        let mut close = None;
        while pos < bytes.len() {
            match bytes[pos] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(pos);
                        break;
                    }
                }
                _ => {}
            }
            pos += 1;
        }
        let close = close.ok_or(SyntaxError::Unbalanced {
            context: format!("block '{keyword}'"),
            offset: open,
        })?;
        let body_span = (open + 1, close);
        blocks.push(RawBlock {
            keyword,
            name: block_name,
            body: text[body_span.0..body_span.1].to_string(),
            body_span,
        });
        pos = close + 1;
    }

    Ok(blocks)
}

// -------------------------------------------------------------------------------------------------
// Shared lexemes
// -------------------------------------------------------------------------------------------------

/// `'...'` timing literal, quotes stripped.
fn sq_lit(input: &str) -> IResult<&str, &str> {
    let (rest, _) = ch('\'')(input)?;
    let (rest, lit) = nom::bytes::complete::take_while(|c| c != '\'')(rest)?;
    let (rest, _) = ch('\'')(rest)?;
    Ok((rest, lit))
}

/// Skip one statement we do not model: everything to `;`, or a balanced
/// block with an optional trailing `;`.
fn skip_stmt(input: &str) -> IResult<&str, ()> {
    let mut rest = input;
    loop {
        let (r, _) =
            nom::bytes::complete::take_while::<_, _, nom::error::Error<&str>>(|c| {
                c != ';' && c != '{'
            })(rest)?;
        if let Some(stripped) = r.strip_prefix(';') {
            return Ok((stripped, ()));
        }
        if r.starts_with('{') {
            let (r2, _) = balanced_block(r)?;
            let (r2, _) = opt(preceded(multispace0, ch(';')))(r2)?;
            return Ok((r2, ()));
        }
        if r.is_empty() {
            return Ok((r, ()));
        }
        rest = r;
    }
}

// -------------------------------------------------------------------------------------------------
// Signals
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDecl {
    pub name: String,
    pub direction: String,
}

/// `Signals` body: `name In;`, `name Out { ... };`, ...
pub fn parse_signals(body: &str) -> Result<Vec<SignalDecl>, SyntaxError> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let (r, _) = multispace0::<_, nom::error::Error<&str>>(rest)
            .map_err(|_| grammar("Signals", body))?;
        if r.is_empty() {
            return Ok(out);
        }
        let parsed: IResult<&str, SignalDecl> = (|input| {
            let (rest, sig) = name(input)?;
            let (rest, _) = multispace1(rest)?;
            let (rest, dir) = identifier(rest)?;
            let (rest, _) = multispace0(rest)?;
            let (rest, _) = if rest.starts_with('{') {
                let (r, _) = balanced_block(rest)?;
                opt(preceded(multispace0, ch(';')))(r)?
            } else {
                let (r, _) = ch(';')(rest)?;
                (r, None)
            };
            Ok((
                rest,
                SignalDecl {
                    name: sig.to_string(),
                    direction: dir.to_string(),
                },
            ))
        })(r);
        match parsed {
            Ok((r, decl)) => {
                out.push(decl);
                rest = r;
            }
            Err(_) => return Err(grammar("Signals", body)),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// SignalGroups
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDecl {
    pub name: String,
    pub signals: Vec<String>,
}

/// A sigref expression: `'a + b + c'`, `'bus'`, or a bare name.
fn sigref_expr(input: &str) -> IResult<&str, Vec<String>> {
    let (rest, quoted_body) = opt(sq_lit)(input)?;
    match quoted_body {
        Some(body) => {
            let names = body
                .split('+')
                .map(|s| s.trim().trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            Ok((rest, names))
        }
        None => {
            let (rest, first) = name(input)?;
            Ok((rest, vec![first.to_string()]))
        }
    }
}

/// `SignalGroups` body: `groupname = 'a + b';` entries.
pub fn parse_signal_groups(body: &str) -> Result<Vec<GroupDecl>, SyntaxError> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let (r, _) =
            multispace0::<_, nom::error::Error<&str>>(rest).map_err(|_| grammar("SignalGroups", body))?;
        if r.is_empty() {
            return Ok(out);
        }
        let parsed: IResult<&str, GroupDecl> = (|input| {
            let (rest, group) = name(input)?;
            let (rest, _) = preceded(multispace0, ch('='))(rest)?;
            let (rest, _) = multispace0(rest)?;
            let (rest, signals) = sigref_expr(rest)?;
            let (rest, _) = multispace0(rest)?;
            // Optional attribute block (WFCMap and friends) before `;`.
            let (rest, _) = if rest.starts_with('{') {
                let (r, _) = balanced_block(rest)?;
                opt(preceded(multispace0, ch(';')))(r)?
            } else {
                let (r, _) = ch(';')(rest)?;
                (r, None)
            };
            Ok((
                rest,
                GroupDecl {
                    name: group.to_string(),
                    signals,
                },
            ))
        })(r);
        match parsed {
            Ok((r, decl)) => {
                out.push(decl);
                rest = r;
            }
            Err(_) => return Err(grammar("SignalGroups", body)),
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Timing
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingEntry {
    pub signal: String,
    pub wfc: String,
    /// `(time, events)` pairs in declaration order; `events` concatenates
    /// the letters of a `D/U`-style event list.
    pub edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformTableDecl {
    pub name: String,
    pub period: String,
    pub entries: Vec<TimingEntry>,
}

/// `'0ns' D;` or `'10ns' D/U;`
fn event_stmt(input: &str) -> IResult<&str, (String, String)> {
    let (rest, _) = multispace0(input)?;
    let (rest, time) = sq_lit(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, raw_events) = token(rest)?;
    let (rest, _) = preceded(multispace0, ch(';'))(rest)?;
    let events: String = raw_events.chars().filter(|c| *c != '/').collect();
    Ok((rest, (time.trim().to_string(), events)))
}

/// `01 { '0ns' D/U; '5ns' U/D; }`
fn wfc_events_block(input: &str) -> IResult<&str, (String, Vec<(String, String)>)> {
    let (rest, _) = multispace0(input)?;
    let (rest, wfc) = nom::bytes::complete::take_while1(|c: char| c.is_ascii_alphanumeric())(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = ch('{')(rest)?;
    let (rest, edges) = nom::multi::many0(event_stmt)(rest)?;
    let (rest, _) = preceded(multispace0, ch('}'))(rest)?;
    Ok((rest, (wfc.to_string(), edges)))
}

/// `sigref { <wfc blocks> }`
fn signal_waveforms(input: &str) -> IResult<&str, Vec<TimingEntry>> {
    let (rest, _) = multispace0(input)?;
    let (rest, sig) = alt((quoted, sq_lit, identifier))(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = ch('{')(rest)?;
    let (rest, blocks) = nom::multi::many1(wfc_events_block)(rest)?;
    let (rest, _) = preceded(multispace0, ch('}'))(rest)?;
    let entries = blocks
        .into_iter()
        .map(|(wfc, edges)| TimingEntry {
            signal: sig.trim().to_string(),
            wfc,
            edges,
        })
        .collect();
    Ok((rest, entries))
}

/// Parse one `Timing` block body into its waveform tables.
pub fn parse_timing(body: &str) -> Result<Vec<WaveformTableDecl>, SyntaxError> {
    let mut tables = Vec::new();
    for block in split_blocks(body)? {
        if block.keyword != "WaveformTable" {
            continue;
        }
        let mut table = WaveformTableDecl {
            name: block.name.clone().unwrap_or_default(),
            period: String::new(),
            entries: Vec::new(),
        };
        for inner in split_blocks(&block.body)? {
            match inner.keyword.as_str() {
                "Period" => {
                    table.period = inner
                        .name
                        .unwrap_or_default()
                        .trim_matches('\'')
                        .to_string();
                }
                "Waveforms" => {
                    let mut rest = inner.body.as_str();
                    loop {
                        let (r, _) = multispace0::<_, nom::error::Error<&str>>(rest)
                            .map_err(|_| grammar("Waveforms", body))?;
                        if r.is_empty() {
                            break;
                        }
                        match signal_waveforms(r) {
                            Ok((r2, mut entries)) => {
                                table.entries.append(&mut entries);
                                rest = r2;
                            }
                            Err(_) => return Err(grammar("Waveforms", r)),
                        }
                    }
                }
                _ => {}
            }
        }
        tables.push(table);
    }
    Ok(tables)
}

// -------------------------------------------------------------------------------------------------
// PatternBurst / PatternExec / Header
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternBurstDecl {
    pub name: String,
    pub signal_groups: Option<String>,
    pub patterns: Vec<String>,
}

pub fn parse_pattern_burst(name_tok: &str, body: &str) -> Result<PatternBurstDecl, SyntaxError> {
    let mut decl = PatternBurstDecl {
        name: name_tok.to_string(),
        ..PatternBurstDecl::default()
    };
    for block in split_blocks(body)? {
        match block.keyword.as_str() {
            "SignalGroups" => decl.signal_groups = block.name,
            "PatList" => {
                let mut rest = block.body.as_str();
                loop {
                    let (r, _) = multispace0::<_, nom::error::Error<&str>>(rest)
                        .map_err(|_| grammar("PatList", body))?;
                    if r.is_empty() {
                        break;
                    }
                    let parsed: IResult<&str, &str> = (|input| {
                        let (rest, pat) = name(input)?;
                        let (rest, _) = multispace0(rest)?;
                        let (rest, _) = if rest.starts_with('{') {
                            let (r, _) = balanced_block(rest)?;
                            opt(preceded(multispace0, ch(';')))(r)?
                        } else {
                            let (r, _) = ch(';')(rest)?;
                            (r, None)
                        };
                        Ok((rest, pat))
                    })(r);
                    match parsed {
                        Ok((r2, pat)) => {
                            decl.patterns.push(pat.to_string());
                            rest = r2;
                        }
                        Err(_) => return Err(grammar("PatList", r)),
                    }
                }
            }
            _ => {}
        }
    }
    Ok(decl)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatternExecDecl {
    pub timing: Option<String>,
    pub burst: Option<String>,
}

pub fn parse_pattern_exec(body: &str) -> Result<PatternExecDecl, SyntaxError> {
    let mut decl = PatternExecDecl::default();
    for block in split_blocks(body)? {
        match block.keyword.as_str() {
            "Timing" => decl.timing = block.name,
            "PatternBurst" => decl.burst = block.name,
            _ => {}
        }
    }
    Ok(decl)
}

/// `Header` body: `Title "...";` key/values plus an optional `History`
/// block whose annotations collapse into one value.
pub fn parse_header_block(body: &str) -> Result<Vec<(String, String)>, SyntaxError> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let (r, _) =
            multispace0::<_, nom::error::Error<&str>>(rest).map_err(|_| grammar("Header", body))?;
        if r.is_empty() {
            return Ok(out);
        }
        let parsed: IResult<&str, (String, String)> = (|input| {
            let (rest, key) = identifier(input)?;
            let (rest, _) = multispace0(rest)?;
            if key == "History" {
                let (rest, inner) = balanced_block(rest)?;
                let value = inner
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                return Ok((rest, (key.to_string(), value)));
            }
            let (rest, value) = alt((quoted, token))(rest)?;
            let (rest, _) = opt(preceded(multispace0, ch(';')))(rest)?;
            Ok((rest, (key.to_string(), value.to_string())))
        })(r);
        match parsed {
            Ok((r2, kv)) => {
                out.push(kv);
                rest = r2;
            }
            Err(_) => {
                let (r2, ()) = skip_stmt(r).map_err(|_| grammar("Header", r))?;
                rest = r2;
            }
        }
    }
}

/// Split a `Procedures` / `MacroDefs` body into `(name, raw body)` pairs.
pub fn parse_named_bodies(body: &str) -> Result<Vec<(String, String)>, SyntaxError> {
    Ok(split_blocks(body)?
        .into_iter()
        .filter(|b| !b.body.is_empty() || b.name.is_some())
        .map(|b| (b.keyword, b.body.trim().to_string()))
        .collect())
}

fn grammar(context: &str, near: &str) -> SyntaxError {
    SyntaxError::Grammar(format!(
        "cannot parse {context} block near '{}'",
        crate::statement::truncate(near.trim(), 80)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_top_level_blocks_and_statements() {
        let text = "STIL 1.0;\nSignals { a In; }\nTiming t1 { }\n";
        let blocks = split_blocks(text).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].keyword, "STIL");
        assert_eq!(blocks[0].name.as_deref(), Some("1.0"));
        assert_eq!(blocks[1].keyword, "Signals");
        assert_eq!(blocks[1].body.trim(), "a In;");
        assert_eq!(blocks[2].name.as_deref(), Some("t1"));
    }

    #[test]
    fn body_span_slices_the_original_buffer() {
        let text = "Procedures { shift { V { d = 0; } } }";
        let blocks = split_blocks(text).unwrap();
        let (start, end) = blocks[0].body_span;
        assert_eq!(&text[start..end], blocks[0].body);
    }

    #[test]
    fn signals_parse_names_and_directions() {
        let decls = parse_signals("clk In;\n\"data out\" Out;\nio InOut;\nvdd Supply;").unwrap();
        assert_eq!(decls.len(), 4);
        assert_eq!(decls[0].name, "clk");
        assert_eq!(decls[1].name, "data out");
        assert_eq!(decls[2].direction, "InOut");
    }

    #[test]
    fn signal_with_attribute_block() {
        let decls = parse_signals("so Out { Termination TerminateHigh; }").unwrap();
        assert_eq!(decls[0].direction, "Out");
    }

    #[test]
    fn signal_groups_expand_plus_expressions() {
        let groups =
            parse_signal_groups("all = 'clk + data + io';\nsolo = 'clk';").unwrap();
        assert_eq!(groups[0].signals, vec!["clk", "data", "io"]);
        assert_eq!(groups[1].signals, vec!["clk"]);
    }

    #[test]
    fn timing_block_full_parse() {
        let body = r"
            WaveformTable wt1 {
                Period '100ns';
                Waveforms {
                    clk { 01 { '0ns' D/U; '5ns' U/D; } }
                    io  { LH { '10ns' D; '20ns' U; } }
                }
            }";
        let tables = parse_timing(body).unwrap();
        assert_eq!(tables.len(), 1);
        let wt = &tables[0];
        assert_eq!(wt.name, "wt1");
        assert_eq!(wt.period, "100ns");
        assert_eq!(wt.entries.len(), 2);
        assert_eq!(wt.entries[0].wfc, "01");
        assert_eq!(
            wt.entries[0].edges,
            vec![
                ("0ns".to_string(), "DU".to_string()),
                ("5ns".to_string(), "UD".to_string())
            ]
        );
        assert_eq!(wt.entries[1].signal, "io");
    }

    #[test]
    fn pattern_burst_collects_patlist() {
        let decl = parse_pattern_burst(
            "burst1",
            "SignalGroups grp;\nPatList { p1; p2; p3 { Start lbl; } }",
        )
        .unwrap();
        assert_eq!(decl.signal_groups.as_deref(), Some("grp"));
        assert_eq!(decl.patterns, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn pattern_exec_last_wins_is_callers_concern() {
        let decl = parse_pattern_exec("Timing t1;\nPatternBurst burst1;").unwrap();
        assert_eq!(decl.timing.as_deref(), Some("t1"));
        assert_eq!(decl.burst.as_deref(), Some("burst1"));
    }

    #[test]
    fn header_block_key_values() {
        let kvs = parse_header_block(
            "Title \"demo pattern\";\nDate \"Mon Jan 1\";\nHistory { Ann {* rev A *} }",
        )
        .unwrap();
        assert_eq!(kvs[0], ("Title".to_string(), "demo pattern".to_string()));
        assert_eq!(kvs[2].0, "History");
        assert!(kvs[2].1.contains("rev A"));
    }

    #[test]
    fn named_bodies_keep_raw_text() {
        let bodies =
            parse_named_bodies("shift {\n V { d = 0; }\n}\nload { W wt2; V { d = 1; } }").unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].0, "shift");
        assert_eq!(bodies[0].1, "V { d = 0; }");
        assert!(bodies[1].1.starts_with("W wt2;"));
    }

    #[test]
    fn unbalanced_block_is_reported() {
        assert!(matches!(
            split_blocks("Signals { a In;"),
            Err(SyntaxError::Unbalanced { .. })
        ));
    }
}
