//! Statement slicer for the pattern pass.
//!
//! Reads the input line-by-line and assembles complete STIL statements: a
//! statement is complete when it ends in `;` and contains no braces, or when
//! its `{`/`}` counts balance. `//` comment lines are blank. `Pattern`
//! block openers, the lone closing brace of a pattern block, and the
//! breakpoint brackets `[` / `]` surface as their own items so the caller
//! can gate and rewrite them.
//!
//! The slicer itself holds no parse state beyond the line buffer; the
//! caller polls its own stop flag between items (the two suspension points:
//! reading a line, writing a row).

use crate::SyntaxError;
use std::io::BufRead;

/// One item produced by the slicer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sliced {
    /// A complete statement (possibly multi-line), trimmed.
    Statement(String),
    /// `Pattern <name> {` opened a new pattern block.
    PatternOpen(String),
    /// The lone `}` closing the current pattern block.
    PatternClose,
    /// Breakpoint region open bracket.
    BracketOpen,
    /// Breakpoint region close bracket.
    BracketClose,
}

pub struct StatementSlicer<R: BufRead> {
    reader: R,
    buffer: String,
    /// Bytes consumed from the input, for progress reporting.
    bytes_read: u64,
    /// Until the first `Pattern` line is seen, every other line is skipped
    /// (the header pass already consumed that region).
    in_pattern_region: bool,
}

impl<R: BufRead> StatementSlicer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: String::new(),
            bytes_read: 0,
            in_pattern_region: false,
        }
    }

    /// Start slicing a reader that is already positioned inside the pattern
    /// region (header scanner hand-off, procedure bodies).
    pub fn new_mid_pattern(reader: R) -> Self {
        Self {
            reader,
            buffer: String::new(),
            bytes_read: 0,
            in_pattern_region: true,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn read_line(&mut self, line: &mut String) -> Result<usize, SyntaxError> {
        line.clear();
        let n = self.reader.read_line(line)?;
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Produce the next item, or `None` at end of input. A trailing
    /// incomplete buffer is surfaced as a statement so the grammar can
    /// report it.
    pub fn next_item(&mut self) -> Result<Option<Sliced>, SyntaxError> {
        let mut line = String::new();
        loop {
            let n = self.read_line(&mut line)?;
            if n == 0 {
                if self.buffer.trim().is_empty() {
                    return Ok(None);
                }
                let stmt = std::mem::take(&mut self.buffer);
                return Ok(Some(Sliced::Statement(stmt.trim().to_string())));
            }

            let trimmed = line.trim();

            if !self.in_pattern_region {
                if trimmed.starts_with("Pattern ") && trimmed.contains('{') {
                    self.in_pattern_region = true;
                    return Ok(Some(Sliced::PatternOpen(pattern_name(trimmed))));
                }
                continue;
            }

            if trimmed.starts_with("//") {
                continue;
            }

            if self.buffer.trim().is_empty() {
                match trimmed {
                    "" => continue,
                    "}" => return Ok(Some(Sliced::PatternClose)),
                    "[" => return Ok(Some(Sliced::BracketOpen)),
                    "]" => return Ok(Some(Sliced::BracketClose)),
                    _ if trimmed.starts_with("Pattern ") && trimmed.contains('{') => {
                        return Ok(Some(Sliced::PatternOpen(pattern_name(trimmed))));
                    }
                    _ => {}
                }
            }

            self.buffer.push_str(&line);
            let stmt = self.buffer.trim();
            let opens = stmt.matches('{').count();
            let closes = stmt.matches('}').count();
            let complete = (stmt.ends_with(';') && opens == 0 && closes == 0)
                || (opens > 0 && opens == closes);
            if complete {
                let stmt = stmt.to_string();
                self.buffer.clear();
                return Ok(Some(Sliced::Statement(stmt)));
            }
        }
    }

    /// Consume the remainder of the pattern block that was just opened
    /// (depth 1), without emitting anything. Used to skip patterns that are
    /// not part of the selected burst.
    pub fn skip_current_pattern(&mut self) -> Result<(), SyntaxError> {
        let mut depth: i64 = 1;
        let mut line = String::new();
        loop {
            let n = self.read_line(&mut line)?;
            if n == 0 {
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            depth += trimmed.matches('{').count() as i64;
            depth -= trimmed.matches('}').count() as i64;
            if depth <= 0 {
                return Ok(());
            }
        }
    }
}

fn pattern_name(line: &str) -> String {
    line.trim_start_matches("Pattern")
        .trim()
        .trim_end_matches('{')
        .trim()
        .trim_matches('"')
        .to_string()
}

/// Slice a string buffer (procedure/macro body) into complete statements
/// using the same completeness rules. Brackets surface as items too.
pub fn slice_str(body: &str) -> Result<Vec<Sliced>, SyntaxError> {
    let mut slicer = StatementSlicer {
        reader: std::io::Cursor::new(body.as_bytes()),
        buffer: String::new(),
        bytes_read: 0,
        in_pattern_region: true,
    };
    let mut out = Vec::new();
    while let Some(item) = slicer.next_item()? {
        out.push(item);
    }
    Ok(out)
}
