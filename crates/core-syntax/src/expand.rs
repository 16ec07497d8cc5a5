//! Compressed vector-data expansion.
//!
//! STIL vector data may compress runs with `\rN tok`, meaning `tok` repeated
//! `N` times. Expansion is a single left-to-right scan into a growable
//! buffer; interior whitespace is dropped so the result is the bare WFC
//! string.

/// Expand every `\rN tok` run and strip whitespace.
///
/// `\r3 X` -> `XXX`; `XLLL \r2 X HHH` -> `XLLLXXHHH`. Multiple repeats in
/// one string expand in left-to-right order. A repeat with a missing token
/// contributes nothing.
pub fn expand_vec_data(data: &str) -> String {
    let mut out = String::with_capacity(data.len());
    let mut chars = data.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_whitespace() {
            continue;
        }
        if ch == '\\' && chars.peek() == Some(&'r') {
            chars.next(); // consume 'r'
            let mut count: usize = 0;
            let mut saw_digit = false;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                count = count * 10 + d as usize;
                saw_digit = true;
                chars.next();
            }
            if !saw_digit {
                // Not a repeat marker after all; keep the literal characters.
                out.push('\\');
                out.push('r');
                continue;
            }
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '\\' || c == ';' {
                    break;
                }
                token.push(c);
                chars.next();
            }
            for _ in 0..count {
                out.push_str(&token);
            }
        } else {
            out.push(ch);
        }
    }
    out
}
