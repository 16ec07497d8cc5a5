//! STIL-name to VCT-mnemonic mapping.
//!
//! Unknown names pass through unchanged (the transformer already emits
//! final mnemonics like `LI0`, `JNI0`, `MBGN`, `MEND`, `IMATCH`,
//! `BreakPoint`); an absent instruction renders as the default advance.

use std::collections::HashMap;

pub const INSTRUCTION_FIELD_WIDTH: usize = 14;

#[derive(Debug, Clone)]
pub struct MicroInstructionMap {
    mapping: HashMap<String, String>,
    default_instruction: String,
}

impl Default for MicroInstructionMap {
    fn default() -> Self {
        let mut mapping = HashMap::new();
        for (stil, vct) in [
            ("Stop", "HALT"),
            ("Goto", "JUMP"),
            ("Call", "CALL"),
            ("Return", "RET"),
            ("IddqTestPoint", "IDDQ"),
            ("IDDQTestPoint", "IDDQ"),
            ("Loop", "LI"),
            ("MatchLoop", "MBGN"),
            ("Repeat", "RPT"),
            ("LoopEnd", "JNI"),
        ] {
            mapping.insert(stil.to_string(), vct.to_string());
        }
        Self {
            mapping,
            default_instruction: "ADV".to_string(),
        }
    }
}

impl MicroInstructionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_instruction(&mut self, instr: impl Into<String>) {
        self.default_instruction = instr.into();
    }

    /// Add or replace mappings (external tables in a later iteration).
    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, String)>) {
        self.mapping.extend(entries);
    }

    /// Map a STIL instruction. Empty (or the bare `V` keyword) becomes the
    /// default advance; unmapped names are kept as-is.
    pub fn map<'a>(&'a self, stil_instr: &'a str, param: &'a str) -> (&'a str, &'a str) {
        let trimmed = stil_instr.trim();
        if trimmed.is_empty() || trimmed == "V" {
            return (&self.default_instruction, "");
        }
        match self.mapping.get(trimmed) {
            Some(vct) => (vct, param),
            None => (trimmed, param),
        }
    }

    /// Render the fixed-width instruction field of a vector row.
    pub fn format(&self, stil_instr: &str, param: &str) -> String {
        let (instr, param) = self.map(stil_instr, param);
        let text = if param.is_empty() {
            instr.to_string()
        } else {
            format!("{instr} {param}")
        };
        format!("{text:<INSTRUCTION_FIELD_WIDTH$}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_the_standard_set() {
        let m = MicroInstructionMap::new();
        assert_eq!(m.map("Stop", ""), ("HALT", ""));
        assert_eq!(m.map("Goto", "lbl"), ("JUMP", "lbl"));
        assert_eq!(m.map("Call", "sub"), ("CALL", "sub"));
        assert_eq!(m.map("IddqTestPoint", ""), ("IDDQ", ""));
    }

    #[test]
    fn empty_and_v_become_the_default_advance() {
        let m = MicroInstructionMap::new();
        assert_eq!(m.map("", ""), ("ADV", ""));
        assert_eq!(m.map("V", "x"), ("ADV", ""));
    }

    #[test]
    fn unknown_names_pass_through() {
        let m = MicroInstructionMap::new();
        assert_eq!(m.map("LI0", "9"), ("LI0", "9"));
        assert_eq!(m.map("IMATCH", "6"), ("IMATCH", "6"));
        assert_eq!(m.map("FlushPipe", ""), ("FlushPipe", ""));
    }

    #[test]
    fn extension_entries_and_default_override() {
        let mut m = MicroInstructionMap::new();
        m.extend([("Shift".to_string(), "SHFT".to_string())]);
        assert_eq!(m.map("Shift", "8"), ("SHFT", "8"));
        m.set_default_instruction("NOP");
        assert_eq!(m.map("", ""), ("NOP", ""));
    }

    #[test]
    fn format_is_fixed_width() {
        let m = MicroInstructionMap::new();
        assert_eq!(m.format("Stop", ""), "HALT          ");
        assert_eq!(m.format("", ""), "ADV           ");
        let f = m.format("RPT", "50");
        assert_eq!(f, "RPT 50        ");
        assert_eq!(f.len(), INSTRUCTION_FIELD_WIDTH);
    }
}
