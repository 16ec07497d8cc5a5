//! Streaming VCT emitter.
//!
//! Subscribes to the transformer's event stream and renders the four VCT
//! file parts: comment banner, timing block, DRVR map, and the `#VECTOR`
//! section. Downstream testers parse rows by column offset, so the layout
//! here is fixed: a 51-character preamble (2 + 14-wide instruction + flag
//! columns), 256 channel characters, and a `; 0xADDR` suffix.
//!
//! The emitter owns the output handle for the duration of one conversion.
//! `EventSink::event` cannot fail, so the first I/O error is latched and
//! surfaced to the converter via [`VctEmitter::take_io_error`].

use crate::charmap::VctCharMap;
use crate::instrmap::MicroInstructionMap;
use ahash::AHashMap;
use core_channelmap::{CHANNEL_COUNT, ChannelMap};
use core_events::{EventSink, ParseEvent, VectorRow};
use core_symbols::SymbolTables;
use std::collections::HashMap;
use std::io::{self, Write};

const FLUSH_EVERY_ROWS: u64 = 10_000;

pub struct VctEmitter<'a, W: Write> {
    out: W,
    tables: &'a SymbolTables,
    channel_map: &'a ChannelMap,
    char_map: &'a VctCharMap,
    instr_map: &'a MicroInstructionMap,
    wft_to_rradr: HashMap<String, usize>,
    /// `(wft, signal, wfc)` -> folded vector character.
    replacement: AHashMap<(String, String, char), char>,
    source_name: String,
    current_wft: String,
    rows_written: u64,
    io_error: Option<io::Error>,
}

impl<'a, W: Write> VctEmitter<'a, W> {
    pub fn new(
        out: W,
        tables: &'a SymbolTables,
        channel_map: &'a ChannelMap,
        char_map: &'a VctCharMap,
        instr_map: &'a MicroInstructionMap,
        wft_to_rradr: HashMap<String, usize>,
        source_name: impl Into<String>,
    ) -> Self {
        let replacement = build_replacement_map(tables);
        Self {
            out,
            tables,
            channel_map,
            char_map,
            instr_map,
            wft_to_rradr,
            replacement,
            source_name: source_name.into(),
            current_wft: String::new(),
            rows_written: 0,
            io_error: None,
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// First latched I/O error, if any.
    pub fn take_io_error(&mut self) -> Option<io::Error> {
        self.io_error.take()
    }

    fn guard(&mut self, result: io::Result<()>) {
        if let Err(e) = result {
            if self.io_error.is_none() {
                tracing::error!(target: "convert.vct", error = %e, "write failed");
                self.io_error = Some(e);
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // File sections
    // ---------------------------------------------------------------------------------------------

    /// Six-line comment banner plus one line per recognised header key.
    pub fn write_banner(&mut self) -> io::Result<()> {
        let stamp = chrono::Local::now().format("%a %b %d %H:%M:%S %Y");
        writeln!(self.out, ";")?;
        writeln!(
            self.out,
            ";  HTOL vector file created by the patconv translator"
        )?;
        writeln!(self.out, ";  from the source file {}", self.source_name)?;
        writeln!(self.out, ";  translated {stamp}")?;
        writeln!(self.out, ";")?;
        writeln!(self.out)?;
        for (key, value) in &self.tables.headers {
            writeln!(self.out, ";  {key}: {value}")?;
        }
        Ok(())
    }

    /// Raw waveform dump plus the formatted CLOCK/STROBE block.
    pub fn write_timing_section(&mut self, formatted: &str) -> io::Result<()> {
        if self.tables.timings.is_empty() {
            return Ok(());
        }
        writeln!(self.out, ";")?;
        writeln!(self.out, ";    Timing definitions:")?;
        writeln!(self.out, ";")?;
        for table in &self.tables.timings {
            writeln!(
                self.out,
                ";  Timing [{}] ({} entries)",
                table.name,
                table.records.len()
            )?;
            for td in &table.records {
                if td.vector_replacement.is_empty() {
                    continue;
                }
                let mut line = format!(
                    ";    {}, {}, {}={}",
                    td.signal, td.period, td.wfc, td.vector_replacement
                );
                for edge in &td.edges {
                    if edge.time.is_empty() || edge.events.is_empty() {
                        continue;
                    }
                    line.push_str(&format!(", {}, {}", edge.time, edge.events));
                }
                writeln!(self.out, "{line}")?;
            }
        }
        writeln!(self.out, ";")?;

        if !formatted.is_empty() {
            writeln!(
                self.out,
                ";    Converted timing maybe not correct, Please check the timing definitions:"
            )?;
            writeln!(
                self.out,
                ";    DUD/UDU -> P/N; UD/DU -> 01 DNRZ; D -> 0; U -> 1; P -> Q; Other -> Other"
            )?;
            writeln!(self.out, ";")?;
            for line in formatted.lines() {
                writeln!(self.out, ";  {line}")?;
            }
        }
        writeln!(self.out)?;
        Ok(())
    }

    /// `DRVR` channel-to-signal assignments; unassigned channels are
    /// omitted, the `CS` line closes the section.
    pub fn write_drvr_section(&mut self) -> io::Result<()> {
        let channel_to_signal = self.channel_map.channel_to_signal();
        writeln!(self.out, ";")?;
        writeln!(
            self.out,
            ";       driver/receiver pin to DUT signal assignments:"
        )?;
        writeln!(self.out, ";")?;
        for channel in 0..CHANNEL_COUNT as u16 {
            if let Some(signal) = channel_to_signal.get(&channel) {
                writeln!(self.out, ";   DRVR{:>4}: {signal}", channel)?;
            }
        }
        writeln!(self.out, ";   DRVR  CS: '. .'")?;
        writeln!(self.out, ";")?;
        writeln!(self.out)?;
        Ok(())
    }

    /// `#VECTOR`, the vertical signal-name banner, and the channel rulers.
    pub fn begin_vector_section(&mut self) -> io::Result<()> {
        writeln!(self.out, "#VECTOR")?;
        for line in self.signal_header_lines() {
            writeln!(self.out, "{line}")?;
        }
        for line in title_lines() {
            writeln!(self.out, "{line}")?;
        }
        Ok(())
    }

    /// Close the section. `complete` is false when the run was stopped or
    /// failed; the trailer is withheld so the truncation is detectable.
    pub fn finish(&mut self, complete: bool) -> io::Result<()> {
        if complete {
            writeln!(self.out, "#VECTOREND")?;
        }
        self.out.flush()
    }

    fn signal_header_lines(&self) -> Vec<String> {
        let channel_to_signal = self.channel_map.channel_to_signal();
        let max_len = channel_to_signal
            .values()
            .map(|s| s.len())
            .max()
            .unwrap_or(0);
        let mut lines = Vec::with_capacity(max_len);
        for row in 0..max_len {
            let mut line = String::with_capacity(51 + CHANNEL_COUNT);
            line.push(';');
            line.push_str(&" ".repeat(50));
            for channel in 0..CHANNEL_COUNT as u16 {
                let c = channel_to_signal
                    .get(&channel)
                    .and_then(|s| s.as_bytes().get(row))
                    .map(|b| *b as char)
                    .unwrap_or(' ');
                line.push(c);
            }
            lines.push(line);
        }
        lines
    }

    // ---------------------------------------------------------------------------------------------
    // Row rendering
    // ---------------------------------------------------------------------------------------------

    fn rradr(&self) -> usize {
        self.wft_to_rradr
            .get(&self.current_wft)
            .copied()
            .unwrap_or(0)
    }

    fn channel_string(&self, row: &VectorRow) -> String {
        let mut channels = vec!['.'; CHANNEL_COUNT];
        for entry in &row.entries {
            let Some(signals) = self.tables.signals_for_key(&entry.key) else {
                continue;
            };
            let wfc_chars: Vec<char> = entry.wfc.chars().collect();
            for (idx, signal) in signals.iter().enumerate() {
                let Some(&wfc) = wfc_chars.get(idx) else {
                    continue;
                };
                let key = (self.current_wft.clone(), signal.clone(), wfc);
                let mapped = self.replacement.get(&key).copied().unwrap_or(wfc);
                let mapped = self.char_map.map_char(mapped);
                if let Some(chs) = self.channel_map.channels_of(signal) {
                    for &ch in chs {
                        if let Some(slot) = channels.get_mut(ch as usize) {
                            *slot = mapped;
                        }
                    }
                }
            }
        }
        channels.into_iter().collect()
    }

    fn compose_line(&self, instr_field: &str, rradr: usize, channels: &str, address: u64) -> String {
        format!(
            "  {instr_field}% .. ..0 {} ... {rradr} 1  {channels} ; 0x{address:06X}",
            ".".repeat(16)
        )
    }

    fn write_vector_row(&mut self, row: &VectorRow, instr: &str, param: &str) -> io::Result<()> {
        let rradr = self.rradr();
        let channels = self.channel_string(row);
        let instr_field = self.instr_map.format(instr, param);
        let mut label = row.label().to_string();
        if label.is_empty() && instr.contains("LI") {
            label = format!("0x{:06X}", row.address());
        }
        let line = self.compose_line(&instr_field, rradr, &channels, row.address());

        if instr.contains("LI") || instr.contains("MBGN") {
            writeln!(self.out, "{line}")?;
            if !label.is_empty() {
                writeln!(self.out, "{label}:")?;
            }
        } else {
            if !label.is_empty() {
                writeln!(self.out, "{label}:")?;
            }
            writeln!(self.out, "{line}")?;
        }

        self.rows_written += 1;
        if self.rows_written % FLUSH_EVERY_ROWS == 0 {
            self.out.flush()?;
        }
        Ok(())
    }

    fn write_micro_row(
        &mut self,
        label: &str,
        instr: &str,
        param: &str,
        address: u64,
    ) -> io::Result<()> {
        let rradr = self.rradr();
        let channels = ".".repeat(CHANNEL_COUNT);
        let instr_field = self.instr_map.format(instr, param);
        let line = self.compose_line(&instr_field, rradr, &channels, address);

        if instr.contains("LI") || instr.contains("MBGN") {
            writeln!(self.out, "{line}")?;
            if !label.is_empty() {
                writeln!(self.out, "{label}:")?;
            }
        } else {
            if !label.is_empty() {
                writeln!(self.out, "{label}:")?;
            }
            writeln!(self.out, "{line}")?;
        }
        self.rows_written += 1;
        self.out.flush()
    }

    fn write_start_preamble(&mut self, burst: &str) -> io::Result<()> {
        let channels = ".".repeat(CHANNEL_COUNT);
        let entries: [(&str, &str, &str); 8] = [
            ("Start:", "MSSA", ""),
            ("CS_Loop:", "CALL", burst),
            ("", "JNME", "CS_Loop"),
            ("", "JF1", "Start"),
            ("", "ADV", ""),
            ("", "ADV", ""),
            ("", "HALT", ""),
            ("", "ADV", ""),
        ];
        for (label, instr, param) in entries {
            if !label.is_empty() {
                writeln!(self.out, "{label}")?;
            }
            let instr_field = self.instr_map.format(instr, param);
            writeln!(
                self.out,
                "  {instr_field}% .. ..0 {} ... 0 1  {channels}",
                ".".repeat(16)
            )?;
        }
        writeln!(self.out)?;
        Ok(())
    }
}

impl<W: Write> EventSink for VctEmitter<'_, W> {
    fn event(&mut self, event: ParseEvent) {
        match event {
            ParseEvent::VectorStart { burst } => {
                let r = self.write_start_preamble(&burst);
                self.guard(r);
            }
            ParseEvent::WaveformChange { wft } => {
                self.current_wft = wft;
            }
            ParseEvent::Annotation { text } => {
                let r = writeln!(self.out, ";{text}");
                self.guard(r);
            }
            ParseEvent::Label { name } => {
                let r = writeln!(self.out, "{name}:");
                self.guard(r);
            }
            ParseEvent::Vector { row, instr, param } => {
                let r = self.write_vector_row(&row, &instr, &param);
                self.guard(r);
            }
            ParseEvent::MicroInstruction {
                label,
                instr,
                param,
                address,
            } => {
                let r = self.write_micro_row(&label, &instr, &param, address);
                self.guard(r);
            }
            ParseEvent::ParseComplete { .. } => {
                let r = self.out.flush();
                self.guard(r);
            }
            // Headers land in the banner; diagnostics belong to the caller.
            ParseEvent::ParseStart
            | ParseEvent::Header { .. }
            | ParseEvent::ProcedureCall { .. }
            | ParseEvent::Log { .. }
            | ParseEvent::ParseError { .. } => {}
        }
    }
}

/// Channel rulers: hundreds/tens/ones digits of each channel index.
fn title_lines() -> [String; 4] {
    let mut hundreds = String::with_capacity(CHANNEL_COUNT);
    let mut tens = String::with_capacity(CHANNEL_COUNT);
    let mut ones = String::with_capacity(CHANNEL_COUNT);
    for i in 0..CHANNEL_COUNT {
        hundreds.push(if i >= 100 {
            char::from_digit((i / 100) as u32, 10).unwrap_or(' ')
        } else {
            ' '
        });
        tens.push(if i >= 10 {
            char::from_digit(((i / 10) % 10) as u32, 10).unwrap_or(' ')
        } else {
            ' '
        });
        ones.push(char::from_digit((i % 10) as u32, 10).unwrap_or(' '));
    }
    [
        ";                 MM GTT  C                S  T".to_string(),
        format!(";                 RC TEM  S                Y  0    {hundreds}"),
        format!(";                 SM SNE  A  RESERVED      N  E C  {tens}"),
        format!(";                 TP TAM  L                C  N S  {ones}"),
    ]
}

/// Fold the analysed timing records into the `(wft, signal, wfc)` lookup
/// used per vector row. Group references fan out to their member signals;
/// records without a replacement keep the raw character.
fn build_replacement_map(tables: &SymbolTables) -> AHashMap<(String, String, char), char> {
    let mut map = AHashMap::new();
    for table in &tables.timings {
        for td in &table.records {
            let Some(wfc) = td.wfc.chars().next() else {
                continue;
            };
            let replacement = td.vector_replacement.chars().next().unwrap_or(wfc);
            let signals = tables
                .signals_for_key(&td.signal)
                .unwrap_or_else(|| vec![td.signal.clone()]);
            for signal in signals {
                map.insert((table.name.clone(), signal, wfc), replacement);
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_ruler_columns_align() {
        let [l1, l2, l3, l4] = title_lines();
        assert_eq!(l2.len(), 51 + CHANNEL_COUNT);
        assert_eq!(l3.len(), 51 + CHANNEL_COUNT);
        assert_eq!(l4.len(), 51 + CHANNEL_COUNT);
        assert!(l1.len() < 51 + CHANNEL_COUNT);
        // Channel 42 reads "4" on the tens ruler and "2" on the ones ruler.
        assert_eq!(l3.as_bytes()[51 + 42], b'4');
        assert_eq!(l4.as_bytes()[51 + 42], b'2');
        // Channel 123 reads 1/2/3 top to bottom.
        assert_eq!(l2.as_bytes()[51 + 123], b'1');
        assert_eq!(l3.as_bytes()[51 + 123], b'2');
        assert_eq!(l4.as_bytes()[51 + 123], b'3');
    }
}
