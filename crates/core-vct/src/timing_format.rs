//! Timing-table to CLOCK/STROBE/FORMAT text conversion.
//!
//! Each waveform table claims one of the eight RRADR slots (0-7) in
//! enumeration order; overflow is a hard error, not a truncation. Edge
//! values are the two middle edges of a definition in integer nanoseconds;
//! channel lists compress consecutive runs (`3,4,5,6,7` -> `3-7`).

use core_channelmap::ChannelMap;
use core_symbols::{SymbolTables, WftTable};
use core_timing::{StrobeClass, TimeUnitConverter, TimingData, TimingError};
use std::collections::{HashMap, HashSet};

pub const RRADR_SLOTS: usize = 8;

pub struct TimingFormatter<'a> {
    tables: &'a SymbolTables,
    channel_map: &'a ChannelMap,
    converter: TimeUnitConverter,
    wft_to_rradr: HashMap<String, usize>,
}

impl<'a> TimingFormatter<'a> {
    pub fn new(tables: &'a SymbolTables, channel_map: &'a ChannelMap) -> Self {
        Self {
            tables,
            channel_map,
            converter: TimeUnitConverter::default(),
            wft_to_rradr: HashMap::new(),
        }
    }

    /// RRADR slot for a waveform table, allocated first-come first-served.
    pub fn rradr_of(&mut self, wft: &str) -> Result<usize, TimingError> {
        if let Some(slot) = self.wft_to_rradr.get(wft) {
            return Ok(*slot);
        }
        let slot = self.wft_to_rradr.len();
        if slot >= RRADR_SLOTS {
            return Err(TimingError::RradrOverflow(RRADR_SLOTS));
        }
        self.wft_to_rradr.insert(wft.to_string(), slot);
        Ok(slot)
    }

    /// The allocation built up so far (handed to the vector emitter).
    pub fn wft_mapping(&self) -> HashMap<String, usize> {
        self.wft_to_rradr.clone()
    }

    /// All channels a waveform's signal-or-group reference maps to, sorted
    /// and deduplicated.
    fn channels_for(&self, signal_or_group: &str) -> Vec<u16> {
        let mut channels: Vec<u16> = Vec::new();
        let signals = self
            .tables
            .signals_for_key(signal_or_group)
            .unwrap_or_else(|| vec![signal_or_group.to_string()]);
        for signal in signals {
            if let Some(chs) = self.channel_map.channels_of(&signal) {
                channels.extend_from_slice(chs);
            }
        }
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    /// The two "middle" edges of a definition, in integer nanoseconds.
    fn middle_edges(&self, td: &TimingData) -> (Option<i64>, Option<i64>) {
        let usable: Vec<&str> = td
            .edges
            .iter()
            .filter(|e| !e.time.is_empty() && !e.events.is_empty())
            .map(|e| e.time.as_str())
            .collect();
        let to_ns = |lit: &str| self.converter.convert_literal_to_int(lit, None).ok();
        match usable.as_slice() {
            [] => (None, None),
            [only] => (to_ns(only), None),
            [a, b] => (to_ns(a), to_ns(b)),
            more => (to_ns(more[1]), to_ns(more[2])),
        }
    }

    /// Format one waveform table's RRADR/REP_RATE/CLOCK/STROBE block.
    pub fn format_table(&mut self, table: &WftTable) -> Result<String, TimingError> {
        let rradr = self.rradr_of(&table.name)?;
        let mut lines = vec![format!("RRADR {rradr}")];
        if let Some(first) = table.records.first() {
            if !first.period.is_empty() {
                let ns = self.converter.convert_literal_to_int(&first.period, None)?;
                lines.push(format!("REP_RATE {ns}"));
            }
        }
        lines.push(String::new());

        let mut clock_done: HashSet<&str> = HashSet::new();
        let mut strobe_done: HashSet<&str> = HashSet::new();
        let mut clock_lines: Vec<String> = Vec::new();
        let mut strobe_lines: Vec<String> = Vec::new();

        for td in &table.records {
            if td.signal.is_empty() {
                continue;
            }
            let channels = self.channels_for(&td.signal);
            if channels.is_empty() {
                continue;
            }
            let (e1, e2) = self.middle_edges(td);
            let channel_str = format_channels(&channels);
            let edge_str = format_edges(e1, e2);

            match td.strobe {
                StrobeClass::Bidirectional => {
                    if clock_done.insert(&td.signal) && !td.edge_format.is_empty() {
                        clock_lines.push(format!("CLOCK{rradr} {channel_str} {edge_str}"));
                        clock_lines.push(format!("FORMAT {channel_str} {}", td.edge_format));
                    }
                    if strobe_done.insert(&td.signal) {
                        strobe_lines.push(format!("STROBE{rradr} {channel_str} {edge_str}"));
                    }
                }
                StrobeClass::Strobe => {
                    if strobe_done.insert(&td.signal) {
                        strobe_lines.push(format!("STROBE{rradr} {channel_str} {edge_str}"));
                    }
                }
                StrobeClass::Driver => {
                    if clock_done.insert(&td.signal) {
                        clock_lines.push(format!("CLOCK{rradr} {channel_str} {edge_str}"));
                        if !td.edge_format.is_empty() {
                            clock_lines.push(format!("FORMAT {channel_str} {}", td.edge_format));
                        }
                    }
                }
                StrobeClass::Unknown => {}
            }
        }

        lines.extend(clock_lines);
        lines.extend(strobe_lines);
        Ok(lines.join("\n"))
    }

    /// Format every table, in enumeration order.
    pub fn format_all(&mut self, timings: &[WftTable]) -> Result<String, TimingError> {
        self.wft_to_rradr.clear();
        let mut parts = Vec::with_capacity(timings.len());
        for table in timings {
            parts.push(self.format_table(table)?);
        }
        Ok(parts.join("\n\n"))
    }
}

/// Compress a sorted channel list: runs of three or more use `start-end`,
/// pairs stay comma-separated, singletons stand alone.
pub fn format_channels(channels: &[u16]) -> String {
    if channels.is_empty() {
        return "<>".to_string();
    }
    let mut sorted: Vec<u16> = channels.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut start = sorted[0];
    let mut end = sorted[0];
    let mut flush = |start: u16, end: u16, parts: &mut Vec<String>| {
        if start == end {
            parts.push(start.to_string());
        } else if end - start == 1 {
            parts.push(format!("{start},{end}"));
        } else {
            parts.push(format!("{start}-{end}"));
        }
    };
    for &ch in &sorted[1..] {
        if ch == end + 1 {
            end = ch;
        } else {
            flush(start, end, &mut parts);
            start = ch;
            end = ch;
        }
    }
    flush(start, end, &mut parts);
    format!("<{}>", parts.join(","))
}

pub fn format_edges(edge1: Option<i64>, edge2: Option<i64>) -> String {
    match (edge1, edge2) {
        (None, _) => "0".to_string(),
        (Some(a), None) => a.to_string(),
        (Some(a), Some(b)) => format!("{a},{b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_symbols::{GroupEntry, Signal, SymbolTables};
    use core_timing::{Edge, RawWaveform, SignalDirection, analyze_waveform};

    fn tables() -> SymbolTables {
        let mut t = SymbolTables::default();
        for (name, dir) in [("clk", "In"), ("q", "Out"), ("io", "InOut")] {
            t.signals.push(Signal {
                name: name.to_string(),
                direction: SignalDirection::parse(dir),
            });
        }
        t.groups.push(GroupEntry {
            qualified: "pins".into(),
            name: "pins".into(),
            signals: vec!["clk".into(), "q".into()],
        });
        t
    }

    fn channel_map() -> ChannelMap {
        let mut m = ChannelMap::new();
        m.set("clk", vec![0]);
        m.set("q", vec![3, 4, 5]);
        m.set("io", vec![7]);
        m
    }

    fn wft_table(signal: &str, wfc: &str, edges: &[(&str, &str)], dir: &str) -> WftTable {
        let raw = RawWaveform {
            wft: "wt1".into(),
            period: "100ns".into(),
            signal: signal.into(),
            wfc: wfc.into(),
            edges: edges
                .iter()
                .map(|(t, e)| Edge {
                    time: (*t).into(),
                    events: (*e).into(),
                })
                .collect(),
        };
        WftTable {
            domain: "t1".into(),
            name: "wt1".into(),
            period: "100ns".into(),
            records: analyze_waveform(&raw, SignalDirection::parse(dir)).records,
        }
    }

    #[test]
    fn channel_compression_cases() {
        assert_eq!(format_channels(&[3, 4, 5, 6, 7]), "<3-7>");
        assert_eq!(format_channels(&[3, 4]), "<3,4>");
        assert_eq!(format_channels(&[3]), "<3>");
        assert_eq!(format_channels(&[3, 4, 5, 7, 8]), "<3-5,7,8>");
        assert_eq!(format_channels(&[]), "<>");
    }

    #[test]
    fn driver_emits_clock_and_format() {
        let tables = tables();
        let map = channel_map();
        let mut fmt = TimingFormatter::new(&tables, &map);
        let table = wft_table("clk", "01", &[("0ns", "DU"), ("5ns", "UD")], "In");
        let text = fmt.format_table(&table).unwrap();
        assert!(text.starts_with("RRADR 0"));
        assert!(text.contains("REP_RATE 100"));
        assert!(text.contains("CLOCK0 <0> 0,5"));
        assert!(text.contains("FORMAT <0> DNRZ"));
        assert!(!text.contains("STROBE"));
    }

    #[test]
    fn strobe_signal_emits_strobe_line() {
        let tables = tables();
        let map = channel_map();
        let mut fmt = TimingFormatter::new(&tables, &map);
        let table = wft_table("q", "LH", &[("25ns", "LH"), ("75ns", "LH")], "Out");
        let text = fmt.format_table(&table).unwrap();
        assert!(text.contains("STROBE0 <3-5> 25,75"));
        assert!(!text.contains("CLOCK0"));
    }

    #[test]
    fn bidirectional_emits_both_lines() {
        let tables = tables();
        let map = channel_map();
        let mut fmt = TimingFormatter::new(&tables, &map);
        let table = wft_table("io", "LH", &[("10ns", "D"), ("20ns", "U")], "InOut");
        let text = fmt.format_table(&table).unwrap();
        assert!(text.contains("CLOCK0 <7> 10,20"));
        assert!(text.contains("FORMAT <7>"));
        assert!(text.contains("STROBE0 <7> 10,20"));
    }

    #[test]
    fn group_reference_collects_member_channels() {
        let tables = tables();
        let map = channel_map();
        let mut fmt = TimingFormatter::new(&tables, &map);
        let table = wft_table("pins", "1", &[("0ns", "U")], "In");
        let text = fmt.format_table(&table).unwrap();
        assert!(text.contains("CLOCK0 <0,3-5>"));
    }

    #[test]
    fn middle_edges_of_four() {
        let tables = tables();
        let map = channel_map();
        let fmt = TimingFormatter::new(&tables, &map);
        let table = wft_table(
            "clk",
            "P",
            &[("0ns", "D"), ("10ns", "U"), ("30ns", "D"), ("90ns", "D")],
            "In",
        );
        let (a, b) = fmt.middle_edges(&table.records[0]);
        assert_eq!((a, b), (Some(10), Some(30)));
    }

    #[test]
    fn rradr_slots_are_first_come_first_served() {
        let tables = tables();
        let map = channel_map();
        let mut fmt = TimingFormatter::new(&tables, &map);
        assert_eq!(fmt.rradr_of("a").unwrap(), 0);
        assert_eq!(fmt.rradr_of("b").unwrap(), 1);
        assert_eq!(fmt.rradr_of("a").unwrap(), 0);
    }

    #[test]
    fn rradr_overflow_is_an_error() {
        let tables = tables();
        let map = channel_map();
        let mut fmt = TimingFormatter::new(&tables, &map);
        for i in 0..RRADR_SLOTS {
            fmt.rradr_of(&format!("wt{i}")).unwrap();
        }
        assert!(matches!(
            fmt.rradr_of("one_too_many"),
            Err(TimingError::RradrOverflow(_))
        ));
    }
}
