//! Signal-to-channel mapping.
//!
//! The target equipment exposes 256 channels (0-255). A [`ChannelMap`]
//! assigns each DUT signal an ordered set of channel indices; the VCT
//! emitter consults it for every vector row and for the DRVR header.
//!
//! Channel cells accept comma-separated integers, ranges `a-b`, or a mix
//! (`"3-5,7"`). Out-of-range or non-numeric entries are skipped with a
//! warning; a channel assigned to two distinct signals is a configuration
//! error and rejected before any conversion starts.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub const CHANNEL_COUNT: usize = 256;

#[derive(Debug, Error)]
pub enum ChannelMapError {
    #[error("channel {channel} is assigned to both '{first}' and '{second}'")]
    Conflict {
        channel: u16,
        first: String,
        second: String,
    },
    #[error("channel map file has no usable rows")]
    Empty,
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ordered signal -> channels mapping. Insertion order is preserved so the
/// overview output matches the source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    entries: Vec<(String, Vec<u16>)>,
}

/// Result of re-reading a source file's signals against an older mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapReport {
    pub mapping: ChannelMap,
    pub mapped: Vec<String>,
    pub unmapped: Vec<String>,
    pub removed: Vec<String>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn signals(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(s, _)| s.as_str())
    }

    pub fn channels_of(&self, signal: &str) -> Option<&[u16]> {
        self.entries
            .iter()
            .find(|(s, _)| s == signal)
            .map(|(_, c)| c.as_slice())
    }

    /// Insert or replace a signal's channels.
    pub fn set(&mut self, signal: impl Into<String>, channels: Vec<u16>) {
        let signal = signal.into();
        match self.entries.iter_mut().find(|(s, _)| *s == signal) {
            Some((_, c)) => *c = channels,
            None => self.entries.push((signal, channels)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u16])> {
        self.entries
            .iter()
            .map(|(s, c)| (s.as_str(), c.as_slice()))
    }

    /// Channel -> signal view, later signals never displacing earlier ones.
    pub fn channel_to_signal(&self) -> HashMap<u16, &str> {
        let mut out = HashMap::new();
        for (signal, channels) in &self.entries {
            for &ch in channels {
                out.entry(ch).or_insert(signal.as_str());
            }
        }
        out
    }

    /// Reject duplicate channel assignments across distinct signals.
    pub fn validate(&self) -> Result<(), ChannelMapError> {
        let mut seen: HashMap<u16, &str> = HashMap::new();
        for (signal, channels) in &self.entries {
            for &ch in channels {
                if let Some(first) = seen.insert(ch, signal.as_str()) {
                    if first != signal {
                        return Err(ChannelMapError::Conflict {
                            channel: ch,
                            first: first.to_string(),
                            second: signal.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse a channel cell (`"3-5,7"`) into channel numbers. Bad entries are
/// reported through `warnings` and skipped.
pub fn parse_channel_string(cell: &str, warnings: &mut Vec<String>) -> Vec<u16> {
    let mut channels = Vec::new();
    for part in cell.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            match (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                (Ok(lo), Ok(hi)) if lo <= hi => {
                    for ch in lo..=hi {
                        push_channel(ch, &mut channels, warnings);
                    }
                }
                _ => warnings.push(format!("Warning: '{part}' is not a valid channel range")),
            }
            continue;
        }
        match part.parse::<u32>() {
            Ok(ch) => push_channel(ch, &mut channels, warnings),
            Err(_) => warnings.push(format!("Warning: '{part}' is not a valid channel number")),
        }
    }
    channels
}

fn push_channel(ch: u32, channels: &mut Vec<u16>, warnings: &mut Vec<String>) {
    if ch < CHANNEL_COUNT as u32 {
        channels.push(ch as u16);
    } else {
        warnings.push(format!(
            "Warning: channel {ch} is outside 0-{}, ignored",
            CHANNEL_COUNT - 1
        ));
    }
}

/// Load a two-column CSV (`Signal,Channel`). A header row is recognised by
/// its `Signal` cell and skipped.
pub fn load_csv(path: &Path, warnings: &mut Vec<String>) -> Result<ChannelMap, ChannelMapError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut map = ChannelMap::new();
    for record in reader.records() {
        let record = record?;
        let signal = record.get(0).unwrap_or("").trim();
        let cell = record.get(1).unwrap_or("").trim();
        if signal.is_empty() || signal.eq_ignore_ascii_case("signal") {
            continue;
        }
        let channels = parse_channel_string(cell, warnings);
        if channels.is_empty() {
            warnings.push(format!("Warning: signal '{signal}' has no valid channels"));
            continue;
        }
        map.set(signal, channels);
    }
    if map.is_empty() {
        return Err(ChannelMapError::Empty);
    }
    map.validate()?;
    tracing::debug!(target: "convert.channelmap", signals = map.len(), "channel map loaded");
    Ok(map)
}

/// Write a mapping back out as `Signal,Channel` CSV.
pub fn save_csv(map: &ChannelMap, path: &Path) -> Result<(), ChannelMapError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Signal", "Channel"])?;
    for (signal, channels) in map.iter() {
        let cell = channels
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        writer.write_record([signal, cell.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Reconcile an old mapping against a fresh signal list: signals still
/// present keep their channels, new signals surface as unmapped, vanished
/// signals are dropped and reported.
pub fn reconcile(old: &ChannelMap, new_signals: &[String]) -> RemapReport {
    let mut report = RemapReport::default();
    for signal in new_signals {
        match old.channels_of(signal) {
            Some(channels) => {
                report.mapping.set(signal.clone(), channels.to_vec());
                report.mapped.push(signal.clone());
            }
            None => report.unmapped.push(signal.clone()),
        }
    }
    for signal in old.signals() {
        if !new_signals.iter().any(|s| s == signal) {
            report.removed.push(signal.to_string());
        }
    }
    report
}
