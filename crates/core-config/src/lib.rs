//! Configuration loading and parsing.
//!
//! Parses `patconv.toml` (or an override path provided by the binary).
//! Discovery prefers the working directory, then the platform config dir
//! (`<config>/patconv/patconv.toml`). Unknown fields are ignored (TOML
//! deserialization tolerance) so the file can grow without breaking older
//! binaries.
//!
//! Carried settings:
//! * `[mapping] char_map`: extra `X=Y` lines for the VCT character map;
//! * `[instructions] disabled`: instruction names that abort a conversion;
//! * `[log] filter`: default tracing filter when `RUST_LOG` is unset.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct MappingConfig {
    /// `X=Y` character-map lines, one entry per element.
    #[serde(default)]
    pub char_map: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct InstructionConfig {
    /// Deny-list: encountering one of these mid-pattern is fatal.
    #[serde(default)]
    pub disabled: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: Self::default_filter(),
        }
    }
}

impl LogConfig {
    fn default_filter() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub instructions: InstructionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Original file text, when a file was found.
    pub raw: Option<String>,
    pub file: ConfigFile,
}

/// Best-effort config path: local `patconv.toml` first, then the platform
/// config directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("patconv.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("patconv").join("patconv.toml");
    }
    PathBuf::from("patconv.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "runtime.config", path = %path.display(), "config loaded");
                Ok(Config {
                    raw: Some(content),
                    file,
                })
            }
            Err(e) => Err(anyhow::anyhow!(
                "cannot parse config {}: {e}",
                path.display()
            )),
        }
    } else {
        // Absent file is not an error; defaults apply.
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_is_absent() {
        let cfg = load_from(Some(PathBuf::from("/definitely/not/here.toml"))).unwrap();
        assert!(cfg.raw.is_none());
        assert!(cfg.file.instructions.disabled.is_empty());
        assert_eq!(cfg.file.log.filter, "info");
    }

    #[test]
    fn parses_all_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patconv.toml");
        std::fs::write(
            &path,
            r#"
[mapping]
char_map = ["X=.", "L=0"]

[instructions]
disabled = ["ScanChain"]

[log]
filter = "debug"
"#,
        )
        .unwrap();
        let cfg = load_from(Some(path)).unwrap();
        assert_eq!(cfg.file.mapping.char_map, vec!["X=.", "L=0"]);
        assert_eq!(cfg.file.instructions.disabled, vec!["ScanChain"]);
        assert_eq!(cfg.file.log.filter, "debug");
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patconv.toml");
        std::fs::write(&path, "[future]\nshiny = true\n").unwrap();
        assert!(load_from(Some(path)).is_ok());
    }

    #[test]
    fn bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patconv.toml");
        std::fs::write(&path, "[mapping\nchar_map = oops").unwrap();
        assert!(load_from(Some(path)).is_err());
    }
}
