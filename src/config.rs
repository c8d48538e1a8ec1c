//! Static run settings, read once at startup.
//!
//! Every field has a default matching the stock toolkit behaviour, so an
//! absent or partial `recon.toml` is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ports::{PortMap, PortRange};
use crate::types::EnumerationCategory;

/// File picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "recon.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Ask before each enumeration step. `--no-confirm` turns it off.
    pub confirmation_mode: bool,
    pub output_dir: PathBuf,
    pub logging: LoggingSettings,
    pub scan: ScanSettings,
    pub timeouts: TimeoutSettings,
    pub tools: ToolPaths,
    pub web: WebSettings,
    pub port_map: PortMap,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confirmation_mode: true,
            output_dir: PathBuf::from("./reports"),
            logging: LoggingSettings::default(),
            scan: ScanSettings::default(),
            timeouts: TimeoutSettings::default(),
            tools: ToolPaths::default(),
            web: WebSettings::default(),
            port_map: PortMap::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Optional log file; console output is unaffected.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanSettings {
    pub timeout_secs: u64,
    /// Extra scanner flags placed before the port selection.
    pub arguments: Vec<String>,
    /// Used when no explicit port range is configured.
    pub top_ports: u32,
    pub port_range: Option<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            arguments: vec!["-sV".to_string(), "-T4".to_string()],
            top_ports: 1000,
            port_range: None,
        }
    }
}

/// Per-step ceilings, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutSettings {
    pub web: u64,
    pub ftp: u64,
    pub ssh: u64,
    pub smb: u64,
    pub dns: u64,
    pub database: u64,
    pub feroxbuster: u64,
    pub sublist3r: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            web: 30,
            ftp: 30,
            ssh: 30,
            smb: 60,
            dns: 30,
            database: 30,
            feroxbuster: 300,
            sublist3r: 180,
        }
    }
}

impl TimeoutSettings {
    /// Ceiling for one whole dispatch of `category`. Web grows by the deep
    /// tool budgets when those run.
    pub fn for_category(&self, category: EnumerationCategory, deep: bool) -> Duration {
        let secs = match category {
            EnumerationCategory::Web if deep => self.web + self.feroxbuster + self.sublist3r,
            EnumerationCategory::Web => self.web,
            EnumerationCategory::Ftp => self.ftp,
            EnumerationCategory::Ssh => self.ssh,
            EnumerationCategory::Smb => self.smb,
            EnumerationCategory::Dns => self.dns,
            EnumerationCategory::Database => self.database,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Explicit binary locations. `None` means search `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    pub nmap: Option<PathBuf>,
    pub feroxbuster: Option<PathBuf>,
    pub sublist3r: Option<PathBuf>,
    pub smbclient: Option<PathBuf>,
    pub dig: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebSettings {
    pub wordlist: Option<PathBuf>,
    pub threads: u32,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            wordlist: None,
            threads: 10,
        }
    }
}

impl Settings {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when it exists, or
    /// fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_path(p),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_path(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(s)?;
        if let Some(range) = &settings.scan.port_range {
            range
                .parse::<PortRange>()
                .with_context(|| format!("invalid scan.port_range: {range}"))?;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let s = Settings::from_toml_str("").unwrap();
        assert_eq!(s, Settings::default());
        assert!(s.confirmation_mode);
        assert_eq!(s.output_dir, PathBuf::from("./reports"));
        assert_eq!(s.timeouts.smb, 60);
        assert_eq!(s.scan.timeout_secs, 300);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let s = Settings::from_toml_str(
            r#"
            confirmation_mode = false

            [timeouts]
            ftp = 5

            [tools]
            nmap = "/opt/nmap/bin/nmap"

            [port_map]
            "2222" = "ssh"
            "8000" = "web"
            "#,
        )
        .unwrap();
        assert!(!s.confirmation_mode);
        assert_eq!(s.timeouts.ftp, 5);
        assert_eq!(s.timeouts.ssh, 30);
        assert_eq!(s.tools.nmap.as_deref(), Some(Path::new("/opt/nmap/bin/nmap")));
        // A user table replaces the default one entirely.
        assert_eq!(s.port_map.classify(2222), Some(EnumerationCategory::Ssh));
        assert_eq!(s.port_map.classify(22), None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::from_toml_str("[port_map]\n\"0\" = \"ftp\"\n").is_err());
        assert!(Settings::from_toml_str("[port_map]\n\"21\" = \"telnet\"\n").is_err());
        assert!(Settings::from_toml_str("[scan]\nport_range = \"9-1\"\n").is_err());
    }

    #[test]
    fn web_budget_includes_deep_tools() {
        let t = TimeoutSettings::default();
        assert_eq!(t.for_category(EnumerationCategory::Web, false), Duration::from_secs(30));
        assert_eq!(t.for_category(EnumerationCategory::Web, true), Duration::from_secs(510));
        assert_eq!(t.for_category(EnumerationCategory::Smb, true), Duration::from_secs(60));
    }
}
