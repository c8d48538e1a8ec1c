use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The host under test, validated so it can be handed to external tools as a
/// single argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if s.is_empty() {
            bail!("target is empty");
        }
        if s.starts_with('-') {
            bail!("target must not start with '-': {s}");
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '_' | '-' | '[' | ']')))
        {
            bail!("target contains invalid character {c:?}: {s}");
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed address when the target is a literal IP (brackets allowed for IPv6).
    pub fn ip(&self) -> Option<IpAddr> {
        self.0
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    pub fn is_hostname(&self) -> bool {
        self.ip().is_none()
    }

    /// Form usable in `host:port` socket addresses and URLs.
    pub fn host_for_url(&self) -> String {
        match self.ip() {
            Some(IpAddr::V6(v6)) => format!("[{v6}]"),
            Some(ip) => ip.to_string(),
            None => self.0.clone(),
        }
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl PortState {
    /// Map an nmap state string. Compound states (`open|filtered`,
    /// `unfiltered`, ...) are not conclusively open and count as filtered.
    pub fn from_nmap(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "closed" => Self::Closed,
            _ => Self::Filtered,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Filtered => "filtered",
        }
    }
}

/// One discovered port as reported by the port scanner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub port: u16,
    pub state: PortState,
    pub service: String,
    pub version: String,
}

impl PortRecord {
    pub fn open(port: u16, service: &str) -> Self {
        Self {
            port,
            state: PortState::Open,
            service: service.to_string(),
            version: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

/// Output of a single port-scan invocation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PortScan {
    pub ports: Vec<PortRecord>,
    pub total_scanned: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationCategory {
    Web,
    Ftp,
    Ssh,
    Smb,
    Dns,
    Database,
}

impl EnumerationCategory {
    pub const ALL: [EnumerationCategory; 6] = [
        Self::Web,
        Self::Ftp,
        Self::Ssh,
        Self::Smb,
        Self::Dns,
        Self::Database,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ftp => "ftp",
            Self::Ssh => "ssh",
            Self::Smb => "smb",
            Self::Dns => "dns",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for EnumerationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnumerationCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown enumeration category: {s}"))
    }
}

/// Composite key of the enumeration-results mapping, rendered as `ssh_22`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumKey {
    pub category: EnumerationCategory,
    pub port: u16,
}

impl EnumKey {
    pub fn new(category: EnumerationCategory, port: u16) -> Self {
        Self { category, port }
    }
}

impl fmt::Display for EnumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.category, self.port)
    }
}

/// Category-specific findings. The aggregator never looks inside.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct EnumerationResult(Map<String, Value>);

impl EnumerationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_rejects_option_like_values() {
        assert!(Target::parse("-oN /tmp/x").is_err());
        assert!(Target::parse("--script=evil").is_err());
        assert!(Target::parse("").is_err());
        assert!(Target::parse("10.0.0.5; rm").is_err());
    }

    #[test]
    fn target_kinds() {
        let ip = Target::parse("10.0.0.5").unwrap();
        assert!(!ip.is_hostname());
        let host = Target::parse(" scanme.nmap.org ").unwrap();
        assert_eq!(host.as_str(), "scanme.nmap.org");
        assert!(host.is_hostname());
        let v6 = Target::parse("[::1]").unwrap();
        assert_eq!(v6.host_for_url(), "[::1]");
    }

    #[test]
    fn nmap_states() {
        assert_eq!(PortState::from_nmap("open"), PortState::Open);
        assert_eq!(PortState::from_nmap("closed"), PortState::Closed);
        assert_eq!(PortState::from_nmap("open|filtered"), PortState::Filtered);
    }

    #[test]
    fn key_display() {
        let key = EnumKey::new(EnumerationCategory::Database, 3306);
        assert_eq!(key.to_string(), "database_3306");
        assert_eq!("SMB".parse::<EnumerationCategory>().unwrap(), EnumerationCategory::Smb);
    }
}
