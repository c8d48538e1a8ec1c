use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::types::EnumerationCategory;

/// Static port → enumeration category table driving the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, EnumerationCategory>",
    into = "BTreeMap<String, EnumerationCategory>"
)]
pub struct PortMap {
    table: BTreeMap<u16, EnumerationCategory>,
}

impl PortMap {
    pub fn new(entries: impl IntoIterator<Item = (u16, EnumerationCategory)>) -> Self {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    /// Category for `port`, or `None` when the port is not enumerated.
    pub fn classify(&self, port: u16) -> Option<EnumerationCategory> {
        self.table.get(&port).copied()
    }
}

impl Default for PortMap {
    fn default() -> Self {
        use EnumerationCategory::*;
        Self::new([
            (21, Ftp),
            (22, Ssh),
            (53, Dns),
            (80, Web),
            (139, Smb),
            (443, Web),
            (445, Smb),
            (1433, Database),
            (3306, Database),
            (5432, Database),
            (8080, Web),
            (8443, Web),
        ])
    }
}

impl TryFrom<BTreeMap<String, EnumerationCategory>> for PortMap {
    type Error = anyhow::Error;

    fn try_from(raw: BTreeMap<String, EnumerationCategory>) -> Result<Self> {
        let mut table = BTreeMap::new();
        for (key, category) in raw {
            let port = parse_port_str(key.trim())
                .with_context(|| format!("invalid port in port_map: {key}"))?;
            table.insert(port, category);
        }
        Ok(Self { table })
    }
}

impl From<PortMap> for BTreeMap<String, EnumerationCategory> {
    fn from(map: PortMap) -> Self {
        map.table
            .into_iter()
            .map(|(p, c)| (p.to_string(), c))
            .collect()
    }
}

/// Validated `--ports` value such as `22,80,8000-8100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    list: String,
    count: u32,
}

impl PortRange {
    /// Normalised form passed to the scanner's `-p` flag.
    pub fn as_nmap_arg(&self) -> &str {
        &self.list
    }

    /// Number of distinct ports covered.
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let ports = parse_ports_str(s)?;
        if ports.is_empty() {
            bail!("port range is empty");
        }
        let items = port_items(s)
            .map(|item| {
                item.map(|(start, end)| {
                    if start == end {
                        start.to_string()
                    } else {
                        format!("{start}-{end}")
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            list: items.join(","),
            count: ports.len() as u32,
        })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.list)
    }
}

/// Parse a comma separated port list into deduplicated TCP ports (1..=65535).
///
/// Each item is either a single port (`80`) or an inclusive range
/// (`8000-8010`). Order of first appearance is kept.
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for item in port_items(s) {
        let (start, end) = item?;
        for p in start..=end {
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Non-empty comma separated items as inclusive `(start, end)` pairs.
fn port_items(s: &str) -> impl Iterator<Item = Result<(u16, u16)>> + '_ {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_item)
}

fn parse_item(item: &str) -> Result<(u16, u16)> {
    if let Some((a, b)) = item.split_once('-') {
        let start = parse_port_str(a.trim())
            .with_context(|| format!("invalid start in range: {item}"))?;
        let end = parse_port_str(b.trim())
            .with_context(|| format!("invalid end in range: {item}"))?;
        if start > end {
            bail!("invalid range {start}-{end} (start > end)");
        }
        return Ok((start, end));
    }
    let p = parse_port_str(item).with_context(|| format!("invalid port value: {item}"))?;
    Ok((p, p))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
