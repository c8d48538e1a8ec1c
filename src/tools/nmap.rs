use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use super::{run, ToolInvocation, NMAP};
use crate::config::ScanSettings;
use crate::error::ScanError;
use crate::ports::PortRange;
use crate::types::{PortRecord, PortScan, PortState, Target};

/// Port-scan collaborator: one invocation per run.
#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn scan(&self, target: &Target, ports: Option<&PortRange>) -> Result<PortScan, ScanError>;
}

#[derive(Debug, Clone)]
pub struct NmapScanner {
    program: PathBuf,
    arguments: Vec<String>,
    top_ports: u32,
    timeout: Duration,
}

impl NmapScanner {
    pub fn new(program: impl Into<PathBuf>, settings: &ScanSettings) -> Self {
        Self {
            program: program.into(),
            arguments: settings.arguments.clone(),
            top_ports: settings.top_ports.max(1),
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
        }
    }

    pub fn invocation(&self, target: &Target, ports: Option<&PortRange>) -> ToolInvocation {
        let inv = ToolInvocation::new(NMAP, &self.program).args(self.arguments.iter().cloned());
        let inv = match ports {
            Some(range) => inv.arg("-p").arg(range.as_nmap_arg()),
            None => inv.arg("--top-ports").arg(self.top_ports.to_string()),
        };
        // nmap only scans IPv6 with `-6`, and wants the address unbracketed.
        let (inv, host) = match target.ip() {
            Some(ip @ IpAddr::V6(_)) => (inv.arg("-6"), ip.to_string()),
            _ => (inv, target.as_str().to_string()),
        };
        // `--` keeps the target from ever being read as an option.
        inv.args(["-oG", "-", "--"]).arg(host)
    }

    fn requested_count(&self, ports: Option<&PortRange>) -> u32 {
        ports.map_or(self.top_ports, PortRange::count)
    }
}

#[async_trait]
impl PortScanner for NmapScanner {
    async fn scan(&self, target: &Target, ports: Option<&PortRange>) -> Result<PortScan, ScanError> {
        let inv = self.invocation(target, ports);
        let output = run(&inv, self.timeout).await?.require_success(NMAP)?;
        let parsed = parse_greppable(&output.stdout).ok_or_else(|| ScanError::HostDown {
            target: target.to_string(),
        })?;
        let total_scanned = if parsed.listed == 0 && parsed.ignored == 0 {
            self.requested_count(ports)
        } else {
            parsed.listed + parsed.ignored
        };
        info!(target = %target, ports = parsed.records.len(), total_scanned, "port scan complete");
        Ok(PortScan {
            ports: parsed.records,
            total_scanned,
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GreppableScan {
    pub records: Vec<PortRecord>,
    pub listed: u32,
    pub ignored: u32,
}

/// Parse `-oG` output. Returns `None` when no host was reported up.
pub fn parse_greppable(out: &str) -> Option<GreppableScan> {
    let mut host_up = false;
    let mut scan = GreppableScan::default();

    for line in out.lines().filter(|l| l.starts_with("Host:")) {
        for field in line.split('\t') {
            let field = field.trim();
            if let Some(status) = field.strip_prefix("Status:") {
                host_up |= status.trim().eq_ignore_ascii_case("up");
            } else if let Some(ports) = field.strip_prefix("Ports:") {
                host_up = true;
                for entry in split_port_entries(ports) {
                    match parse_port_entry(entry) {
                        Some(rec) => {
                            scan.listed += 1;
                            scan.records.push(rec);
                        }
                        None => debug!(entry, "skipping unparsable port entry"),
                    }
                }
            } else if let Some(ignored) = field.strip_prefix("Ignored State:") {
                host_up = true;
                scan.ignored += parse_ignored_count(ignored).unwrap_or(0);
            }
        }
    }

    host_up.then_some(scan)
}

/// Entries are joined by `", "` but version strings may contain that too, so
/// only split where the next chunk starts a new `port/` entry.
fn split_port_entries(s: &str) -> Vec<&str> {
    let s = s.trim();
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, _) in s.match_indices(", ") {
        let rest = &s[idx + 2..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && rest.as_bytes().get(digits) == Some(&b'/') {
            out.push(s[start..idx].trim());
            start = idx + 2;
        }
    }
    if start < s.len() {
        out.push(s[start..].trim());
    }
    out.retain(|e| !e.is_empty());
    out
}

fn parse_port_entry(entry: &str) -> Option<PortRecord> {
    let mut fields = entry.split('/');
    let port: u16 = fields.next()?.trim().parse().ok().filter(|p| *p != 0)?;
    let state = PortState::from_nmap(fields.next()?.trim());
    let _protocol = fields.next()?;
    let _owner = fields.next();
    let service = fields.next().map(str::trim).unwrap_or("");
    let _rpc = fields.next();
    let version = fields.next().map(str::trim).unwrap_or("");
    Some(PortRecord {
        port,
        state,
        service: if service.is_empty() {
            "unknown".to_string()
        } else {
            service.to_string()
        },
        version: version.to_string(),
    })
}

fn parse_ignored_count(s: &str) -> Option<u32> {
    let open = s.find('(')?;
    let close = s[open..].find(')')? + open;
    s[open + 1..close].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# Nmap 7.94 scan initiated Tue Oct 14 10:00:00 2025 as: nmap -sV -T4 --top-ports 1000 -oG - -- 10.0.0.5\n\
Host: 10.0.0.5 ()\tStatus: Up\n\
Host: 10.0.0.5 ()\tPorts: 22/open/tcp//ssh//OpenSSH 8.2p1 Ubuntu 4ubuntu0.5 (Ubuntu Linux, protocol 2.0)/, 80/open/tcp//http//Apache httpd 2.4.41 ((Ubuntu))/, 139/filtered/tcp//netbios-ssn///, 445/open/tcp//microsoft-ds?///\tIgnored State: closed (996)\n\
# Nmap done at Tue Oct 14 10:00:09 2025 -- 1 IP address (1 host up) scanned in 9.12 seconds\n";

    #[test]
    fn parses_ports_and_totals() {
        let scan = parse_greppable(SAMPLE).unwrap();
        assert_eq!(scan.listed, 4);
        assert_eq!(scan.ignored, 996);
        let ports: Vec<u16> = scan.records.iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![22, 80, 139, 445]);

        let ssh = &scan.records[0];
        assert_eq!(ssh.state, PortState::Open);
        assert_eq!(ssh.service, "ssh");
        assert_eq!(ssh.version, "OpenSSH 8.2p1 Ubuntu 4ubuntu0.5 (Ubuntu Linux, protocol 2.0)");
        assert_eq!(scan.records[2].state, PortState::Filtered);
        assert_eq!(scan.records[2].version, "");
        assert_eq!(scan.records[3].service, "microsoft-ds?");
    }

    #[test]
    fn host_down_yields_none() {
        let out = "# Nmap 7.94 scan initiated\n# Nmap done -- 1 IP address (0 hosts up) scanned in 3.04 seconds\n";
        assert_eq!(parse_greppable(out), None);
        let down = "Host: 10.0.0.9 ()\tStatus: Down\n";
        assert_eq!(parse_greppable(down), None);
    }

    #[test]
    fn host_up_without_open_ports() {
        let out = "Host: 10.0.0.6 ()\tStatus: Up\nHost: 10.0.0.6 ()\tIgnored State: closed (1000)\n";
        let scan = parse_greppable(out).unwrap();
        assert!(scan.records.is_empty());
        assert_eq!(scan.ignored, 1000);
    }

    #[test]
    fn empty_service_becomes_unknown() {
        let rec = parse_port_entry("9999/open/tcp/////").unwrap();
        assert_eq!(rec.service, "unknown");
        assert!(parse_port_entry("0/open/tcp/////").is_none());
        assert!(parse_port_entry("abc").is_none());
    }

    #[test]
    fn invocation_places_target_after_separator() {
        let scanner = NmapScanner::new("/usr/bin/nmap", &ScanSettings::default());
        let target = Target::parse("10.0.0.5").unwrap();
        let inv = scanner.invocation(&target, None);
        assert_eq!(
            inv.args,
            vec!["-sV", "-T4", "--top-ports", "1000", "-oG", "-", "--", "10.0.0.5"]
        );

        let range: PortRange = "1-100".parse().unwrap();
        let inv = scanner.invocation(&target, Some(&range));
        assert!(inv.args.windows(2).any(|w| w == ["-p", "1-100"]));

        let v6 = Target::parse("[::1]").unwrap();
        let inv = scanner.invocation(&v6, None);
        assert_eq!(
            inv.args,
            vec!["-sV", "-T4", "--top-ports", "1000", "-6", "-oG", "-", "--", "::1"]
        );
        let bare = Target::parse("fe80::1").unwrap();
        assert_eq!(scanner.invocation(&bare, None).args.last().unwrap(), "fe80::1");
    }
}
