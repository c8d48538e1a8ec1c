//! The per-run aggregate of port and enumeration data.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{ScanError, SessionError};
use crate::ports::PortMap;
use crate::types::{EnumKey, EnumerationCategory, EnumerationResult, PortRecord, PortScan, Target};

/// Everything one run learned about its target. Only grows: there is no way
/// to remove a port or a result once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSession {
    target: Target,
    scan_date: String,
    #[serde(skip)]
    started_at: OffsetDateTime,
    ports: Vec<PortRecord>,
    #[serde(serialize_with = "results_as_map")]
    enumeration_results: Vec<(EnumKey, EnumerationResult)>,
    total_ports_scanned: u32,
    #[serde(skip)]
    port_map: PortMap,
    #[serde(skip)]
    ports_recorded: bool,
}

impl ScanSession {
    pub fn new(target: Target, started_at: OffsetDateTime, port_map: PortMap) -> Self {
        let scan_date = started_at
            .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
            .unwrap_or_else(|_| String::from("1970-01-01 00:00:00"));
        Self {
            target,
            scan_date,
            started_at,
            ports: Vec::new(),
            enumeration_results: Vec::new(),
            total_ports_scanned: 0,
            port_map,
            ports_recorded: false,
        }
    }

    /// Take the port scanner's answer verbatim. Callable once.
    pub fn record_ports(&mut self, scan: Result<PortScan, ScanError>) -> Result<(), SessionError> {
        if self.ports_recorded {
            return Err(SessionError::PortsAlreadyRecorded);
        }
        let scan = scan.map_err(SessionError::InvalidScanResult)?;
        self.ports = scan.ports;
        self.total_ports_scanned = scan.total_scanned;
        self.ports_recorded = true;
        Ok(())
    }

    pub fn record_enumeration(
        &mut self,
        category: EnumerationCategory,
        port: u16,
        result: EnumerationResult,
    ) -> Result<(), SessionError> {
        let key = EnumKey::new(category, port);
        if self.contains(key) {
            return Err(SessionError::DuplicateEnumeration { key });
        }
        let open = self.ports.iter().any(|p| p.port == port && p.is_open());
        if !open || self.port_map.classify(port) != Some(category) {
            return Err(SessionError::PortNotEnumerable { key });
        }
        self.enumeration_results.push((key, result));
        Ok(())
    }

    pub fn contains(&self, key: EnumKey) -> bool {
        self.enumeration_results.iter().any(|(k, _)| *k == key)
    }

    /// Open ports that have a category, in scan order. A port the scanner
    /// listed twice appears once.
    pub fn enumerable_ports(&self) -> Vec<(u16, EnumerationCategory)> {
        let mut out: Vec<(u16, EnumerationCategory)> = Vec::new();
        for p in self.ports.iter().filter(|p| p.is_open()) {
            if let Some(category) = self.port_map.classify(p.port) {
                if !out.contains(&(p.port, category)) {
                    out.push((p.port, category));
                }
            }
        }
        out
    }

    pub fn open_ports(&self) -> impl Iterator<Item = &PortRecord> {
        self.ports.iter().filter(|p| p.is_open())
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn scan_date(&self) -> &str {
        &self.scan_date
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn ports(&self) -> &[PortRecord] {
        &self.ports
    }

    /// Results in execution order.
    pub fn enumeration_results(&self) -> &[(EnumKey, EnumerationResult)] {
        &self.enumeration_results
    }

    pub fn total_ports_scanned(&self) -> u32 {
        self.total_ports_scanned
    }
}

fn results_as_map<S>(results: &[(EnumKey, EnumerationResult)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(results.len()))?;
    for (key, result) in results {
        map.serialize_entry(&key.to_string(), result)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortState;
    use time::macros::datetime;

    fn session() -> ScanSession {
        ScanSession::new(
            Target::parse("10.0.0.5").unwrap(),
            datetime!(2024-03-01 12:30:05 UTC),
            PortMap::default(),
        )
    }

    fn scan() -> PortScan {
        let mut closed = PortRecord::open(21, "ftp");
        closed.state = PortState::Closed;
        PortScan {
            ports: vec![
                PortRecord::open(22, "ssh"),
                closed,
                PortRecord::open(80, "http"),
                PortRecord::open(9999, "unknown"),
            ],
            total_scanned: 1000,
        }
    }

    #[test]
    fn ports_are_kept_verbatim() {
        let mut s = session();
        s.record_ports(Ok(scan())).unwrap();
        assert_eq!(s.ports(), scan().ports.as_slice());
        assert_eq!(s.total_ports_scanned(), 1000);
        assert_eq!(
            s.enumerable_ports(),
            vec![(22, EnumerationCategory::Ssh), (80, EnumerationCategory::Web)]
        );
        assert!(matches!(
            s.record_ports(Ok(scan())),
            Err(SessionError::PortsAlreadyRecorded)
        ));
    }

    #[test]
    fn scan_error_is_rejected() {
        let mut s = session();
        let err = s
            .record_ports(Err(ScanError::HostDown {
                target: "10.0.0.5".into(),
            }))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidScanResult(_)));
        assert!(s.ports().is_empty());
    }

    #[test]
    fn duplicate_and_foreign_keys_are_rejected() {
        let mut s = session();
        s.record_ports(Ok(scan())).unwrap();
        let r = EnumerationResult::new().with("banner", "SSH-2.0-x");
        s.record_enumeration(EnumerationCategory::Ssh, 22, r.clone()).unwrap();
        assert!(matches!(
            s.record_enumeration(EnumerationCategory::Ssh, 22, r.clone()),
            Err(SessionError::DuplicateEnumeration { .. })
        ));
        // closed, unclassified, and mis-categorised ports
        for (cat, port) in [
            (EnumerationCategory::Ftp, 21),
            (EnumerationCategory::Web, 9999),
            (EnumerationCategory::Smb, 80),
        ] {
            assert!(matches!(
                s.record_enumeration(cat, port, r.clone()),
                Err(SessionError::PortNotEnumerable { .. })
            ));
        }
        assert_eq!(s.enumeration_results().len(), 1);
    }

    #[test]
    fn serializes_results_keyed_in_execution_order() {
        let mut s = session();
        s.record_ports(Ok(scan())).unwrap();
        s.record_enumeration(EnumerationCategory::Web, 80, EnumerationResult::new().with("status", 200))
            .unwrap();
        s.record_enumeration(EnumerationCategory::Ssh, 22, EnumerationResult::new().with("software", "x"))
            .unwrap();

        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"scan_date\":\"2024-03-01 12:30:05\""));
        let web = json.find("\"web_80\"").unwrap();
        let ssh = json.find("\"ssh_22\"").unwrap();
        assert!(web < ssh);
        assert!(!json.contains("port_map"));
    }
}
