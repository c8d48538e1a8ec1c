use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::EnumerationCause;
use crate::tools::{self, ToolCatalog, ToolInvocation, ToolOutput, DIG};
use crate::types::{EnumerationResult, Target};

const RECORD_TYPES: [&str; 5] = ["A", "AAAA", "MX", "NS", "TXT"];
const MAX_RESERVE: Duration = Duration::from_secs(1);

/// Query the name server on `target:port` with `dig`.
///
/// The `version.bind` probe doubles as a liveness check: if the server does not
/// answer it the enumeration fails. Later queries that fail are recorded as
/// empty. The sweep stops short of `limit` so the answers already collected
/// are returned; queries it never started are listed in `notes`.
pub async fn enumerate(
    catalog: &ToolCatalog,
    target: &Target,
    port: u16,
    limit: Duration,
) -> Result<EnumerationResult, EnumerationCause> {
    let reserve = (limit / 10).min(MAX_RESERVE);
    let dig = Dig {
        program: catalog.require(DIG)?,
        server: target.ip().map_or_else(|| target.to_string(), |ip| ip.to_string()),
        port,
        deadline: Instant::now() + limit.saturating_sub(reserve),
    };

    let version = dig
        .query(&["+short", "version.bind", "CHAOS", "TXT"])
        .await?
        .require_success(DIG)?;
    let mut result = EnumerationResult::new().with("server", dig.server.as_str());
    let version = parse_short(&version.stdout);
    result.insert(
        "server_version",
        version.first().map(|v| v.trim_matches('"').to_string()),
    );

    let mut skipped = Vec::new();
    match target.ip() {
        Some(ip) => match dig.short(&["-x", &ip.to_string()]).await {
            Some(ptr) => result.insert("ptr", ptr),
            None => skipped.push("PTR"),
        },
        None => {
            let mut records = Map::new();
            for rtype in RECORD_TYPES {
                match dig.short(&[target.as_str(), rtype]).await {
                    Some(values) if !values.is_empty() => {
                        records.insert(rtype.to_string(), json!(values));
                    }
                    Some(_) => {}
                    None => skipped.push(rtype),
                }
            }
            result.insert("records", Value::Object(records));

            match dig.zone_transfer(target.as_str()).await {
                Some(axfr) => result.insert(
                    "zone_transfer",
                    json!({ "allowed": !axfr.is_empty(), "records": axfr }),
                ),
                None => skipped.push("AXFR"),
            }
        }
    }

    if !skipped.is_empty() {
        debug!(skipped = ?skipped, "dns sweep hit its deadline");
        result.insert(
            "notes",
            json!([format!("time budget exhausted, skipped: {}", skipped.join(", "))]),
        );
    }
    Ok(result)
}

struct Dig<'a> {
    program: &'a Path,
    server: String,
    port: u16,
    deadline: Instant,
}

impl Dig<'_> {
    fn remaining(&self) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    async fn query(&self, args: &[&str]) -> Result<ToolOutput, EnumerationCause> {
        let limit = self.remaining().ok_or(EnumerationCause::Timeout { secs: 0 })?;
        let inv = ToolInvocation::new(DIG, self.program)
            .arg(format!("@{}", self.server))
            .arg("-p")
            .arg(self.port.to_string())
            .args(["+time=5", "+tries=1"])
            .args(args.iter().copied());
        Ok(tools::run(&inv, limit).await?)
    }

    /// `None` when the deadline passed before the query could start.
    async fn short(&self, args: &[&str]) -> Option<Vec<String>> {
        self.remaining()?;
        let mut full = vec!["+short"];
        full.extend_from_slice(args);
        let values = match self.query(&full).await {
            Ok(out) if out.status.success() => parse_short(&out.stdout),
            Ok(out) => {
                debug!(args = ?args, status = %out.status, "dig query failed");
                Vec::new()
            }
            Err(e) => {
                debug!(args = ?args, error = %e, "dig query failed");
                Vec::new()
            }
        };
        Some(values)
    }

    async fn zone_transfer(&self, zone: &str) -> Option<Vec<String>> {
        self.remaining()?;
        let records = match self.query(&[zone, "AXFR"]).await {
            Ok(out) => parse_axfr(&out.stdout),
            Err(e) => {
                debug!(error = %e, "zone transfer query failed");
                Vec::new()
            }
        };
        Some(records)
    }
}

/// `+short` answers, one per line, without dig's `;;` diagnostics.
pub fn parse_short(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with(';'))
        .map(str::to_string)
        .collect()
}

/// Resource records from an AXFR answer. A refused transfer only prints
/// comment lines, so it yields an empty list.
pub fn parse_axfr(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with(';'))
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_answers_skip_diagnostics() {
        let out = "\"9.18.18-0ubuntu0.22.04.1-Ubuntu\"\n;; communications error\n\n";
        assert_eq!(parse_short(out), vec!["\"9.18.18-0ubuntu0.22.04.1-Ubuntu\""]);
    }

    #[test]
    fn refused_transfer_has_no_records() {
        let out = "\n; <<>> DiG 9.18.18 <<>> @10.0.0.5 example.com AXFR\n; (1 server found)\n;; global options: +cmd\n; Transfer failed.\n";
        assert!(parse_axfr(out).is_empty());
    }

    #[test]
    fn allowed_transfer_lists_records() {
        let out = "; <<>> DiG 9.18.18 <<>> @10.0.0.5 zonetransfer.me AXFR\n\
zonetransfer.me.\t7200\tIN\tSOA\tnsztm1.digi.ninja. robin.digi.ninja. 2019100801 172800 900 1209600 3600\n\
zonetransfer.me.\t7200\tIN\tA\t5.196.105.14\n\
;; Query time: 40 msec\n";
        let records = parse_axfr(out);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], "zonetransfer.me. 7200 IN A 5.196.105.14");
    }

    #[cfg(unix)]
    fn fake_dig(dir: &Path, body: &str) -> ToolCatalog {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("dig");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ToolCatalog {
            dig: Some(path),
            ..ToolCatalog::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hostname_sweep_collects_records() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = fake_dig(
            tmp.path(),
            r#"case "$*" in
  *version.bind*) echo '"9.18.18"' ;;
  *" A") echo 192.0.2.10 ;;
  *AXFR) echo '; Transfer failed.' ;;
esac"#,
        );
        let target = Target::parse("zone.example").unwrap();
        let result = enumerate(&catalog, &target, 53, Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.get("server_version").unwrap(), "9.18.18");
        assert_eq!(result.get("records").unwrap(), &json!({ "A": ["192.0.2.10"] }));
        assert_eq!(result.get("zone_transfer").unwrap()["allowed"], json!(false));
        assert!(result.get("notes").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_sweep_keeps_server_version() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = fake_dig(
            tmp.path(),
            r#"case "$*" in
  *version.bind*) echo '"9.18.18"' ;;
  *) exec sleep 5 ;;
esac"#,
        );
        let target = Target::parse("zone.example").unwrap();
        let limit = Duration::from_secs(2);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(limit, enumerate(&catalog, &target, 53, limit))
            .await
            .expect("sweep must finish inside its budget")
            .unwrap();
        assert!(started.elapsed() < limit);
        assert_eq!(result.get("server_version").unwrap(), "9.18.18");
        assert_eq!(result.get("records").unwrap(), &json!({}));
        let notes = result.get("notes").unwrap().to_string();
        assert!(notes.contains("AAAA") && notes.contains("AXFR"), "{notes}");
    }
}
