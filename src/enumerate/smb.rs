use serde_json::json;
use std::time::Duration;

use crate::error::EnumerationCause;
use crate::tools::{self, ToolCatalog, ToolInvocation, SMBCLIENT};
use crate::types::{EnumerationResult, Target};

/// Status strings meaning the server answered but refused a null session.
const DENIED: &[&str] = &[
    "NT_STATUS_ACCESS_DENIED",
    "NT_STATUS_LOGON_FAILURE",
    "NT_STATUS_ACCOUNT_DISABLED",
];

/// List shares over a null session with `smbclient -L`.
pub async fn enumerate(
    catalog: &ToolCatalog,
    target: &Target,
    port: u16,
    limit: Duration,
) -> Result<EnumerationResult, EnumerationCause> {
    let program = catalog.require(SMBCLIENT)?;
    let inv = ToolInvocation::new(SMBCLIENT, program)
        .arg("-L")
        .arg(format!("//{}", target.host_for_url()))
        .args(["-N", "-g", "-p"])
        .arg(port.to_string());
    let output = tools::run(&inv, limit).await?;

    let combined = format!("{}\n{}", output.stdout, output.stderr);
    if let Some(status) = DENIED.iter().find(|s| combined.contains(**s)) {
        return Ok(EnumerationResult::new()
            .with("anonymous_access", false)
            .with("status", *status)
            .with("shares", json!([])));
    }

    let output = output.require_success(SMBCLIENT)?;
    let listing = parse_grepable(&output.stdout);
    let mut result = EnumerationResult::new()
        .with("anonymous_access", true)
        .with(
            "shares",
            listing
                .shares
                .iter()
                .map(|s| json!({ "name": s.name, "type": s.kind, "comment": s.comment }))
                .collect::<Vec<_>>(),
        );
    if let Some(wg) = listing.workgroup {
        result.insert("workgroup", wg);
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub name: String,
    pub kind: String,
    pub comment: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShareListing {
    pub shares: Vec<Share>,
    pub workgroup: Option<String>,
}

/// Parse `smbclient -g` lines of the form `Type|Name|Comment`.
pub fn parse_grepable(out: &str) -> ShareListing {
    let mut listing = ShareListing::default();
    for line in out.lines() {
        let mut parts = line.trim().splitn(3, '|');
        let (Some(kind), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let comment = parts.next().unwrap_or("").trim();
        match kind {
            "Disk" | "IPC" | "Printer" => listing.shares.push(Share {
                name: name.to_string(),
                kind: kind.to_string(),
                comment: comment.to_string(),
            }),
            "Workgroup" if listing.workgroup.is_none() => {
                listing.workgroup = Some(name.to_string());
            }
            _ => {}
        }
    }
    listing
}
