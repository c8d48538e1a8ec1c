//! Report rendering: a JSON dump of the whole session and a text summary.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use tokio::fs;
use tracing::{error, info};

use crate::error::ReportError;
use crate::session::ScanSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Text,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 2] = [Self::Json, Self::Text];

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "JSON",
            Self::Text => "TEXT",
        })
    }
}

/// Writes a finished session. Returns the files written; an empty map means
/// nothing could be produced.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(&self, session: &ScanSession, dir: &Path, base_name: &str) -> BTreeMap<ReportFormat, PathBuf>;
}

#[derive(Debug, Clone)]
pub struct FileReportRenderer {
    formats: Vec<ReportFormat>,
}

impl Default for FileReportRenderer {
    fn default() -> Self {
        Self {
            formats: ReportFormat::ALL.to_vec(),
        }
    }
}

impl FileReportRenderer {
    async fn write_one(
        &self,
        format: ReportFormat,
        session: &ScanSession,
        path: &Path,
    ) -> Result<(), ReportError> {
        let content = match format {
            ReportFormat::Json => serde_json::to_string_pretty(session)?,
            ReportFormat::Text => render_text(session),
        };
        fs::write(path, content).await.map_err(|source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
impl ReportRenderer for FileReportRenderer {
    async fn render(&self, session: &ScanSession, dir: &Path, base_name: &str) -> BTreeMap<ReportFormat, PathBuf> {
        let mut written = BTreeMap::new();
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "cannot create report directory");
            return written;
        }
        for &format in &self.formats {
            let path = dir.join(format!("{base_name}.{}", format.extension()));
            match self.write_one(format, session, &path).await {
                Ok(()) => {
                    info!(path = %path.display(), %format, "report written");
                    written.insert(format, path);
                }
                Err(e) => error!(%format, error = %e, "report generation failed"),
            }
        }
        written
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<target>_<YYYYmmdd_HHMMSS>` from the session start time.
pub fn report_base_name(session: &ScanSession) -> String {
    let stamp = session
        .started_at()
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| String::from("00000000_000000"));
    format!("{}_{stamp}", sanitize_filename(session.target().as_str()))
}

pub fn render_text(session: &ScanSession) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Reconnaissance report for {}", session.target());
    let _ = writeln!(out, "Scan date          : {}", session.scan_date());
    let _ = writeln!(out, "Total ports scanned: {}", session.total_ports_scanned());
    let _ = writeln!(out, "Ports reported     : {}", session.ports().len());

    let port_w = 4usize;
    let state_w = "filtered".len();
    let mut svc_w = "service".len();
    for p in session.ports() {
        svc_w = svc_w.max(p.service.len());
    }
    let _ = writeln!(out, "\nPorts");
    let _ = writeln!(
        out,
        "{:>port_w$}  {:<state_w$}  {:<svc_w$}  version",
        "port", "state", "service"
    );
    let _ = writeln!(out, "{:-<port_w$}  {:-<state_w$}  {:-<svc_w$}  -------", "", "", "");
    for p in session.ports() {
        let _ = writeln!(
            out,
            "{:>port_w$}  {:<state_w$}  {:<svc_w$}  {}",
            p.port,
            p.state.as_str(),
            p.service,
            p.version
        );
    }

    let _ = writeln!(out, "\nEnumeration results");
    if session.enumeration_results().is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (key, result) in session.enumeration_results() {
        let _ = writeln!(out, "\n[{key}]");
        let key_w = result.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (k, v) in result.iter() {
            let _ = writeln!(out, "  {k:<key_w$} : {}", text_value(v));
        }
    }
    out
}

fn text_value(v: &Value) -> String {
    match v {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(Value::is_string) => {
            let joined: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if joined.is_empty() {
                "(none)".to_string()
            } else {
                joined.join(", ")
            }
        }
        other => other.to_string(),
    }
}
