//! External binaries: discovery, dependency status and bounded execution.

use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::config::ToolPaths;
use crate::error::ToolError;

pub mod nmap;

pub use nmap::{NmapScanner, PortScanner};

pub const NMAP: &str = "nmap";
pub const FEROXBUSTER: &str = "feroxbuster";
pub const SUBLIST3R: &str = "sublist3r";
pub const SMBCLIENT: &str = "smbclient";
pub const DIG: &str = "dig";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolPresence {
    pub name: String,
    /// The run cannot start without this tool.
    pub required: bool,
    pub path: Option<PathBuf>,
}

impl ToolPresence {
    pub fn available(&self) -> bool {
        self.path.is_some()
    }
}

/// Reports which external tools are installed.
pub trait DependencyChecker: Send + Sync {
    fn check(&self) -> Vec<ToolPresence>;
}

/// Resolved locations of every tool the toolkit can drive.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    pub nmap: Option<PathBuf>,
    pub feroxbuster: Option<PathBuf>,
    pub sublist3r: Option<PathBuf>,
    pub smbclient: Option<PathBuf>,
    pub dig: Option<PathBuf>,
}

impl ToolCatalog {
    pub fn detect(paths: &ToolPaths) -> Self {
        Self {
            nmap: resolve(paths.nmap.as_deref(), &[NMAP]),
            feroxbuster: resolve(paths.feroxbuster.as_deref(), &[FEROXBUSTER]),
            sublist3r: resolve(
                paths.sublist3r.as_deref(),
                &[SUBLIST3R, "sublist3r.py", "Sublist3r"],
            ),
            smbclient: resolve(paths.smbclient.as_deref(), &[SMBCLIENT]),
            dig: resolve(paths.dig.as_deref(), &[DIG]),
        }
    }

    /// Path for `name`, or `NotFound` so callers can fail without spawning.
    pub fn require(&self, name: &str) -> Result<&Path, ToolError> {
        let slot = match name {
            NMAP => &self.nmap,
            FEROXBUSTER => &self.feroxbuster,
            SUBLIST3R => &self.sublist3r,
            SMBCLIENT => &self.smbclient,
            DIG => &self.dig,
            _ => &None,
        };
        slot.as_deref().ok_or_else(|| ToolError::NotFound {
            tool: name.to_string(),
        })
    }
}

impl DependencyChecker for ToolCatalog {
    fn check(&self) -> Vec<ToolPresence> {
        [
            (NMAP, true, &self.nmap),
            (FEROXBUSTER, false, &self.feroxbuster),
            (SUBLIST3R, false, &self.sublist3r),
            (SMBCLIENT, false, &self.smbclient),
            (DIG, false, &self.dig),
        ]
        .into_iter()
        .map(|(name, required, path)| ToolPresence {
            name: name.to_string(),
            required,
            path: path.clone(),
        })
        .collect()
    }
}

fn resolve(configured: Option<&Path>, candidates: &[&str]) -> Option<PathBuf> {
    if let Some(p) = configured {
        return is_executable(p).then(|| p.to_path_buf());
    }
    candidates.iter().find_map(|c| find_in_path(c))
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(bin);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{}.exe", bin));
            if is_executable(&exe) {
                return Some(exe);
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|md| md.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A fully specified command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(tool: &'static str, program: &Path) -> Self {
        Self {
            tool,
            program: program.to_path_buf(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Turn a non-zero exit into `ToolError::Failed`.
    pub fn require_success(self, tool: &str) -> Result<Self, ToolError> {
        if self.status.success() {
            Ok(self)
        } else {
            Err(ToolError::Failed {
                tool: tool.to_string(),
                code: self.status.code(),
                stderr: last_line(&self.stderr).to_string(),
            })
        }
    }
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Run `invocation` to completion within `limit`.
///
/// The child is killed when the limit expires or when the returned future is
/// dropped. A non-zero exit status is returned as output, not as an error.
pub async fn run(invocation: &ToolInvocation, limit: Duration) -> Result<ToolOutput, ToolError> {
    debug!(tool = invocation.tool, program = %invocation.program.display(), args = ?invocation.args, "running tool");
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match time::timeout(limit, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolError::NotFound {
                tool: invocation.tool.to_string(),
            })
        }
        Ok(Err(e)) => {
            return Err(ToolError::Spawn {
                tool: invocation.tool.to_string(),
                source: e,
            })
        }
        Err(_) => {
            return Err(ToolError::TimedOut {
                tool: invocation.tool.to_string(),
                secs: limit.as_secs(),
            })
        }
    };

    debug!(tool = invocation.tool, status = %output.status, "tool finished");
    Ok(ToolOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tools_are_reported_not_found() {
        let catalog = ToolCatalog::default();
        assert!(matches!(
            catalog.require(SMBCLIENT),
            Err(ToolError::NotFound { .. })
        ));
        let status = catalog.check();
        assert_eq!(status.len(), 5);
        assert!(status.iter().all(|t| !t.available()));
        assert_eq!(
            status.iter().filter(|t| t.required).map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec![NMAP]
        );
    }

    #[test]
    fn configured_path_must_exist() {
        let paths = ToolPaths {
            nmap: Some(PathBuf::from("/definitely/not/here/nmap")),
            ..ToolPaths::default()
        };
        assert!(ToolCatalog::detect(&paths).nmap.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_output_and_status() {
        let inv = ToolInvocation::new("sh", Path::new("/bin/sh"))
            .arg("-c")
            .arg("echo hello; echo oops >&2; exit 3");
        let out = run(&inv, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.status.code(), Some(3));
        let err = out.require_success("sh").unwrap_err();
        assert!(matches!(err, ToolError::Failed { code: Some(3), ref stderr, .. } if stderr == "oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_enforces_timeout() {
        let inv = ToolInvocation::new("sh", Path::new("/bin/sh")).args(["-c", "sleep 5"]);
        let err = run(&inv, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn run_reports_missing_binary() {
        let inv = ToolInvocation::new("ghost", Path::new("/nonexistent/ghost-tool"));
        let err = run(&inv, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }
}
