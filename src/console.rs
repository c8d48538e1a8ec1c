//! Operator-facing output. Diagnostics go through `tracing` on stderr; this is
//! the terse stdout narrative of a run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::report::ReportFormat;
use crate::tools::ToolPresence;
use crate::types::PortRecord;

pub const LEGAL_NOTICE: &str = "For AUTHORIZED security testing only. Only scan systems you own or have explicit permission to test.";

pub fn banner() {
    println!("==============================================================");
    println!(" recon-rs {}  automated reconnaissance & enumeration", env!("CARGO_PKG_VERSION"));
    println!("==============================================================");
    println!(" {LEGAL_NOTICE}");
    println!();
}

pub fn section(title: &str) {
    println!("\n=== {title} ===");
}

pub fn success(msg: &str) {
    println!("[+] {msg}");
}

pub fn info(msg: &str) {
    println!("[*] {msg}");
}

pub fn warn(msg: &str) {
    println!("[!] {msg}");
}

pub fn error(msg: &str) {
    println!("[-] {msg}");
}

pub fn dependency_table(tools: &[ToolPresence]) {
    let name_w = tools.iter().map(|t| t.name.len()).max().unwrap_or(4).max(4);
    println!("{:<name_w$}  {:<9}  path", "tool", "status");
    println!("{:-<name_w$}  {:-<9}  ----", "", "");
    for t in tools {
        let status = match (t.available(), t.required) {
            (true, _) => "found",
            (false, true) => "MISSING",
            (false, false) => "missing",
        };
        let path = t
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<name_w$}  {:<9}  {}", t.name, status, path);
    }
}

pub fn open_ports<'a>(ports: impl IntoIterator<Item = &'a PortRecord>) {
    for p in ports {
        let line = format!("  Port {}/tcp - {} {}", p.port, p.service, p.version);
        info(line.trim_end());
    }
}

pub fn report_paths(written: &BTreeMap<ReportFormat, PathBuf>) {
    for (format, path) in written {
        info(&format!("  {format}: {}", path.display()));
    }
}
