//! The run workflow: dependency check, port scan, per-port enumeration and
//! report generation, in that order.
//!
//! Every await is raced against the run's [`CancellationToken`]; cancelling it
//! ends the run with [`RunError::Interrupted`] and no report.

use async_trait::async_trait;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::console;
use crate::enumerate::{EnumerationRequest, Enumerator};
use crate::error::{EnumerationCause, EnumerationFailed, RunError, SessionError};
use crate::ports::{PortMap, PortRange};
use crate::report::{report_base_name, ReportFormat, ReportRenderer};
use crate::session::ScanSession;
use crate::tools::{DependencyChecker, PortScanner};
use crate::types::{EnumKey, EnumerationCategory, EnumerationResult, Target};

pub const DEEP_TOOLS_PROMPT: &str = "Run feroxbuster and sublist3r? (may take time)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    DependencyCheck,
    PortScan,
    PortClassification,
    PerPortEnumeration,
    AwaitConfirmation,
    Dispatch,
    ReportGeneration,
    Done,
    Failed,
}

impl Phase {
    /// Position in the workflow. The per-port sub-states share one rank so the
    /// loop can revisit them for each port.
    fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::DependencyCheck => 1,
            Self::PortScan => 2,
            Self::PortClassification => 3,
            Self::PerPortEnumeration | Self::AwaitConfirmation | Self::Dispatch => 4,
            Self::ReportGeneration => 5,
            Self::Done | Self::Failed => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() > self.rank() || (next.rank() == 4 && self.rank() == 4)
    }
}

/// Operator yes/no gate.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn confirm(&self, prompt: &str, default: bool) -> io::Result<bool>;
}

/// Interactive prompt on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn confirm(&self, prompt: &str, default: bool) -> io::Result<bool> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(default)
                .interact()
                .map_err(|e| match e {
                    dialoguer::Error::IO(io) => io,
                })
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Answers yes without asking.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl Prompter for AutoConfirm {
    async fn confirm(&self, _prompt: &str, _default: bool) -> io::Result<bool> {
        Ok(true)
    }
}

/// Per-run choices, already merged from settings and command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: Target,
    pub output_dir: PathBuf,
    pub port_range: Option<PortRange>,
    pub confirm: bool,
    pub quick: bool,
}

pub struct Collaborators {
    pub checker: Box<dyn DependencyChecker>,
    pub scanner: Box<dyn PortScanner>,
    pub enumerator: Arc<dyn Enumerator>,
    pub prompter: Box<dyn Prompter>,
    pub renderer: Box<dyn ReportRenderer>,
}

/// Outcome of a run that reached report generation.
#[derive(Debug)]
pub struct RunReport {
    pub session: ScanSession,
    pub reports: BTreeMap<ReportFormat, PathBuf>,
    pub failures: Vec<EnumerationFailed>,
    /// Enumerations the operator declined.
    pub skipped: Vec<EnumKey>,
}

impl RunReport {
    /// The renderer produced no files.
    pub fn report_failed(&self) -> bool {
        self.reports.is_empty()
    }
}

pub struct Orchestrator {
    port_map: PortMap,
    options: RunOptions,
    parts: Collaborators,
    cancel: CancellationToken,
    phase: Phase,
}

impl Orchestrator {
    pub fn new(
        settings: &Settings,
        options: RunOptions,
        parts: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port_map: settings.port_map.clone(),
            options,
            parts,
            cancel,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub async fn run(&mut self) -> Result<RunReport, RunError> {
        match self.drive().await {
            Ok(report) => {
                self.advance(Phase::Done);
                Ok(report)
            }
            Err(e) => {
                self.advance(Phase::Failed);
                match &e {
                    RunError::Interrupted => info!("run interrupted"),
                    other => error!(error = %other, "run failed"),
                }
                Err(e)
            }
        }
    }

    fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            error!(from = ?self.phase, to = ?next, "illegal phase transition ignored");
            return;
        }
        debug!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
    }

    async fn drive(&mut self) -> Result<RunReport, RunError> {
        let target = self.options.target.clone();
        let started_at = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let mut session = ScanSession::new(target.clone(), started_at, self.port_map.clone());

        self.advance(Phase::DependencyCheck);
        console::section("Dependency Check");
        let tools = self.parts.checker.check();
        console::dependency_table(&tools);
        if let Some(missing) = tools.iter().find(|t| t.required && !t.available()) {
            console::error(&format!("Critical dependency missing. Please install {}.", missing.name));
            return Err(RunError::DependencyMissing {
                tool: missing.name.clone(),
            });
        }
        for t in tools.iter().filter(|t| !t.available()) {
            warn!(tool = %t.name, "optional tool not found; dependent enumerations will fail");
        }

        self.advance(Phase::PortScan);
        console::section(&format!("Port Scanning: {target}"));
        console::info(&format!("Target: {target}"));
        if let Some(range) = &self.options.port_range {
            console::info(&format!("Port Range: {range}"));
        }
        let scan = self
            .cancellable(self.parts.scanner.scan(&target, self.options.port_range.as_ref()))
            .await?;
        match session.record_ports(scan) {
            Ok(()) => {}
            Err(SessionError::InvalidScanResult(e)) => {
                console::error(&format!("Scan failed: {e}"));
                return Err(RunError::ScanFailed(e));
            }
            Err(e) => return Err(e.into()),
        }

        let open: Vec<_> = session.open_ports().cloned().collect();
        let mut failures = Vec::new();
        let mut skipped = Vec::new();

        if open.is_empty() {
            console::info("No open ports found");
        } else {
            console::success(&format!("Found {} open ports", open.len()));
            console::open_ports(&open);

            self.advance(Phase::PortClassification);
            let work = session.enumerable_ports();
            for p in open.iter().filter(|p| self.port_map.classify(p.port).is_none()) {
                debug!(port = p.port, service = %p.service, "no enumeration mapped for port");
            }

            if self.options.quick {
                console::info("Quick mode: skipping service enumeration");
            } else if !work.is_empty() {
                console::section("Service Enumeration");
                for (port, category) in work {
                    self.enumerate_port(&mut session, category, port, &mut failures, &mut skipped)
                        .await?;
                }
            }
        }

        self.advance(Phase::ReportGeneration);
        if self.cancel.is_cancelled() {
            return Err(RunError::Interrupted);
        }
        console::section("Generating Reports");
        let base = report_base_name(&session);
        let reports = self
            .cancellable(self.parts.renderer.render(&session, &self.options.output_dir, &base))
            .await?;
        if reports.is_empty() {
            error!(dir = %self.options.output_dir.display(), "no report could be generated");
            console::error("Failed to generate reports");
        } else {
            console::success("Reports generated successfully:");
            console::report_paths(&reports);
        }

        console::section("Scan Complete");
        console::success(&format!("Reconnaissance complete for {target}"));
        Ok(RunReport {
            session,
            reports,
            failures,
            skipped,
        })
    }

    async fn enumerate_port(
        &mut self,
        session: &mut ScanSession,
        category: EnumerationCategory,
        port: u16,
        failures: &mut Vec<EnumerationFailed>,
        skipped: &mut Vec<EnumKey>,
    ) -> Result<(), RunError> {
        self.advance(Phase::PerPortEnumeration);
        let key = EnumKey::new(category, port);
        if session.contains(key) {
            error!(%key, "port already enumerated in this run; not dispatching again");
            return Ok(());
        }

        let mut run_deep_tools = false;
        if self.options.confirm {
            self.advance(Phase::AwaitConfirmation);
            let prompt = format!(
                "Run {} enumeration on port {port}?",
                category.as_str().to_uppercase()
            );
            if !self.ask(&prompt).await? {
                console::info(&format!("Skipping {category} enumeration on port {port}"));
                skipped.push(key);
                return Ok(());
            }
            if category == EnumerationCategory::Web {
                run_deep_tools = self.ask(DEEP_TOOLS_PROMPT).await?;
            }
        } else {
            run_deep_tools = category == EnumerationCategory::Web;
        }

        self.advance(Phase::Dispatch);
        console::info(&format!("Running {category} enumeration on port {port}..."));
        let request = EnumerationRequest {
            category,
            target: self.options.target.clone(),
            port,
            run_deep_tools,
        };
        match self.dispatch(request).await? {
            Ok(result) => match session.record_enumeration(category, port, result) {
                Ok(()) => {
                    info!(%key, "enumeration recorded");
                    console::success(&format!("Completed {category} enumeration on port {port}"));
                }
                Err(e) => error!(%key, error = %e, "enumeration result rejected"),
            },
            Err(failure) => {
                if failure.is_unexpected() {
                    error!(category = %category, port, error = %failure, "enumeration hit an internal error");
                } else {
                    warn!(category = %category, port, error = %failure, cause = ?failure.cause, "enumeration failed");
                }
                console::error(&format!("Error during {category} enumeration: {}", failure.cause));
                failures.push(failure);
            }
        }
        Ok(())
    }

    /// Run one enumeration on its own task so a panic inside a handler is
    /// contained to that port.
    async fn dispatch(
        &self,
        request: EnumerationRequest,
    ) -> Result<Result<EnumerationResult, EnumerationFailed>, RunError> {
        let (category, port) = (request.category, request.port);
        let enumerator = Arc::clone(&self.parts.enumerator);
        let mut task = tokio::spawn(async move { enumerator.enumerate(request).await });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                task.abort();
                Err(RunError::Interrupted)
            }
            joined = &mut task => Ok(joined.unwrap_or_else(|e| {
                let message = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    e.to_string()
                };
                Err(EnumerationFailed::new(category, port, EnumerationCause::Unexpected(message)))
            })),
        }
    }

    async fn ask(&self, prompt: &str) -> Result<bool, RunError> {
        match self.cancellable(self.parts.prompter.confirm(prompt, true)).await? {
            Ok(answer) => Ok(answer),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(RunError::Interrupted),
            Err(e) => {
                warn!(error = %e, prompt, "confirmation prompt failed; treating as declined");
                console::warn("Could not read an answer, treating it as no");
                Ok(false)
            }
        }
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, RunError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunError::Interrupted),
            out = fut => Ok(out),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => format!("handler panicked: {s}"),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => format!("handler panicked: {s}"),
            Err(_) => "handler panicked".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        use Phase::*;
        assert!(Init.can_advance_to(DependencyCheck));
        assert!(PortScan.can_advance_to(ReportGeneration));
        assert!(Dispatch.can_advance_to(PerPortEnumeration));
        assert!(AwaitConfirmation.can_advance_to(Dispatch));
        assert!(PortScan.can_advance_to(Failed));
        assert!(!ReportGeneration.can_advance_to(PortScan));
        assert!(!Dispatch.can_advance_to(PortClassification));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Done));
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("boom")), "handler panicked: boom");
        assert_eq!(panic_message(Box::new(String::from("bad"))), "handler panicked: bad");
        assert_eq!(panic_message(Box::new(7u8)), "handler panicked");
    }
}
