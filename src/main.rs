use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use recon_rs::config::Settings;
use recon_rs::console;
use recon_rs::enumerate::ServiceEnumerator;
use recon_rs::error::RunError;
use recon_rs::logging;
use recon_rs::orchestrator::{AutoConfirm, Collaborators, Orchestrator, Prompter, RunOptions, TerminalPrompter};
use recon_rs::ports::PortRange;
use recon_rs::report::FileReportRenderer;
use recon_rs::tools::{NmapScanner, ToolCatalog, NMAP};
use recon_rs::types::Target;

/// Command line of the recon-rs binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "recon-rs",
    version,
    about = "Automated reconnaissance & enumeration toolkit for authorized security testing and CTFs.",
    after_help = "Examples:\n  recon-rs -t 192.168.1.100\n  recon-rs -t example.com -o ./my_reports\n  recon-rs -t 10.10.10.50 --no-confirm\n  recon-rs -t scanme.nmap.org --quick\n  recon-rs -t 192.168.1.100 --ports 1-10000 -v\n\nLegal notice:\n  Only use on systems you own or have explicit permission to test."
)]
struct Cli {
    /// Target IP address or hostname.
    #[arg(short = 't', long)]
    target: Target,

    /// Report output directory (created if absent). Defaults to the configured `output_dir`.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Skip confirmation prompts and run every enumeration.
    #[arg(long = "no-confirm", default_value_t = false)]
    no_confirm: bool,

    /// Port scan and report only; no service enumeration.
    #[arg(long, default_value_t = false)]
    quick: bool,

    /// Port range handed to the scanner, e.g. "1-10000" or "22,80,8000-8100".
    #[arg(long)]
    ports: Option<PortRange>,

    /// Verbose diagnostics on stderr.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Settings file. Defaults to ./recon.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[!] Fatal error: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = logging::init(&settings.logging, cli.verbose) {
        eprintln!("[!] Fatal error: {e:#}");
        return ExitCode::from(1);
    }

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[!] Fatal error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    let code = rt.block_on(run(cli, settings));
    // A pending terminal prompt must not hold the process open.
    rt.shutdown_timeout(Duration::from_millis(100));
    code
}

async fn run(cli: Cli, settings: Settings) -> ExitCode {
    let options = match run_options(&cli, &settings) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[!] Fatal error: {e:#}");
            return ExitCode::from(1);
        }
    };
    debug!(?options, "run options");

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let catalog = ToolCatalog::detect(&settings.tools);
    let nmap = catalog.nmap.clone().unwrap_or_else(|| PathBuf::from(NMAP));
    let prompter: Box<dyn Prompter> = if options.confirm {
        Box::new(TerminalPrompter)
    } else {
        Box::new(AutoConfirm)
    };
    let parts = Collaborators {
        checker: Box::new(catalog.clone()),
        scanner: Box::new(NmapScanner::new(nmap, &settings.scan)),
        enumerator: Arc::new(ServiceEnumerator::new(catalog, &settings)),
        prompter,
        renderer: Box::new(FileReportRenderer::default()),
    };

    console::banner();
    let mut orchestrator = Orchestrator::new(&settings, options, parts, cancel);
    match orchestrator.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            if matches!(e, RunError::Interrupted) {
                println!("\n\n[!] Scan interrupted by user");
            } else {
                error!(error = ?e, "fatal");
                println!("\n[!] Fatal error: {e}");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn run_options(cli: &Cli, settings: &Settings) -> Result<RunOptions> {
    let port_range = match &cli.ports {
        Some(range) => Some(range.clone()),
        None => settings
            .scan
            .port_range
            .as_deref()
            .map(str::parse::<PortRange>)
            .transpose()
            .context("invalid scan.port_range")?,
    };
    Ok(RunOptions {
        target: cli.target.clone(),
        output_dir: cli.output.clone().unwrap_or_else(|| settings.output_dir.clone()),
        port_range,
        confirm: settings.confirmation_mode && !cli.no_confirm,
        quick: cli.quick,
    })
}
