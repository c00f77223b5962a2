use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use csrbridge::{current_core, BridgeConfig};
use csrbridge_probe::{init_logging, run_probe, ProbeRequest};

#[derive(Parser)]
#[command(name = "csrbridge-probe")]
#[command(about = "Run one CSR generation through the guest bridge against the reference guest.", long_about = None)]
struct Cli {
    /// JSON request: {"private_key": "...", "parameters": {"subject": "...", ...}}.
    #[arg(long, value_name = "PATH")]
    request: PathBuf,

    /// Core whose module slot is used (defaults to the current CPU).
    #[arg(long, value_name = "N")]
    core: Option<usize>,

    /// Linear memory size of the reference guest, in 64 KiB pages.
    #[arg(long, value_name = "N", default_value_t = 1)]
    memory_pages: usize,
}

fn main() -> ExitCode {
    init_logging();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("csrbridge-probe: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = BridgeConfig::from_env()?;
    let req = ProbeRequest::from_path(&cli.request)?;
    let core = cli.core.unwrap_or_else(current_core);

    let report = run_probe(&cfg, &req, core, cli.memory_pages)?;
    let json = serde_json::to_string_pretty(&report).context("serialize probe report")?;
    println!("{json}");

    Ok(if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
