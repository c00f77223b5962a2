use std::path::Path;

use anyhow::{Context, Result};
use csrbridge::{BridgeConfig, CsrError, CsrParameters, ModuleRegistry, Symbols};
use csrbridge_sim::SimGuest;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const CSR_PROBE_REPORT_SCHEMA_VERSION: &str = "csrbridge.probe.report@0.1.0";

pub const ENV_LOG: &str = "CSRBRIDGE_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeRequest {
    pub private_key: String,
    #[serde(default)]
    pub parameters: CsrParameters,
}

impl ProbeRequest {
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read request: {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse request JSON: {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&CsrError> for ProbeError {
    fn from(err: &CsrError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub schema_version: &'static str,
    pub core: usize,
    pub module: String,
    pub ok: bool,
    pub csr: Option<String>,
    pub guest_mallocs: usize,
    pub guest_frees: usize,
    pub guest_live_after: usize,
    pub error: Option<ProbeError>,
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Binds the reference guest on `core`, runs one generation, and tears down.
pub fn run_probe(
    cfg: &BridgeConfig,
    req: &ProbeRequest,
    core: usize,
    memory_pages: usize,
) -> Result<ProbeReport> {
    if core >= cfg.cores {
        anyhow::bail!(
            "cpu {core} out of range (configured cores: {}; set {} to raise it)",
            cfg.cores,
            csrbridge::ENV_CORES
        );
    }

    let symbols = Symbols::from_config(cfg);
    let registry = ModuleRegistry::from_config(cfg);
    let guest = SimGuest::with_symbols(memory_pages, &cfg.module, &symbols);
    let instance = registry
        .bind(core, guest, &cfg.module)
        .with_context(|| format!("bind module {:?} on cpu {core}", cfg.module))?;

    let report = {
        let mut session = instance.lock().context("lock csr module")?;
        let key = session
            .stage(req.private_key.as_bytes())
            .context("stage private key in guest memory")?;

        let outcome = session
            .generate(key, &req.parameters)
            .and_then(|out| session.take_output(out));
        let key_freed = session.free(key.ptr);
        // Same precedence as generate: the last free error wins.
        let outcome = match (outcome, key_freed) {
            (outcome, Ok(())) => outcome,
            (Ok(_), Err(free_err)) => {
                warn!("csr generated but private key free failed");
                Err(free_err)
            }
            (Err(prev), Err(free_err)) => {
                warn!(error = %prev, "superseded by private key free error");
                Err(free_err)
            }
        };

        let vm = session.vm();
        let mut report = ProbeReport {
            schema_version: CSR_PROBE_REPORT_SCHEMA_VERSION,
            core,
            module: session.module().to_string(),
            ok: false,
            csr: None,
            guest_mallocs: vm.mallocs().len(),
            guest_frees: vm.frees().len(),
            guest_live_after: vm.live_allocations(),
            error: None,
        };
        match outcome {
            Ok(csr) => {
                report.ok = true;
                report.csr = Some(String::from_utf8_lossy(csr.as_slice()).into_owned());
            }
            Err(err) => report.error = Some(ProbeError::from(&err)),
        }
        report
    };

    registry.unbind_all();
    info!(core, ok = report.ok, "probe finished");
    Ok(report)
}
