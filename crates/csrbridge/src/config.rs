use anyhow::{Context, Result};

pub const ENV_MODULE: &str = "CSRBRIDGE_MODULE";
pub const ENV_MALLOC_SYMBOL: &str = "CSRBRIDGE_MALLOC_SYMBOL";
pub const ENV_FREE_SYMBOL: &str = "CSRBRIDGE_FREE_SYMBOL";
pub const ENV_GENERATE_SYMBOL: &str = "CSRBRIDGE_GENERATE_SYMBOL";
pub const ENV_CORES: &str = "CSRBRIDGE_CORES";

pub const DEFAULT_MODULE: &str = "csr";
pub const DEFAULT_MALLOC_SYMBOL: &str = "csr_malloc";
pub const DEFAULT_FREE_SYMBOL: &str = "csr_free";
pub const DEFAULT_GENERATE_SYMBOL: &str = "csr_gen";

/// Names the bridge binds against and how many per-core slots it keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub module: String,
    pub malloc_symbol: String,
    pub free_symbol: String,
    pub generate_symbol: String,
    pub cores: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            module: DEFAULT_MODULE.to_string(),
            malloc_symbol: DEFAULT_MALLOC_SYMBOL.to_string(),
            free_symbol: DEFAULT_FREE_SYMBOL.to_string(),
            generate_symbol: DEFAULT_GENERATE_SYMBOL.to_string(),
            cores: online_cpus(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = BridgeConfig::default();

        for (name, slot) in [
            (ENV_MODULE, &mut cfg.module),
            (ENV_MALLOC_SYMBOL, &mut cfg.malloc_symbol),
            (ENV_FREE_SYMBOL, &mut cfg.free_symbol),
            (ENV_GENERATE_SYMBOL, &mut cfg.generate_symbol),
        ] {
            let Some(raw) = lookup(name) else {
                continue;
            };
            let value = raw.trim();
            if value.is_empty() {
                anyhow::bail!("invalid environment variable {name}={raw:?} (must not be empty)");
            }
            *slot = value.to_string();
        }

        if let Some(raw) = lookup(ENV_CORES) {
            cfg.cores = parse_cores(&raw)
                .with_context(|| format!("invalid environment variable {ENV_CORES}={raw:?}"))?;
        }

        Ok(cfg)
    }
}

fn parse_cores(raw: &str) -> Result<usize> {
    let n: usize = raw.trim().parse().context("expected a positive integer")?;
    if n == 0 {
        anyhow::bail!("core count must be at least 1");
    }
    Ok(n)
}

/// Number of online processors, falling back to the std estimate and then 1.
pub fn online_cpus() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name constant has no memory-safety preconditions.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            return n as usize;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
