//! Host-side bridge to a per-core guest CSR generator.
//!
//! The host binds one [`ModuleInstance`] per processor core, locks it for the
//! duration of a request, and marshals optional string parameters into guest
//! linear memory for a single fixed-arity generate call. Guest memory has no
//! collector, so every allocation made for a request is freed before the
//! request returns.

mod buffer;
mod config;
mod csr;
mod error;
mod guest;
mod registry;
mod session;

pub use buffer::GrowableBuffer;
pub use config::{
    online_cpus, BridgeConfig, DEFAULT_FREE_SYMBOL, DEFAULT_GENERATE_SYMBOL,
    DEFAULT_MALLOC_SYMBOL, DEFAULT_MODULE, ENV_CORES, ENV_FREE_SYMBOL, ENV_GENERATE_SYMBOL,
    ENV_MALLOC_SYMBOL, ENV_MODULE,
};
pub use csr::{decode_packed, encode_packed, CsrField, CsrOutput, CsrParameters, CsrResult};
pub use error::CsrError;
pub use guest::{is_sentinel, GuestSlice, GuestVm};
pub use registry::{current_core, ModuleInstance, ModuleRegistry, Symbols};
pub use session::CsrSession;
