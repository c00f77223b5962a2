//! In-process reference guest for the CSR bridge.
//!
//! `SimGuest` implements [`csrbridge::GuestVm`] over a plain byte vector. It
//! exports the allocate/free/generate trio, keeps a first-fit heap that
//! rejects double frees, journals every host-initiated call, and can be told
//! to fail specific calls.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use csrbridge::{encode_packed, GuestSlice, GuestVm, Symbols, DEFAULT_MODULE};
use sha2::{Digest, Sha256};

pub const PAGE_SIZE: usize = 64 * 1024;

/// Low memory below this address is never handed out.
pub const HEAP_BASE: u32 = 1024;

const ALIGN: u32 = 8;
const GENERATE_ARITY: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFunction {
    Malloc,
    Free,
    Generate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Malloc { size: u32, ptr: Option<u32> },
    Free { ptr: u32, ok: bool },
    Generate { args: Vec<i32> },
}

#[derive(Debug, Default, Clone)]
struct Faults {
    malloc_calls: BTreeSet<usize>,
    malloc_sentinels: BTreeMap<usize, u32>,
    free_ptrs: BTreeSet<u32>,
    free_calls: BTreeSet<usize>,
    generate: Option<String>,
    generate_raw: Option<i64>,
}

#[derive(Debug)]
pub struct SimGuest {
    module: String,
    exports: BTreeMap<String, SimFunction>,
    memory: Vec<u8>,
    live: BTreeMap<u32, u32>,
    faults: Faults,
    journal: Vec<SimCall>,
    malloc_calls: usize,
    free_calls: usize,
    last_error: Option<String>,
}

impl SimGuest {
    pub fn new(pages: usize) -> Self {
        Self::with_symbols(pages, DEFAULT_MODULE, &Symbols::default())
    }

    pub fn with_symbols(pages: usize, module: &str, symbols: &Symbols) -> Self {
        let mut exports = BTreeMap::new();
        exports.insert(symbols.malloc.clone(), SimFunction::Malloc);
        exports.insert(symbols.free.clone(), SimFunction::Free);
        exports.insert(symbols.generate.clone(), SimFunction::Generate);
        Self {
            module: module.to_string(),
            exports,
            memory: vec![0; pages.max(1) * PAGE_SIZE],
            live: BTreeMap::new(),
            faults: Faults::default(),
            journal: Vec::new(),
            malloc_calls: 0,
            free_calls: 0,
            last_error: None,
        }
    }

    pub fn without_export(mut self, symbol: &str) -> Self {
        self.exports.remove(symbol);
        self
    }

    /// The `n`th host malloc call (0-based) fails.
    pub fn fail_malloc_call(mut self, n: usize) -> Self {
        self.faults.malloc_calls.insert(n);
        self
    }

    /// The `n`th host malloc call returns `ptr` without allocating anything.
    /// Freeing `ptr` afterwards succeeds.
    pub fn malloc_returns_on_call(mut self, n: usize, ptr: u32) -> Self {
        self.faults.malloc_sentinels.insert(n, ptr);
        self
    }

    /// Every free of `ptr` fails and leaves it allocated.
    pub fn fail_free_of(mut self, ptr: u32) -> Self {
        self.faults.free_ptrs.insert(ptr);
        self
    }

    /// The `n`th free call (0-based) fails and leaves its pointer allocated.
    pub fn fail_free_call(mut self, n: usize) -> Self {
        self.faults.free_calls.insert(n);
        self
    }

    pub fn fail_generate(mut self, reason: impl Into<String>) -> Self {
        self.faults.generate = Some(reason.into());
        self
    }

    /// Generate returns `raw` verbatim instead of producing a CSR.
    pub fn generate_returns(mut self, raw: i64) -> Self {
        self.faults.generate_raw = Some(raw);
        self
    }

    /// Places `bytes` in guest memory without journaling a host malloc.
    pub fn preload(&mut self, bytes: &[u8]) -> Option<GuestSlice> {
        let len = u32::try_from(bytes.len()).ok()?;
        let ptr = self.heap_alloc(len)?;
        let start = ptr as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
        Some(GuestSlice::new(ptr, len))
    }

    pub fn journal(&self) -> &[SimCall] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    /// Pointers returned by successful host malloc calls, in call order.
    pub fn mallocs(&self) -> Vec<u32> {
        self.journal
            .iter()
            .filter_map(|c| match c {
                SimCall::Malloc { ptr: Some(ptr), .. } => Some(*ptr),
                _ => None,
            })
            .collect()
    }

    /// Pointers passed to free, in call order.
    pub fn frees(&self) -> Vec<u32> {
        self.journal
            .iter()
            .filter_map(|c| match c {
                SimCall::Free { ptr, .. } => Some(*ptr),
                _ => None,
            })
            .collect()
    }

    pub fn generate_args(&self) -> Option<&[i32]> {
        self.journal.iter().rev().find_map(|c| match c {
            SimCall::Generate { args } => Some(args.as_slice()),
            _ => None,
        })
    }

    pub fn is_live(&self, ptr: u32) -> bool {
        self.live.contains_key(&ptr)
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    fn heap_alloc(&mut self, size: u32) -> Option<u32> {
        let size = align_up(size.max(1))?;
        let mut cursor = HEAP_BASE;
        for (&ptr, &len) in &self.live {
            if ptr.checked_sub(cursor)? >= size {
                break;
            }
            cursor = align_up(ptr.checked_add(len)?)?;
        }
        let end = cursor.checked_add(size)?;
        if end as usize > self.memory.len() {
            return None;
        }
        self.live.insert(cursor, size);
        Some(cursor)
    }

    fn heap_free(&mut self, ptr: u32) -> Result<(), String> {
        match self.live.remove(&ptr) {
            Some(_) => Ok(()),
            None => Err(format!("free of unallocated pointer {ptr:#x}")),
        }
    }

    fn malloc(&mut self, args: &[i32]) -> Result<i64, String> {
        let [size] = args else {
            return Err(format!("malloc expects 1 argument, got {}", args.len()));
        };
        let size = *size as u32;
        let call = self.malloc_calls;
        self.malloc_calls += 1;

        let ptr = if self.faults.malloc_calls.contains(&call) {
            None
        } else if let Some(&ptr) = self.faults.malloc_sentinels.get(&call) {
            Some(ptr)
        } else {
            self.heap_alloc(size)
        };
        self.journal.push(SimCall::Malloc { size, ptr });
        match ptr {
            Some(ptr) => Ok(i64::from(ptr)),
            None => Err(format!("out of guest memory allocating {size} bytes")),
        }
    }

    fn free(&mut self, args: &[i32]) -> Result<i64, String> {
        let [ptr] = args else {
            return Err(format!("free expects 1 argument, got {}", args.len()));
        };
        let ptr = *ptr as u32;
        let call = self.free_calls;
        self.free_calls += 1;

        let res = if self.faults.free_ptrs.contains(&ptr) || self.faults.free_calls.contains(&call)
        {
            Err(format!("injected free failure at {ptr:#x}"))
        } else if self.faults.malloc_sentinels.values().any(|&p| p == ptr) {
            Ok(())
        } else {
            self.heap_free(ptr)
        };
        self.journal.push(SimCall::Free {
            ptr,
            ok: res.is_ok(),
        });
        res.map(|()| 0)
    }

    fn generate(&mut self, args: &[i32]) -> Result<i64, String> {
        self.journal.push(SimCall::Generate {
            args: args.to_vec(),
        });
        if args.len() != GENERATE_ARITY {
            return Err(format!(
                "generate expects {GENERATE_ARITY} arguments, got {}",
                args.len()
            ));
        }
        if let Some(reason) = &self.faults.generate {
            return Err(reason.clone());
        }
        if let Some(raw) = self.faults.generate_raw {
            return Ok(raw);
        }

        let key = self.slice_arg(args[0], args[1])?;
        if key.is_empty() {
            return Ok(0);
        }
        let digest = Sha256::digest(key);

        let mut csr = String::from("-----BEGIN CERTIFICATE REQUEST-----\n");
        csr.push_str("key-sha256: ");
        for b in digest.iter() {
            let _ = write!(csr, "{b:02x}");
        }
        csr.push('\n');
        for (i, name) in ["subject", "dns", "uri", "email", "ip"].iter().enumerate() {
            let value = self.slice_arg(args[2 + 2 * i], args[3 + 2 * i])?;
            if value.is_empty() {
                continue;
            }
            let _ = writeln!(csr, "{name}: {}", String::from_utf8_lossy(value));
        }
        csr.push_str("-----END CERTIFICATE REQUEST-----\n");

        let len = csr.len() as u32;
        let Some(ptr) = self.heap_alloc(len) else {
            return Ok(0);
        };
        let start = ptr as usize;
        self.memory[start..start + csr.len()].copy_from_slice(csr.as_bytes());
        Ok(encode_packed(ptr, len) as i64)
    }

    fn slice_arg(&self, ptr: i32, len: i32) -> Result<&[u8], String> {
        let (ptr, len) = (ptr as u32 as usize, len as u32 as usize);
        if len == 0 {
            return Ok(&[]);
        }
        self.memory
            .get(ptr..ptr + len)
            .ok_or_else(|| format!("out of bounds memory access at {ptr:#x}+{len}"))
    }
}

fn align_up(n: u32) -> Option<u32> {
    Some(n.checked_add(ALIGN - 1)? & !(ALIGN - 1))
}

impl GuestVm for SimGuest {
    type Function = SimFunction;

    fn get_function(&self, module: &str, symbol: &str) -> Result<SimFunction, String> {
        if module != self.module {
            return Err(format!("module {module:?} not loaded"));
        }
        self.exports
            .get(symbol)
            .copied()
            .ok_or_else(|| format!("function {symbol:?} not found in module {module:?}"))
    }

    fn call(&mut self, function: &SimFunction, args: &[i32]) -> Result<i64, String> {
        let res = match function {
            SimFunction::Malloc => self.malloc(args),
            SimFunction::Free => self.free(args),
            SimFunction::Generate => self.generate(args),
        };
        if let Err(err) = &res {
            self.last_error = Some(err.clone());
        }
        res
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_reuses_freed_gaps_first_fit() {
        let mut g = SimGuest::new(1);
        let a = g.heap_alloc(16).unwrap();
        let b = g.heap_alloc(16).unwrap();
        let c = g.heap_alloc(16).unwrap();
        assert_eq!(a, HEAP_BASE);
        assert!(a < b && b < c);
        g.heap_free(b).unwrap();
        assert_eq!(g.heap_alloc(8).unwrap(), b);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut g = SimGuest::new(1);
        let p = g.heap_alloc(4).unwrap();
        g.heap_free(p).unwrap();
        assert!(g.heap_free(p).is_err());
    }

    #[test]
    fn heap_exhaustion_returns_none() {
        let mut g = SimGuest::new(1);
        assert!(g.heap_alloc(PAGE_SIZE as u32).is_none());
    }

    #[test]
    fn lookup_reports_missing_module_and_symbol() {
        let g = SimGuest::new(1).without_export("csr_gen");
        assert_eq!(g.get_function("csr", "csr_malloc"), Ok(SimFunction::Malloc));
        assert!(g.get_function("csr", "csr_gen").is_err());
        assert!(g.get_function("other", "csr_malloc").is_err());
    }

    #[test]
    fn generate_writes_text_csr() {
        let mut g = SimGuest::new(1);
        let key = g.preload(b"private key").unwrap();
        let subject = g.preload(b"CN=test").unwrap();
        let mut args = vec![key.ptr as i32, key.len as i32];
        args.extend_from_slice(&[subject.ptr as i32, subject.len as i32]);
        args.extend_from_slice(&[0; 8]);

        let raw = g.call(&SimFunction::Generate, &args).unwrap() as u64;
        let out = csrbridge::decode_packed(raw).unwrap();
        let text = &g.memory()[out.ptr as usize..(out.ptr + out.len) as usize];
        let text = std::str::from_utf8(text).unwrap();
        assert!(text.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(text.contains("subject: CN=test\n"));
        assert!(!text.contains("dns:"));
    }

    #[test]
    fn generate_with_empty_key_returns_zero() {
        let mut g = SimGuest::new(1);
        let raw = g.call(&SimFunction::Generate, &[0; 12]).unwrap();
        assert_eq!(raw, 0);
    }
}
