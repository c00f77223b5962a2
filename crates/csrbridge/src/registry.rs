//! Per-core CSR module instances.
//!
//! A [`ModuleRegistry`] keeps at most one [`ModuleInstance`] per processor
//! core. Instances are created by [`ModuleRegistry::bind`], re-bound in place
//! on later loads, and torn down on bind failure or [`ModuleRegistry::unbind_all`].

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, error};

use crate::{BridgeConfig, CsrError, CsrSession, GuestVm};

/// Guest symbol names the bridge resolves at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbols {
    pub malloc: String,
    pub free: String,
    pub generate: String,
}

impl Symbols {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self {
            malloc: cfg.malloc_symbol.clone(),
            free: cfg.free_symbol.clone(),
            generate: cfg.generate_symbol.clone(),
        }
    }
}

impl Default for Symbols {
    fn default() -> Self {
        Symbols::from_config(&BridgeConfig::default())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CsrFunctions<F> {
    pub(crate) malloc: F,
    pub(crate) free: F,
    pub(crate) generate: F,
}

pub(crate) struct InstanceState<V: GuestVm> {
    pub(crate) vm: V,
    pub(crate) module: String,
    pub(crate) functions: Option<CsrFunctions<V::Function>>,
}

/// The CSR module bound for one processor core.
///
/// The inner mutex is the coarse VM lock: every guest call and every touch of
/// guest linear memory happens through a [`CsrSession`] holding it.
pub struct ModuleInstance<V: GuestVm> {
    core: usize,
    symbols: Symbols,
    state: Mutex<InstanceState<V>>,
}

impl<V: GuestVm> ModuleInstance<V> {
    fn new(core: usize, symbols: Symbols, vm: V, module: &str) -> Self {
        Self {
            core,
            symbols,
            state: Mutex::new(InstanceState {
                vm,
                module: module.to_string(),
                functions: None,
            }),
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    /// Acquires the VM lock. The lock is released when the session is dropped.
    pub fn lock(&self) -> Result<CsrSession<'_, V>, CsrError> {
        let state = self.lock_state()?;
        if state.functions.is_none() {
            return Err(CsrError::NotBound { core: self.core });
        }
        Ok(CsrSession::new(self.core, &self.symbols, state))
    }

    /// True while all three guest functions are resolved.
    pub fn is_bound(&self) -> bool {
        self.lock_state()
            .map(|state| state.functions.is_some())
            .unwrap_or(false)
    }

    /// Name of the guest module the function handles were resolved from.
    pub fn module(&self) -> Result<String, CsrError> {
        Ok(self.lock_state()?.module.clone())
    }

    #[cfg(test)]
    pub(crate) fn functions(&self) -> Result<Option<CsrFunctions<V::Function>>, CsrError> {
        Ok(self.lock_state()?.functions.clone())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, InstanceState<V>>, CsrError> {
        self.state
            .lock()
            .map_err(|_| CsrError::LockPoisoned { core: self.core })
    }

    /// Drops the function handles; later locks report [`CsrError::NotBound`].
    fn invalidate(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.functions = None;
    }

    fn rebind(&self, vm: Option<V>, module: &str) -> Result<(), CsrError> {
        let mut state = self.lock_state()?;
        if let Some(vm) = vm {
            state.vm = vm;
        }
        state.module = module.to_string();
        match resolve_functions(&state.vm, module, &self.symbols) {
            Ok(functions) => {
                state.functions = Some(functions);
                Ok(())
            }
            Err(err) => {
                state.functions = None;
                Err(err)
            }
        }
    }
}

impl<V: GuestVm> std::fmt::Debug for ModuleInstance<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("core", &self.core)
            .field("symbols", &self.symbols)
            .finish_non_exhaustive()
    }
}

fn resolve_functions<V: GuestVm>(
    vm: &V,
    module: &str,
    symbols: &Symbols,
) -> Result<CsrFunctions<V::Function>, CsrError> {
    // All three lookups run even if an earlier one fails so the error names
    // every missing export at once.
    let generate = vm.get_function(module, &symbols.generate);
    let malloc = vm.get_function(module, &symbols.malloc);
    let free = vm.get_function(module, &symbols.free);

    let mut unresolved = Vec::new();
    let mut reasons = Vec::new();
    for (symbol, res) in [
        (&symbols.generate, generate.as_ref().err()),
        (&symbols.malloc, malloc.as_ref().err()),
        (&symbols.free, free.as_ref().err()),
    ] {
        if let Some(reason) = res {
            unresolved.push(symbol.clone());
            reasons.push(format!("{symbol}: {reason}"));
        }
    }

    match (generate, malloc, free) {
        (Ok(generate), Ok(malloc), Ok(free)) => Ok(CsrFunctions {
            malloc,
            free,
            generate,
        }),
        _ => {
            error!(
                module,
                unresolved = ?unresolved,
                last_error = ?vm.last_error(),
                "csr module function lookups failed: {}",
                reasons.join("; ")
            );
            Err(CsrError::Binding {
                module: module.to_string(),
                unresolved,
                reason: reasons.join("; "),
            })
        }
    }
}

/// Returns the processor the calling thread is running on.
pub fn current_core() -> usize {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getcpu takes no arguments and only reads the calling thread's CPU.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return cpu as usize;
        }
    }
    0
}

type Slot<V> = Option<Arc<ModuleInstance<V>>>;

/// One slot per processor core.
///
/// Lookups take a shared lock on the slot table; `bind` and `unbind_all` take
/// it exclusively only to swap slot contents, never across a VM lock.
/// Hot-plugging cores needs a new registry sized for them.
pub struct ModuleRegistry<V: GuestVm> {
    symbols: Symbols,
    slots: RwLock<Vec<Slot<V>>>,
}

impl<V: GuestVm> ModuleRegistry<V> {
    pub fn new(cores: usize) -> Self {
        Self::with_symbols(cores, Symbols::default())
    }

    pub fn with_symbols(cores: usize, symbols: Symbols) -> Self {
        let mut slots = Vec::with_capacity(cores);
        slots.resize_with(cores, || None);
        Self {
            symbols,
            slots: RwLock::new(slots),
        }
    }

    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::with_symbols(cfg.cores, Symbols::from_config(cfg))
    }

    pub fn cores(&self) -> usize {
        self.read_slots().len()
    }

    pub fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    pub fn instance(&self, core: usize) -> Option<Arc<ModuleInstance<V>>> {
        self.read_slots().get(core).and_then(|slot| slot.clone())
    }

    /// Instance for the core the caller is running on, if one is bound.
    pub fn current_core_instance(&self) -> Option<Arc<ModuleInstance<V>>> {
        self.instance(current_core())
    }

    /// Binds `module` on `vm` for `core`.
    ///
    /// An existing instance is re-bound in place and adopts `vm`; readers that
    /// already hold it keep the same `Arc`. If any of the three functions
    /// cannot be resolved the instance is torn down and the slot cleared.
    ///
    /// The slot table is never locked while waiting on an instance's VM lock,
    /// so a rebind queued behind a running request does not stall lookups.
    pub fn bind(
        &self,
        core: usize,
        vm: V,
        module: &str,
    ) -> Result<Arc<ModuleInstance<V>>, CsrError> {
        let existing = {
            let slots = self.read_slots();
            let cores = slots.len();
            match slots.get(core) {
                Some(slot) => slot.clone(),
                None => {
                    return Err(CsrError::Binding {
                        module: module.to_string(),
                        unresolved: Vec::new(),
                        reason: format!("cpu {core} out of range (registry has {cores} slots)"),
                    })
                }
            }
        };

        match existing {
            Some(instance) => {
                if let Err(err) = instance.rebind(Some(vm), module) {
                    self.clear_slot(core, &instance);
                    return Err(err);
                }
                debug!(core, module, "csr module re-bound");
                Ok(instance)
            }
            None => {
                // Nobody else can see the fresh instance until it is fully bound.
                let fresh = Arc::new(ModuleInstance::new(core, self.symbols.clone(), vm, module));
                fresh.rebind(None, module)?;
                let previous = self
                    .write_slots()
                    .get_mut(core)
                    .and_then(|slot| slot.replace(Arc::clone(&fresh)));
                if let Some(previous) = previous {
                    // A concurrent bind filled the slot first; ours replaces it.
                    debug!(core, "replacing instance bound concurrently");
                    previous.invalidate();
                }
                debug!(core, module, "csr module bound");
                Ok(fresh)
            }
        }
    }

    /// Tears down every bound instance. Returns how many slots were cleared.
    ///
    /// Meant for shutdown only: requests in flight keep their `Arc` but will
    /// see the instance as unbound on their next lock.
    pub fn unbind_all(&self) -> usize {
        let taken: Vec<_> = self
            .write_slots()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for instance in &taken {
            instance.invalidate();
        }
        taken.len()
    }

    /// Empties `core`'s slot if it still holds `instance`.
    fn clear_slot(&self, core: usize, instance: &Arc<ModuleInstance<V>>) {
        let mut slots = self.write_slots();
        if let Some(slot) = slots.get_mut(core) {
            if slot.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, instance)) {
                *slot = None;
            }
        }
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, Vec<Slot<V>>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Slot<V>>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct StubVm {
        exports: BTreeSet<&'static str>,
        memory: Vec<u8>,
    }

    impl StubVm {
        fn with(exports: &[&'static str]) -> Self {
            Self {
                exports: exports.iter().copied().collect(),
                memory: vec![0; 64],
            }
        }

        fn full() -> Self {
            Self::with(&["csr_malloc", "csr_free", "csr_gen"])
        }
    }

    impl GuestVm for StubVm {
        type Function = String;

        fn get_function(&self, module: &str, symbol: &str) -> Result<String, String> {
            if self.exports.contains(symbol) {
                Ok(format!("{module}.{symbol}"))
            } else {
                Err("function not found".to_string())
            }
        }

        fn call(&mut self, _function: &String, _args: &[i32]) -> Result<i64, String> {
            Ok(0)
        }

        fn memory(&self) -> &[u8] {
            &self.memory
        }

        fn memory_mut(&mut self) -> &mut [u8] {
            &mut self.memory
        }
    }

    #[test]
    fn empty_registry_has_no_instances() {
        let reg: ModuleRegistry<StubVm> = ModuleRegistry::new(2);
        assert_eq!(reg.cores(), 2);
        assert!(reg.instance(0).is_none());
        assert!(reg.instance(1).is_none());
        assert!(reg.instance(7).is_none());
    }

    #[test]
    fn bind_is_idempotent_and_keeps_identity() {
        let reg = ModuleRegistry::new(1);
        let first = reg.bind(0, StubVm::full(), "csr").unwrap();
        let before = first.functions().unwrap().unwrap();
        let second = reg.bind(0, StubVm::full(), "csr").unwrap();
        let after = second.functions().unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(before.malloc, after.malloc);
        assert_eq!(before.free, after.free);
        assert_eq!(before.generate, after.generate);
    }

    #[test]
    fn rebind_against_new_module_updates_handles() {
        let reg = ModuleRegistry::new(1);
        let inst = reg.bind(0, StubVm::full(), "csr").unwrap();
        reg.bind(0, StubVm::full(), "csr_v2").unwrap();
        assert_eq!(inst.module().unwrap(), "csr_v2");
        assert_eq!(inst.functions().unwrap().unwrap().generate, "csr_v2.csr_gen");
    }

    #[test]
    fn failed_bind_leaves_slot_empty_and_names_all_missing() {
        let reg = ModuleRegistry::new(1);
        let err = reg
            .bind(0, StubVm::with(&["csr_free"]), "csr")
            .unwrap_err();
        match err {
            CsrError::Binding { unresolved, .. } => {
                assert_eq!(unresolved, vec!["csr_gen".to_string(), "csr_malloc".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(reg.instance(0).is_none());
    }

    #[test]
    fn failed_rebind_tears_down_existing_instance() {
        let reg = ModuleRegistry::new(1);
        let held = reg.bind(0, StubVm::full(), "csr").unwrap();
        assert!(reg.bind(0, StubVm::with(&[]), "csr").is_err());
        assert!(reg.instance(0).is_none());
        assert!(!held.is_bound());
        assert_eq!(
            held.lock().err(),
            Some(CsrError::NotBound { core: 0 })
        );
    }

    #[test]
    fn bind_out_of_range_core_fails() {
        let reg = ModuleRegistry::new(1);
        let err = reg.bind(3, StubVm::full(), "csr").unwrap_err();
        assert_eq!(err.kind(), "binding");
    }

    #[test]
    fn unbind_all_clears_every_slot() {
        let reg = ModuleRegistry::new(3);
        reg.bind(0, StubVm::full(), "csr").unwrap();
        reg.bind(2, StubVm::full(), "csr").unwrap();
        assert_eq!(reg.unbind_all(), 2);
        assert!((0..3).all(|core| reg.instance(core).is_none()));
        assert_eq!(reg.unbind_all(), 0);
    }

    #[test]
    fn clearing_a_stale_instance_keeps_the_current_one() {
        let reg = ModuleRegistry::new(1);
        let stale = reg.bind(0, StubVm::full(), "csr").unwrap();
        reg.unbind_all();
        let current = reg.bind(0, StubVm::full(), "csr").unwrap();

        reg.clear_slot(0, &stale);
        let slot = reg.instance(0).unwrap();
        assert!(Arc::ptr_eq(&slot, &current));
    }

    #[test]
    fn custom_symbols_are_resolved() {
        let symbols = Symbols {
            malloc: "alloc".to_string(),
            free: "dealloc".to_string(),
            generate: "gen".to_string(),
        };
        let reg = ModuleRegistry::with_symbols(1, symbols);
        let inst = reg
            .bind(0, StubVm::with(&["alloc", "dealloc", "gen"]), "m")
            .unwrap();
        assert_eq!(inst.functions().unwrap().unwrap().malloc, "m.alloc");
    }
}
