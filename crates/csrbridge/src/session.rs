use std::sync::MutexGuard;

use tracing::{trace, warn};

use crate::buffer::GrowableBuffer;
use crate::guest::{guest_bytes, guest_bytes_mut, is_sentinel};
use crate::registry::{CsrFunctions, InstanceState, Symbols};
use crate::{CsrError, CsrOutput, GuestSlice, GuestVm};

/// Exclusive access to one core's guest VM.
///
/// Holding a session is holding the VM lock; dropping it unlocks. All guest
/// calls and guest memory access go through here.
pub struct CsrSession<'a, V: GuestVm> {
    core: usize,
    symbols: &'a Symbols,
    state: MutexGuard<'a, InstanceState<V>>,
}

impl<'a, V: GuestVm> CsrSession<'a, V> {
    pub(crate) fn new(
        core: usize,
        symbols: &'a Symbols,
        state: MutexGuard<'a, InstanceState<V>>,
    ) -> Self {
        Self {
            core,
            symbols,
            state,
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn module(&self) -> &str {
        &self.state.module
    }

    pub fn vm(&self) -> &V {
        &self.state.vm
    }

    pub fn vm_mut(&mut self) -> &mut V {
        &mut self.state.vm
    }

    pub(crate) fn symbols(&self) -> &Symbols {
        self.symbols
    }

    fn functions(&self) -> Result<&CsrFunctions<V::Function>, CsrError> {
        self.state
            .functions
            .as_ref()
            .ok_or(CsrError::NotBound { core: self.core })
    }

    pub(crate) fn call_malloc(&mut self, size: u32) -> Result<u32, String> {
        let func = self.functions().map_err(|e| e.to_string())?.malloc.clone();
        let ret = self.state.vm.call(&func, &[size as i32])?;
        Ok(ret as u32)
    }

    pub(crate) fn call_free(&mut self, ptr: u32) -> Result<(), String> {
        let func = self.functions().map_err(|e| e.to_string())?.free.clone();
        self.state.vm.call(&func, &[ptr as i32])?;
        trace!(ptr, "guest free");
        Ok(())
    }

    pub(crate) fn call_generate(&mut self, args: &[i32]) -> Result<i64, String> {
        let func = self.functions().map_err(|e| e.to_string())?.generate.clone();
        self.state.vm.call(&func, args)
    }

    /// Allocates `size` bytes in guest memory.
    pub fn malloc(&mut self, size: u32) -> Result<u32, CsrError> {
        self.call_malloc(size)
            .map_err(|reason| CsrError::allocation(self.symbols.malloc.clone(), reason))
    }

    /// Releases a pointer previously returned by [`Self::malloc`].
    pub fn free(&mut self, ptr: u32) -> Result<(), CsrError> {
        self.call_free(ptr)
            .map_err(|reason| CsrError::Free { ptr, reason })
    }

    pub(crate) fn write(&mut self, slice: GuestSlice, bytes: &[u8]) -> Result<(), CsrError> {
        let dst = guest_bytes_mut(self.state.vm.memory_mut(), slice).ok_or(CsrError::Memory {
            ptr: slice.ptr,
            len: slice.len,
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Copies `bytes` into freshly allocated guest memory.
    ///
    /// The allocation is released again if the copy fails, so the caller owns
    /// the returned range only on success. A failed release is returned in
    /// place of the copy error, matching [`Self::generate`].
    pub fn stage(&mut self, bytes: &[u8]) -> Result<GuestSlice, CsrError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CsrError::allocation("staging", "input larger than guest address space"))?;
        let ptr = self
            .call_malloc(len)
            .map_err(|reason| CsrError::allocation("staging", reason))?;
        let slice = GuestSlice::new(ptr, len);
        if let Err(err) = self.write(slice, bytes) {
            if !is_sentinel(ptr) {
                if let Err(free_err) = self.free(ptr) {
                    warn!(error = %err, ptr, "staging copy failed and the allocation leaked");
                    return Err(free_err);
                }
            }
            return Err(err);
        }
        Ok(slice)
    }

    /// Copies a guest memory range into a host buffer.
    pub fn read(&self, slice: GuestSlice) -> Result<GrowableBuffer, CsrError> {
        let src = guest_bytes(self.state.vm.memory(), slice).ok_or(CsrError::Memory {
            ptr: slice.ptr,
            len: slice.len,
        })?;
        let mut buf = GrowableBuffer::new(src.len())?;
        buf.extend_from_slice(src)?;
        Ok(buf)
    }

    /// Copies the generated CSR out of guest memory and frees it there.
    ///
    /// The guest pointer is freed even when the copy fails. A failed free
    /// wins over the copy result, which is logged.
    pub fn take_output(&mut self, output: CsrOutput) -> Result<GrowableBuffer, CsrError> {
        let copied = self.read(output.slice());
        if is_sentinel(output.ptr) {
            return copied;
        }
        match (self.free(output.ptr), copied) {
            (Ok(()), copied) => copied,
            (Err(free_err), Ok(buf)) => {
                warn!(len = buf.len(), "csr copied out but guest free failed");
                Err(free_err)
            }
            (Err(free_err), Err(prev)) => {
                warn!(error = %prev, "superseded by guest free error");
                Err(free_err)
            }
        }
    }
}
