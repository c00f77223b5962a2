use std::fmt;

/// A guest virtual machine hosting the CSR module for one processor core.
///
/// Implementations are not expected to be reentrant: the bridge serializes
/// every call through the owning [`crate::ModuleInstance`] lock.
pub trait GuestVm: Send {
    type Function: Clone + fmt::Debug + Send;

    /// Resolves `symbol` exported by `module`.
    fn get_function(&self, module: &str, symbol: &str) -> Result<Self::Function, String>;

    /// Synchronously invokes `function` with integer arguments.
    fn call(&mut self, function: &Self::Function, args: &[i32]) -> Result<i64, String>;

    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];

    /// Most recent diagnostic recorded by the guest, if any.
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// A `(ptr, len)` range in guest linear memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GuestSlice {
    pub ptr: u32,
    pub len: u32,
}

impl GuestSlice {
    pub const NULL: GuestSlice = GuestSlice { ptr: 0, len: 0 };

    pub fn new(ptr: u32, len: u32) -> Self {
        Self { ptr, len }
    }

    pub fn range(self) -> Option<std::ops::Range<usize>> {
        let start = self.ptr as usize;
        let end = start.checked_add(self.len as usize)?;
        Some(start..end)
    }

    pub(crate) fn as_args(self) -> [i32; 2] {
        [self.ptr as i32, self.len as i32]
    }
}

/// Pointers 0 and 1 mean "no allocation" and are never handed to the guest free.
pub fn is_sentinel(ptr: u32) -> bool {
    ptr <= 1
}

pub(crate) fn guest_bytes(memory: &[u8], slice: GuestSlice) -> Option<&[u8]> {
    memory.get(slice.range()?)
}

pub(crate) fn guest_bytes_mut(memory: &mut [u8], slice: GuestSlice) -> Option<&mut [u8]> {
    memory.get_mut(slice.range()?)
}
