//! Growable staging buffer for bytes moving between host and guest.
//!
//! Storage is always fully initialized up to `capacity`; `size` marks how much
//! of it has been handed out through [`GrowableBuffer::access`].

use crate::CsrError;

const BUFFER_TARGET: &str = "buffer";

#[derive(Debug)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    size: usize,
}

impl GrowableBuffer {
    pub fn new(capacity: usize) -> Result<Self, CsrError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|err| CsrError::allocation(BUFFER_TARGET, err.to_string()))?;
        data.resize(capacity, 0);
        Ok(Self { data, size: 0 })
    }

    /// Reserves `len` bytes past the current end and returns them for writing.
    ///
    /// Grows storage (at least doubling) when the request does not fit. Bytes
    /// already written are preserved across growth.
    pub fn access(&mut self, len: usize) -> Result<&mut [u8], CsrError> {
        let end = self
            .size
            .checked_add(len)
            .ok_or_else(|| CsrError::allocation(BUFFER_TARGET, "size overflow"))?;
        if end > self.capacity() {
            self.grow_to(end)?;
        }
        let start = self.size;
        self.size = end;
        Ok(&mut self.data[start..end])
    }

    fn grow_to(&mut self, min_capacity: usize) -> Result<(), CsrError> {
        let doubled = self.capacity().saturating_mul(2);
        let new_capacity = doubled.max(min_capacity);
        let additional = new_capacity - self.data.len();
        self.data
            .try_reserve_exact(additional)
            .map_err(|err| CsrError::allocation(BUFFER_TARGET, err.to_string()))?;
        self.data.resize(new_capacity, 0);
        Ok(())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), CsrError> {
        self.access(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate(self.size);
        self.data
    }

    /// Releases the storage. Consuming `self` rules out use after free.
    pub fn free(self) {}
}
