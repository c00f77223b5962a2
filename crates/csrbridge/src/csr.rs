//! CSR generation across the guest boundary.
//!
//! The guest entry point has a fixed arity: the private key followed by one
//! `(ptr, len)` pair per [`CsrField`]. Absent fields are passed as `(0, 0)`.
//! Every guest allocation made while marshaling is freed again, in reverse
//! order, before [`CsrSession::generate`] returns.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::guest::is_sentinel;
use crate::{CsrError, CsrSession, GuestSlice, GuestVm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsrField {
    Subject,
    Dns,
    Uri,
    Email,
    Ip,
}

impl CsrField {
    /// Protocol order, shared by allocation and the generate call.
    pub const ALL: [CsrField; 5] = [
        CsrField::Subject,
        CsrField::Dns,
        CsrField::Uri,
        CsrField::Email,
        CsrField::Ip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CsrField::Subject => "subject",
            CsrField::Dns => "dns",
            CsrField::Uri => "uri",
            CsrField::Email => "email",
            CsrField::Ip => "ip",
        }
    }
}

impl std::fmt::Display for CsrField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsrParameters {
    pub subject: Option<String>,
    pub dns: Option<String>,
    pub uri: Option<String>,
    pub email: Option<String>,
    pub ip: Option<String>,
}

impl CsrParameters {
    /// The field's value if present. Empty strings count as absent.
    pub fn get(&self, field: CsrField) -> Option<&str> {
        let value = match field {
            CsrField::Subject => &self.subject,
            CsrField::Dns => &self.dns,
            CsrField::Uri => &self.uri,
            CsrField::Email => &self.email,
            CsrField::Ip => &self.ip,
        };
        value.as_deref().filter(|s| !s.is_empty())
    }

    pub fn set(&mut self, field: CsrField, value: impl Into<String>) {
        let slot = match field {
            CsrField::Subject => &mut self.subject,
            CsrField::Dns => &mut self.dns,
            CsrField::Uri => &mut self.uri,
            CsrField::Email => &mut self.email,
            CsrField::Ip => &mut self.ip,
        };
        *slot = Some(value.into());
    }

    pub fn with(mut self, field: CsrField, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn present(&self) -> impl Iterator<Item = CsrField> + '_ {
        CsrField::ALL
            .into_iter()
            .filter(|&field| self.get(field).is_some())
    }
}

/// Location of a generated CSR in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrOutput {
    pub ptr: u32,
    pub len: u32,
}

impl CsrOutput {
    pub fn slice(self) -> GuestSlice {
        GuestSlice::new(self.ptr, self.len)
    }
}

pub type CsrResult = Result<CsrOutput, CsrError>;

/// Splits the generate return value: pointer in the high half, length in the low half.
pub fn decode_packed(raw: u64) -> CsrResult {
    if raw == 0 {
        return Err(CsrError::EmptyResult);
    }
    Ok(CsrOutput {
        ptr: (raw >> 32) as u32,
        len: raw as u32,
    })
}

pub fn encode_packed(ptr: u32, len: u32) -> u64 {
    (u64::from(ptr) << 32) | u64::from(len)
}

/// Guest pointers allocated during one request, in allocation order.
#[derive(Debug, Default)]
pub(crate) struct GuestAllocationSet {
    ptrs: Vec<u32>,
}

impl GuestAllocationSet {
    pub(crate) fn new() -> Self {
        Self {
            ptrs: Vec::with_capacity(CsrField::ALL.len()),
        }
    }

    pub(crate) fn push(&mut self, ptr: u32) {
        self.ptrs.push(ptr);
    }

    /// Frees every pointer, newest first, skipping sentinels.
    ///
    /// Keeps going after a failed free. Returns the last failure seen; earlier
    /// ones are logged.
    pub(crate) fn release<V: GuestVm>(self, session: &mut CsrSession<'_, V>) -> Option<CsrError> {
        let mut last_err: Option<CsrError> = None;
        for ptr in self.ptrs.into_iter().rev() {
            if is_sentinel(ptr) {
                continue;
            }
            if let Err(err) = session.free(ptr) {
                if let Some(prev) = last_err.replace(err) {
                    warn!(error = %prev, "superseded guest free error");
                }
            }
        }
        last_err
    }
}

impl<V: GuestVm> CsrSession<'_, V> {
    /// Generates a CSR for the private key at `key` using `params`.
    ///
    /// A failed free during cleanup replaces whatever result came before it,
    /// including success. The replaced result is logged.
    pub fn generate(&mut self, key: GuestSlice, params: &CsrParameters) -> CsrResult {
        let mut allocations = GuestAllocationSet::new();
        let result = self.marshal_and_call(key, params, &mut allocations);

        match (allocations.release(self), result) {
            (None, result) => result,
            (Some(free_err), Ok(output)) => {
                warn!(
                    ptr = output.ptr,
                    len = output.len,
                    "csr generated but cleanup failed"
                );
                Err(free_err)
            }
            (Some(free_err), Err(prev)) => {
                warn!(error = %prev, "superseded by guest free error");
                Err(free_err)
            }
        }
    }

    fn marshal_and_call(
        &mut self,
        key: GuestSlice,
        params: &CsrParameters,
        allocations: &mut GuestAllocationSet,
    ) -> CsrResult {
        let mut pairs = [GuestSlice::NULL; 5];

        for (pair, field) in pairs.iter_mut().zip(CsrField::ALL) {
            let Some(value) = params.get(field) else {
                continue;
            };
            *pair = self.alloc_and_copy(field, value.as_bytes(), allocations)?;
        }

        let mut args = Vec::with_capacity(2 + 2 * pairs.len());
        args.extend_from_slice(&key.as_args());
        for pair in pairs {
            args.extend_from_slice(&pair.as_args());
        }

        let raw = self.call_generate(&args).map_err(|reason| {
            warn!(error = %reason, "could not generate csr");
            CsrError::Invocation {
                function: self.symbols().generate.clone(),
                reason,
            }
        })?;

        debug!(mem = raw, "csr generated successfully");
        decode_packed(raw as u64)
    }

    fn alloc_and_copy(
        &mut self,
        field: CsrField,
        bytes: &[u8],
        allocations: &mut GuestAllocationSet,
    ) -> Result<GuestSlice, CsrError> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CsrError::allocation(field.as_str(), "value larger than guest address space"))?;
        let ptr = self.call_malloc(len).map_err(|reason| {
            warn!(field = field.as_str(), error = %reason, "wasm malloc error");
            CsrError::allocation(field.as_str(), reason)
        })?;
        // Recorded before the copy so a failed copy still gets freed.
        allocations.push(ptr);

        let slice = GuestSlice::new(ptr, len);
        self.write(slice, bytes).map_err(|err| {
            warn!(field = field.as_str(), error = %err, "csr parameter copy failed");
            CsrError::allocation(field.as_str(), err.to_string())
        })?;
        debug!(field = field.as_str(), ptr, len, "staged csr parameter");
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_pointer_and_length() {
        let out = decode_packed(0x0000_1000_0000_002A).unwrap();
        assert_eq!(out, CsrOutput { ptr: 0x1000, len: 42 });
    }

    #[test]
    fn decode_zero_is_empty_result() {
        assert_eq!(decode_packed(0), Err(CsrError::EmptyResult));
    }

    #[test]
    fn decode_inverts_encode_at_the_edges() {
        for (ptr, len) in [
            (0u32, 1u32),
            (1, 0),
            (0x1000, 42),
            (u32::MAX, 0),
            (0, u32::MAX),
            (u32::MAX, u32::MAX),
        ] {
            let raw = encode_packed(ptr, len);
            assert_eq!(decode_packed(raw), Ok(CsrOutput { ptr, len }));
        }
    }

    #[test]
    fn negative_guest_return_decodes_as_unsigned() {
        let raw = encode_packed(0x8000_0000, 7) as i64;
        assert!(raw < 0);
        assert_eq!(
            decode_packed(raw as u64),
            Ok(CsrOutput {
                ptr: 0x8000_0000,
                len: 7
            })
        );
    }

    #[test]
    fn empty_strings_are_absent() {
        let params = CsrParameters {
            subject: Some(String::new()),
            dns: Some("example.com".to_string()),
            ..CsrParameters::default()
        };
        assert_eq!(params.get(CsrField::Subject), None);
        assert_eq!(params.present().collect::<Vec<_>>(), vec![CsrField::Dns]);
    }

    #[test]
    fn field_order_is_stable() {
        let names: Vec<_> = CsrField::ALL.iter().map(|f| f.as_str()).collect();
        assert_eq!(names, ["subject", "dns", "uri", "email", "ip"]);
    }
}
