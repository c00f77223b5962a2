use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrError {
    Allocation {
        target: String,
        reason: String,
    },
    Binding {
        module: String,
        unresolved: Vec<String>,
        reason: String,
    },
    Invocation {
        function: String,
        reason: String,
    },
    EmptyResult,
    Free {
        ptr: u32,
        reason: String,
    },
    NotBound {
        core: usize,
    },
    LockPoisoned {
        core: usize,
    },
    Memory {
        ptr: u32,
        len: u32,
    },
}

impl CsrError {
    pub fn allocation(target: impl Into<String>, reason: impl Into<String>) -> Self {
        CsrError::Allocation {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Stable short name of the error class, used in machine-readable reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CsrError::Allocation { .. } => "allocation",
            CsrError::Binding { .. } => "binding",
            CsrError::Invocation { .. } => "invocation",
            CsrError::EmptyResult => "empty_result",
            CsrError::Free { .. } => "free",
            CsrError::NotBound { .. } => "not_bound",
            CsrError::LockPoisoned { .. } => "lock_poisoned",
            CsrError::Memory { .. } => "memory",
        }
    }
}

impl fmt::Display for CsrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsrError::Allocation { target, reason } => {
                write!(f, "error during allocating ptr with length for {target}: {reason}")
            }
            CsrError::Binding {
                module,
                unresolved,
                reason,
            } => write!(
                f,
                "csr module function lookups failed for module {module:?} (unresolved: {}): {reason}",
                unresolved.join(", ")
            ),
            CsrError::Invocation { function, reason } => {
                write!(f, "guest call {function} failed: {reason}")
            }
            CsrError::EmptyResult => f.write_str("could not generate csr: empty value"),
            CsrError::Free { ptr, reason } => {
                write!(f, "guest free of ptr {ptr:#x} failed: {reason}")
            }
            CsrError::NotBound { core } => write!(f, "no csr module bound for cpu {core}"),
            CsrError::LockPoisoned { core } => {
                write!(f, "csr module lock for cpu {core} is poisoned")
            }
            CsrError::Memory { ptr, len } => write!(
                f,
                "guest memory range {ptr:#x}+{len} is outside linear memory"
            ),
        }
    }
}

impl std::error::Error for CsrError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_error_names_the_field() {
        let err = CsrError::allocation("email", "out of memory");
        assert!(err.to_string().contains("for email"));
        assert_eq!(err.kind(), "allocation");
    }

    #[test]
    fn binding_error_lists_every_unresolved_function() {
        let err = CsrError::Binding {
            module: "csr".to_string(),
            unresolved: vec!["csr_malloc".to_string(), "csr_gen".to_string()],
            reason: "not found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("csr_malloc, csr_gen"));
        assert!(msg.contains("\"csr\""));
    }
}
