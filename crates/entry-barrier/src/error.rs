//! Error Module - Entry Barrier Error Types
//!
//! Defines all error types used by the entry barrier subsystem.
//!
//! # Error Categories
//!
//! ## Encoding Errors
//! - `EncodingMismatch` - Emitted barrier does not match the codec template
//! - `MissingRelocation` - Guard location relocation was never recorded
//!
//! ## Code Cache Errors
//! - `UnknownCodeAddress` - Return address outside any installed method
//! - `OutOfBounds` - Access outside the executable code region
//! - `CodeCacheFull` - No room left to install a method
//! - `VirtualMemory` - Mapping the code region failed
//!
//! ## Configuration Errors
//! - `UnsupportedPatching` - Codec cannot honour the requested strategy
//! - `Configuration` - Invalid configuration
//! - `Internal` - Invariant violation
//!
//! Encoding mismatches, unsupported patching strategies and unknown return
//! addresses in the slow path are defects. Call sites that hit them on the
//! hot path go through [`guarantee!`](crate::guarantee) and abort instead of
//! returning the error.

use thiserror::Error;

/// Main error type for all entry barrier operations
///
/// # Examples
///
/// ```rust
/// use entry_barrier::error::BarrierError;
///
/// fn report(err: BarrierError) {
///     match err {
///         BarrierError::EncodingMismatch { address, message } => {
///             eprintln!("barrier at {:#x} is corrupt: {}", address, message);
///         }
///         _ => eprintln!("other error: {}", err),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum BarrierError {
    /// The instruction bytes at the computed barrier address do not match
    /// the template the codec expects.
    ///
    /// **When returned:** `verify()` on a method whose generator and patcher
    /// disagree about layout
    ///
    /// **Recovery strategy:** None. This is a code generation defect.
    #[error("Entry barrier encoding mismatch at {address:#x}: {message}")]
    EncodingMismatch { address: usize, message: String },

    /// A method that must publish its guard through a relocation did not
    #[error("Method {method} has no {kind} relocation")]
    MissingRelocation { method: u64, kind: &'static str },

    /// Address is not inside any installed compiled method
    #[error("No compiled method contains address {address:#x}")]
    UnknownCodeAddress { address: usize },

    /// Access outside the executable region
    #[error("Code access out of bounds: address {address:#x}, len {len}")]
    OutOfBounds { address: usize, len: usize },

    /// Code cache has no room for the method being installed
    #[error("Code cache full: requested {requested} bytes, available {available} bytes")]
    CodeCacheFull { requested: usize, available: usize },

    /// The codec cannot implement the requested patching strategy
    #[error("Patching strategy {patching} is not supported on {arch}")]
    UnsupportedPatching {
        arch: &'static str,
        patching: &'static str,
    },

    /// Virtual memory error
    ///
    /// **When returned:** Reserving or mapping the code region failed
    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error - indicates a bug
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BarrierError {
    /// Check if this error must abort the process when hit at runtime
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BarrierError::EncodingMismatch { .. }
                | BarrierError::MissingRelocation { .. }
                | BarrierError::UnsupportedPatching { .. }
                | BarrierError::UnknownCodeAddress { .. }
                | BarrierError::Internal(_)
        )
    }
}

impl From<crate::config::ConfigError> for BarrierError {
    fn from(err: crate::config::ConfigError) -> Self {
        BarrierError::Configuration(err.to_string())
    }
}

/// Result type alias for entry barrier operations
pub type Result<T> = std::result::Result<T, BarrierError>;

/// Abort on a broken invariant
///
/// Logs the failure through the `log` facade before panicking so the message
/// survives even when the panic hook is silenced. Release builds are
/// configured with `panic = "abort"`.
#[macro_export]
macro_rules! guarantee {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            let message = format!($($arg)*);
            $crate::log::error!("guarantee({}) failed: {}", stringify!($cond), message);
            panic!("guarantee({}) failed: {}", stringify!($cond), message);
        }
    };
}

/// Unwrap a result whose error is a defect, aborting with context
#[macro_export]
macro_rules! fatal_on_err {
    ($result:expr, $context:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => {
                $crate::log::error!("{}: {}", $context, err);
                panic!("{}: {}", $context, err);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let err = BarrierError::EncodingMismatch {
            address: 0x1000,
            message: "bad prefix".to_string(),
        };
        assert!(err.is_fatal());

        let err = BarrierError::CodeCacheFull {
            requested: 64,
            available: 0,
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_display_includes_address() {
        let err = BarrierError::UnknownCodeAddress { address: 0xdead };
        assert!(err.to_string().contains("0xdead"));
    }

    #[test]
    #[should_panic(expected = "guarantee")]
    fn test_guarantee_panics() {
        guarantee!(1 + 1 == 3, "arithmetic is {}", "broken");
    }
}
