//! Error taxonomy shared by every module.
//!
//! Each module owns its own `thiserror` enum; this module only defines the
//! classification the pipeline uses to decide what is fatal:
//!
//! - `Structural`: caller contract violation, fatal to the single operation.
//! - `Numeric`: per-sample problem, masked instead of aborting.
//! - `Convergence`: per-slice / per-channel optimizer failure, reported as
//!   partial success.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Structural,
    Numeric,
    Convergence,
}

impl ErrorClass {
    /// Structural errors abort the operation that raised them.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Structural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_structural_is_fatal() {
        assert!(ErrorClass::Structural.is_fatal());
        assert!(!ErrorClass::Numeric.is_fatal());
        assert!(!ErrorClass::Convergence.is_fatal());
    }
}
