//! Control-plane abstraction.
//!
//! Commands and fetchers never talk to a provider SDK directly: they issue
//! `(api, method, input)` calls through [`ControlPlane`] with JSON payloads.
//! [`memory::MemoryCloud`] is the in-process implementation used by the CLI
//! and the tests.

/// In-memory simulated provider.
pub mod memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryCloud;

/// Error code a provider returns when a dry-run request would have succeeded.
pub const DRY_RUN_OPERATION: &str = "DryRunOperation";

/// Error codes of the access denied family.
pub const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "AuthFailure",
];

/// Error returned by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Machine readable code, e.g. `InvalidVpcID.NotFound`.
    pub code: String,
    /// Human sentence.
    pub message: String,
}

impl ProviderError {
    /// New error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the error belongs to the access denied family.
    pub fn is_access_denied(&self) -> bool {
        ACCESS_DENIED_CODES.contains(&self.code.as_str())
    }

    /// Whether the code designates a missing resource.
    pub fn is_not_found(&self) -> bool {
        self.code.ends_with("NotFound")
    }

    /// Whether this is the success answer of a dry-run request.
    pub fn is_dry_run_success(&self) -> bool {
        self.code == DRY_RUN_OPERATION
    }
}

/// A cloud provider control plane.
///
/// Implementations must be safe to share across fetch tasks.
pub trait ControlPlane: Send + Sync {
    /// Region the control plane operates in.
    fn region(&self) -> String;

    /// Profile (credential set) name.
    fn profile(&self) -> String {
        "default".to_string()
    }

    /// Perform `method` on `api`.
    ///
    /// With `dry_run` set the provider only checks the request and answers
    /// with a [`DRY_RUN_OPERATION`] error when it would have succeeded.
    fn call(
        &self,
        api: &str,
        method: &str,
        input: &serde_json::Value,
        dry_run: bool,
    ) -> Result<serde_json::Value, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_families() {
        assert!(ProviderError::new("AccessDenied", "nope").is_access_denied());
        assert!(ProviderError::new("UnauthorizedOperation", "nope").is_access_denied());
        assert!(ProviderError::new("InvalidVpcID.NotFound", "gone").is_not_found());
        assert!(ProviderError::new(DRY_RUN_OPERATION, "ok").is_dry_run_success());
        assert_eq!(
            ProviderError::new("Throttling", "slow down").to_string(),
            "Throttling: slow down"
        );
    }
}
