// SPDX-License-Identifier: Apache-2.0

//! Errors of the redirection layer.
//!
//! Hot-path calls preserve the underlying runtime error and forward it
//! unchanged; layer-specific failures get their own variants.

/// Convenience result alias for layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the redirection layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An info mapping or environment parameter failed to parse.
    #[error("info parse error: {0}")]
    Info(#[from] proxima_config::Error),

    /// A forwarded failure of the underlying runtime.
    #[error(transparent)]
    Runtime(#[from] proxima_runtime::Error),

    /// Node/rank bookkeeping disagreed with the deployment.
    #[error("topology inconsistent: {details}")]
    TopologyInconsistent {
        /// What disagreed.
        details: String,
    },

    /// A helper received a window handle it cannot verify.
    #[error("bad helper window handle {handle:#x}")]
    BadHandle {
        /// The unverifiable handle.
        handle: u64,
    },

    /// An operation was issued for an epoch type the window did not
    /// advertise at allocation.
    #[error("operation requires epoch type `{required}` advertised at allocation")]
    EpochNotAdvertised {
        /// The missing epoch type.
        required: &'static str,
    },

    /// An internal invariant was violated.
    #[error("invariant violated: {details}")]
    InvariantViolation {
        /// What was violated.
        details: String,
    },
}
