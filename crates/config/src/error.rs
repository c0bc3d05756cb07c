// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use miette::Diagnostic;

/// Errors that can occur while reading environment parameters or parsing
/// window info arguments.
#[derive(thiserror::Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum Error {
    /// A parameter had a value outside its accepted set.
    #[error("invalid value `{value}` for `{key}`: expected {expected}")]
    #[diagnostic(code(proxima_config::invalid_value))]
    InvalidValue {
        /// The parameter or info key.
        key: String,
        /// The rejected value.
        value: String,
        /// A description of the accepted values.
        expected: &'static str,
    },

    /// A numeric parameter did not parse.
    #[error("invalid number `{value}` for `{key}`")]
    #[diagnostic(code(proxima_config::invalid_number))]
    InvalidNumber {
        /// The parameter key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A parameter that must be positive was zero.
    #[error("`{key}` must be greater than zero")]
    #[diagnostic(code(proxima_config::must_be_positive))]
    MustBePositive {
        /// The parameter key.
        key: String,
    },

    /// An `epoch_type` info value contained an unknown token.
    #[error("unknown epoch type `{token}` in `{value}`")]
    #[diagnostic(code(proxima_config::unknown_epoch_type))]
    UnknownEpochType {
        /// The unrecognized token.
        token: String,
        /// The full info value.
        value: String,
    },
}
