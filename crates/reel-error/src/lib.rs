// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Problems with user-supplied inputs: missing values, invalid enums,
    /// out-of-bounds indices, schema violations. Never retried.
    UserInput,
    /// Planning failures: cycles, unsatisfied bindings, ambiguous fan-in.
    /// Fatal for the run.
    Plan,
    /// Storage failures: I/O, manifest conflicts.
    Storage,
    /// Provider failures: rate limits, upstream errors, authentication.
    Provider,
    /// The run was cancelled. Clean; recorded and reported.
    Cancelled,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UserInput => "user_input",
            Self::Plan => "plan",
            Self::Storage => "storage",
            Self::Provider => "provider",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- User input --
    /// A required input is missing and its schema declares no default.
    InputMissing,
    /// An input value does not match its declared type or enum.
    InputInvalid,
    /// An indexed access reached past the end of an array input.
    InputIndexOutOfBounds,
    /// A produced artifact violates its declared output schema.
    OutputSchemaViolation,

    // -- Plan --
    /// The producer graph contains a cycle.
    PlanCycle,
    /// A connection references an unknown producer or input.
    PlanUnknownReference,
    /// A consumer input could not be bound to any source.
    PlanUnsatisfiedBinding,
    /// Fan-in members span more than one plausible grouping dimension.
    PlanAmbiguousFanIn,
    /// An output-schema array has neither a fixed size nor a declared dimension.
    PlanUnsizedArray,
    /// A condition references an artifact that no producer emits.
    PlanUnknownCondition,

    // -- Storage --
    /// A blob or manifest was not found.
    StorageNotFound,
    /// The manifest on disk no longer matches the expected hash.
    StorageConflict,
    /// An I/O operation failed; typically transient.
    StorageIo,

    // -- Provider --
    /// The provider rate-limited the request.
    ProviderRateLimited,
    /// The upstream service failed.
    ProviderUpstream,
    /// Credentials are missing or rejected.
    ProviderAuth,
    /// The handler returned fewer artifacts than the job declared.
    ProviderMissingOutput,
    /// No handler is registered for the requested provider.
    ProviderNotFound,

    // -- Cancellation --
    /// The run was cancelled before completion.
    RunCancelled,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InputMissing
            | Self::InputInvalid
            | Self::InputIndexOutOfBounds
            | Self::OutputSchemaViolation => ErrorCategory::UserInput,

            Self::PlanCycle
            | Self::PlanUnknownReference
            | Self::PlanUnsatisfiedBinding
            | Self::PlanAmbiguousFanIn
            | Self::PlanUnsizedArray
            | Self::PlanUnknownCondition => ErrorCategory::Plan,

            Self::StorageNotFound | Self::StorageConflict | Self::StorageIo => {
                ErrorCategory::Storage
            }

            Self::ProviderRateLimited
            | Self::ProviderUpstream
            | Self::ProviderAuth
            | Self::ProviderMissingOutput
            | Self::ProviderNotFound => ErrorCategory::Provider,

            Self::RunCancelled => ErrorCategory::Cancelled,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"PLAN_AMBIGUOUS_FAN_IN"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputMissing => "INPUT_MISSING",
            Self::InputInvalid => "INPUT_INVALID",
            Self::InputIndexOutOfBounds => "INPUT_INDEX_OUT_OF_BOUNDS",
            Self::OutputSchemaViolation => "OUTPUT_SCHEMA_VIOLATION",
            Self::PlanCycle => "PLAN_CYCLE",
            Self::PlanUnknownReference => "PLAN_UNKNOWN_REFERENCE",
            Self::PlanUnsatisfiedBinding => "PLAN_UNSATISFIED_BINDING",
            Self::PlanAmbiguousFanIn => "PLAN_AMBIGUOUS_FAN_IN",
            Self::PlanUnsizedArray => "PLAN_UNSIZED_ARRAY",
            Self::PlanUnknownCondition => "PLAN_UNKNOWN_CONDITION",
            Self::StorageNotFound => "STORAGE_NOT_FOUND",
            Self::StorageConflict => "STORAGE_CONFLICT",
            Self::StorageIo => "STORAGE_IO",
            Self::ProviderRateLimited => "PROVIDER_RATE_LIMITED",
            Self::ProviderUpstream => "PROVIDER_UPSTREAM",
            Self::ProviderAuth => "PROVIDER_AUTH",
            Self::ProviderMissingOutput => "PROVIDER_MISSING_OUTPUT",
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::RunCancelled => "RUN_CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether errors with this code are worth retrying by default.
    ///
    /// Only storage I/O and explicitly retryable provider failures qualify;
    /// providers can widen this per error via [`ForgeError::retryable`].
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(self, Self::StorageIo | Self::ProviderRateLimited)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ForgeError
// ---------------------------------------------------------------------------

/// The unified error type surfaced at the run boundary.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ForgeError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message, surfaced verbatim for user-input errors.
    pub message: String,
    /// Whether the operation may succeed if retried.
    pub retryable: bool,
    /// Arbitrary key-value context (offending IDs, paths, hashes).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ForgeError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.default_retryable(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Override the retryability flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// The broad category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}
