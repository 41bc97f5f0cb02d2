// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Declarative payload shaping.
pub mod shape;
/// Deterministic stub handlers for simulated mode.
pub mod simulated;

use async_trait::async_trait;
use reel_core::{CancellationToken, ProduceRequest, ProduceResult};
use reel_error::{ErrorCode, ForgeError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use simulated::SimulatedHandler;

/// Broad classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The user's inputs were rejected. Surfaced verbatim; never retried.
    UserInput,
    /// The provider rate-limited the request. Retryable with backoff.
    RateLimited,
    /// The upstream service failed. Retryable only when the provider says so.
    Upstream,
    /// Credentials are missing or rejected. Treated as user input.
    Auth,
    /// The handler observed cancellation.
    Cancelled,
    /// Anything else. Non-retryable by default.
    Unknown,
}

/// A classified provider failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    /// Broad classification.
    pub kind: ProviderErrorKind,
    /// Provider-specific error code, when one was reported.
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Whether the executor may retry the attempt.
    pub retryable: bool,
    /// Provider-supplied wait hint, honored before the next attempt.
    pub retry_after_ms: Option<u64>,
}

impl ProviderError {
    /// A user-input rejection. Never retried.
    #[must_use]
    pub fn user_input(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::UserInput,
            code: None,
            message: message.into(),
            retryable: false,
            retry_after_ms: None,
        }
    }

    /// A rate limit, optionally carrying the provider's wait hint.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            code: None,
            message: message.into(),
            retryable: true,
            retry_after_ms,
        }
    }

    /// An upstream failure; `retryable` per the provider's own signal.
    #[must_use]
    pub fn upstream(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: ProviderErrorKind::Upstream,
            code: None,
            message: message.into(),
            retryable,
            retry_after_ms: None,
        }
    }

    /// An authentication failure.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Auth,
            code: None,
            message: message.into(),
            retryable: false,
            retry_after_ms: None,
        }
    }

    /// The handler observed cancellation.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            kind: ProviderErrorKind::Cancelled,
            code: None,
            message: "cancelled".into(),
            retryable: false,
            retry_after_ms: None,
        }
    }

    /// An unclassified failure. Non-retryable by default.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Unknown,
            code: None,
            message: message.into(),
            retryable: false,
            retry_after_ms: None,
        }
    }

    /// Attach a provider-specific error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<ProviderError> for ForgeError {
    fn from(err: ProviderError) -> Self {
        let code = match err.kind {
            ProviderErrorKind::UserInput => ErrorCode::InputInvalid,
            ProviderErrorKind::RateLimited => ErrorCode::ProviderRateLimited,
            ProviderErrorKind::Upstream | ProviderErrorKind::Unknown => ErrorCode::ProviderUpstream,
            ProviderErrorKind::Auth => ErrorCode::ProviderAuth,
            ProviderErrorKind::Cancelled => ErrorCode::RunCancelled,
        };
        ForgeError::new(code, err.message.clone()).retryable(err.retryable)
    }
}

/// A provider handler: the uniform `invoke` boundary.
///
/// Handlers are free to block on remote I/O inside `invoke`; they should
/// honor the cancellation token at their next suspension point.
#[async_trait]
pub trait ProducerHandler: Send + Sync {
    /// The provider name this handler serves (e.g. `"openai"`, `"mock"`).
    fn provider(&self) -> &str;

    /// Validate credentials and warm caches. Idempotent.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] with kind [`ProviderErrorKind::Auth`] on credential
    /// problems.
    async fn warm_start(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Execute one produce request.
    ///
    /// # Errors
    ///
    /// Any [`ProviderError`]; only explicitly retryable ones are retried.
    async fn invoke(
        &self,
        request: ProduceRequest,
        cancel: CancellationToken,
    ) -> Result<ProduceResult, ProviderError>;
}

/// Named handler lookup, shared across the executor.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ProducerHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its provider name, replacing any previous
    /// registration.
    pub fn register<H: ProducerHandler + 'static>(&mut self, handler: H) {
        self.handlers
            .insert(handler.provider().to_string(), Arc::new(handler));
    }

    /// Look up a handler by provider name.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProducerHandler>> {
        self.handlers.get(provider).cloned()
    }

    /// True when a handler is registered for the provider.
    #[must_use]
    pub fn contains(&self, provider: &str) -> bool {
        self.handlers.contains_key(provider)
    }

    /// Sorted provider names.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("providers", &self.list())
            .finish()
    }
}

/// Walk an output schema along an artifact path to the leaf subschema,
/// descending `items` for each ordinal index and ignoring fan-out (named)
/// indices. Unknown paths resolve to `null` (treated as a string leaf).
#[must_use]
pub fn leaf_schema(schema: &serde_json::Value, id: &reel_core::CanonicalId) -> serde_json::Value {
    use serde_json::Value;
    let reel_core::CanonicalId::Artifact { path, .. } = id else {
        return Value::Null;
    };
    let mut current = schema;
    for seg in path {
        let Some(next) = current.get("properties").and_then(|p| p.get(&seg.name)) else {
            return Value::Null;
        };
        current = next;
        for ix in &seg.indices {
            if matches!(ix, reel_core::Index::Ordinal(_)) {
                match current.get("items") {
                    Some(items) => current = items,
                    None => return Value::Null,
                }
            }
        }
    }
    current.clone()
}

/// Wait before the next attempt: the provider's hint when present,
/// exponential backoff otherwise.
#[must_use]
pub fn backoff_delay(attempt: u32, retry_after_ms: Option<u64>) -> Duration {
    match retry_after_ms {
        Some(ms) => Duration::from_millis(ms),
        None => {
            let exp = attempt.saturating_sub(1).min(8);
            Duration::from_millis(200u64.saturating_mul(1 << exp))
        }
    }
}
