//! Transform dispatch boundary.
//!
//! Transforms are the external operations that convert one artifact's
//! content into the next stage's content. The engine only sees this trait:
//! a named transform, a JSON payload in, a JSON payload out, and a typed
//! failure telling it whether retrying can possibly help.

pub mod http;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::HttpDispatcher;
pub use process::ProcessDispatcher;

/// Boundary to the external transform runtime
#[async_trait]
pub trait TransformDispatcher: Send + Sync {
    /// Human-readable dispatcher name (for logs)
    fn name(&self) -> &str;

    /// Run the named transform on the input payload.
    ///
    /// Must be side-effect free from the engine's point of view: the engine
    /// enforces at-most-one downstream artifact per (parent, type) itself,
    /// so a dispatcher may retry internally without consequence.
    async fn invoke(
        &self,
        transform: &str,
        input: &Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError>;

    /// Cheap reachability probe (binary present, service up)
    async fn health_check(&self) -> Result<(), DispatchError>;
}

/// Typed dispatch failures; `is_retryable` drives the engine's retry loop
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No transform with that name is installed; a deployment error
    #[error("transform '{transform}' not found")]
    ProcessorNotFound { transform: String },

    /// The external process/service failed at runtime
    #[error("transform '{transform}' failed (exit {exit_code:?}): {stderr}")]
    ExecutionFailure {
        transform: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The transform ran past its deadline
    #[error("transform '{transform}' timed out after {elapsed:?}")]
    Timeout { transform: String, elapsed: Duration },

    /// The transform produced output that is not well-formed JSON;
    /// a contract violation, never retried
    #[error("transform '{transform}' produced unparseable output: {detail}")]
    OutputParseError { transform: String, detail: String },
}

impl DispatchError {
    /// Whether another attempt can possibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ExecutionFailure { .. } | DispatchError::Timeout { .. }
        )
    }
}

/// Retry policy for failed dispatches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits; keeps tests fast
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
