//! The `Handler` trait and the registry that looks handlers up by
//! classification.
//!
//! Grounded on the teacher's `Harness`/`HarnessRegistry` pair: an
//! object-safe trait stored as `Box<dyn Handler>` behind a name-keyed map.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::TaskContext;

/// A request from a handler to bypass ordinary retry accounting and move
/// the task directly to an explicit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRequest {
    pub status: RequestedStatus,
    pub scheduled_to: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedStatus {
    Canceled,
    Paused,
    Scheduled,
}

/// The outcome of invoking a handler: either it ran to completion (value or
/// error) or it asked for an explicit state transition.
pub enum HandlerOutcome {
    Success(Value),
    Error(anyhow::Error),
    StateChange(StateChangeRequest),
}

/// User-supplied executable invoked by the engine for a given
/// classification.
///
/// Object-safe: every method returns a concrete or boxed type, so
/// `Box<dyn Handler>` can be stored in a [`HandlerRegistry`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler against `input`, using `ctx` to stream logs,
    /// progress, and heartbeats.
    ///
    /// A `StateChangeRequest` returned via `HandlerOutcome::StateChange`
    /// bypasses retry accounting entirely; any other error is treated as a
    /// normal handler failure subject to `maxAttempts`.
    async fn run(&self, input: Value, ctx: &TaskContext) -> HandlerOutcome;
}

/// A named collection of registered [`Handler`] implementations.
///
/// Mirrors the teacher's `HarnessRegistry`: register/get/list over a
/// `HashMap<String, Box<dyn Handler>>`, with no ordering guarantee on
/// `list`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `classification`. Replaces and returns any
    /// handler previously registered under the same name.
    pub fn register(
        &mut self,
        classification: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Option<Box<dyn Handler>> {
        self.handlers
            .insert(classification.into(), Box::new(handler))
    }

    /// Look up a handler by classification.
    pub fn get(&self, classification: &str) -> Option<&dyn Handler> {
        self.handlers.get(classification).map(|b| b.as_ref())
    }

    /// List all registered classifications. Order is not guaranteed.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// Compile-time assertion: Handler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Handler) {}
};
