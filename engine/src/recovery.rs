//! Pattern-matched error recovery.
//!
//! An [`ErrorRecovery`] maps error-message patterns to async handlers. The
//! first pattern (in registration order) that matches the error's message
//! gets to turn the error into a value. Unmatched errors are handed back.
//!
//! ```
//! use closet_engine::ErrorRecovery;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut recovery: ErrorRecovery<Vec<String>, String> = ErrorRecovery::new();
//! recovery
//!     .register("quota|rate limit", |_err| async { Ok(Vec::new()) })
//!     .unwrap();
//!
//! let recovered = recovery.recover("Rate limit exceeded".to_string()).await;
//! assert_eq!(recovered, Ok(Vec::new()));
//! # }
//! ```

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use regex::{Regex, RegexBuilder};
use std::fmt::Display;
use std::future::Future;
use tracing::debug;

type Handler<T, E> = Box<dyn Fn(E) -> BoxFuture<'static, std::result::Result<T, E>> + Send + Sync>;

struct Strategy<T, E> {
    pattern: Regex,
    handler: Handler<T, E>,
}

/// Registry of recovery handlers keyed by case-insensitive regex.
pub struct ErrorRecovery<T, E> {
    strategies: Vec<Strategy<T, E>>,
}

impl<T, E> Default for ErrorRecovery<T, E> {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }
}

impl<T, E> std::fmt::Debug for ErrorRecovery<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecovery")
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl<T, E> ErrorRecovery<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for errors whose message matches `pattern`.
    ///
    /// Registering a pattern again replaces its handler and keeps its place
    /// in the matching order.
    pub fn register<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| Error::InvalidPattern(err.to_string()))?;
        let boxed: Handler<T, E> =
            Box::new(move |err| Box::pin(handler(err)) as BoxFuture<'static, _>);

        match self
            .strategies
            .iter_mut()
            .find(|strategy| strategy.pattern.as_str() == pattern)
        {
            Some(existing) => existing.handler = boxed,
            None => self.strategies.push(Strategy {
                pattern: compiled,
                handler: boxed,
            }),
        }
        Ok(())
    }

    /// Registered patterns, in matching order.
    pub fn patterns(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.pattern.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl<T, E: Display> ErrorRecovery<T, E> {
    /// Run the first handler whose pattern matches `error`.
    ///
    /// Returns `Err(error)` unchanged when nothing matches.
    pub async fn recover(&self, error: E) -> std::result::Result<T, E> {
        let message = error.to_string();
        match self
            .strategies
            .iter()
            .find(|strategy| strategy.pattern.is_match(&message))
        {
            Some(strategy) => {
                debug!(pattern = strategy.pattern.as_str(), error = %message, "recovering from error");
                (strategy.handler)(error).await
            }
            None => Err(error),
        }
    }
}
