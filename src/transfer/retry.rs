//! Bounded retry with in-place reconnection.
//!
//! Every network-facing store primitive goes through `ReconnectingSession::run`:
//! transient failures tear the session down, open a fresh one with the same
//! credentials and try again, up to the `RetryBudget`. Exhausting the budget
//! is a definitive `StoreError::RetriesExhausted`, never an endless loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::{DEFAULT_MAX_RETRIES, StoreConfig};
use crate::error::StoreError;
use crate::transfer::store::{StoreConnector, StoreSession};

/// Maximum number of attempts for one store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max_attempts: u32,
    delay: Duration,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.max_retries).with_delay(Duration::from_millis(config.retry_delay_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// A store session that rebuilds itself on transient failures.
pub struct ReconnectingSession {
    connector: Arc<dyn StoreConnector>,
    session: Arc<dyn StoreSession>,
    budget: RetryBudget,
    reconnects: u32,
}

impl ReconnectingSession {
    /// Open the first session, retrying transient connection failures.
    pub async fn open(
        connector: Arc<dyn StoreConnector>,
        budget: RetryBudget,
    ) -> Result<Self, StoreError> {
        let max = budget.max_attempts();
        for attempt in 1..=max {
            match connector.connect().await {
                Ok(session) => {
                    return Ok(Self {
                        connector,
                        session,
                        budget,
                        reconnects: 0,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        host = connector.host(),
                        attempt,
                        max_attempts = max,
                        error = %e,
                        "Could not connect to store, retrying"
                    );
                    if attempt < max {
                        budget.pause().await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::RetriesExhausted {
            operation: format!("connect to {}", connector.host()),
            attempts: max,
        })
    }

    pub fn host(&self) -> &str {
        self.connector.host()
    }

    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    /// Number of times the session was rebuilt so far.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// The current underlying session.
    pub fn session(&self) -> Arc<dyn StoreSession> {
        Arc::clone(&self.session)
    }

    /// Tear down the current session and open a new one in its place.
    pub async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.session.close().await;
        let fresh = self.connector.connect().await?;
        self.session = fresh;
        self.reconnects += 1;
        debug!(host = self.connector.host(), reconnects = self.reconnects, "Store session rebuilt");
        Ok(())
    }

    /// Run `op` against the session, reconnecting and retrying on transient errors.
    ///
    /// `op` is invoked at most `budget.max_attempts()` times. Non-transient
    /// errors are returned immediately.
    pub async fn run<T, F, Fut>(&mut self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(Arc<dyn StoreSession>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max = self.budget.max_attempts();
        for attempt in 1..=max {
            match op(self.session()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = max,
                        error = %e,
                        "Network or connection error, trying to reconnect"
                    );
                    if attempt < max {
                        self.budget.pause().await;
                        if let Err(e) = self.reconnect().await {
                            warn!(operation, error = %e, "Reconnect failed");
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        error!(operation, attempts = max, "Store operation not successful within retry budget");
        Err(StoreError::RetriesExhausted {
            operation: operation.to_string(),
            attempts: max,
        })
    }

    /// Release the session.
    pub async fn close(self) {
        self.session.close().await;
    }
}
