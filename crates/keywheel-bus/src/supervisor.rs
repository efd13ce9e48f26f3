//! Receive-loop supervision.
//!
//! A transport error is fatal to the loop that hit it, never to the
//! process: the loop returns a typed [`BusError`] to its supervisor, which
//! restarts it until the restart budget is spent and only then gives up by
//! returning the error to the caller.

use std::future::Future;

use crate::bus::BusError;

/// Restart policy for one supervised receive loop.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    max_restarts: u32,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self { max_restarts: 3 }
    }
}

impl Supervisor {
    /// Supervisor allowing `max_restarts` restarts before shutting down.
    pub fn new(max_restarts: u32) -> Self {
        Self { max_restarts }
    }

    /// Run a loop under supervision.
    ///
    /// `factory` builds a fresh instance of the loop each attempt. A clean
    /// return ends supervision; an error is logged and the loop restarted
    /// until the budget is exhausted.
    ///
    /// # Errors
    ///
    /// `RestartBudgetExhausted` wrapping after the final failed attempt.
    pub async fn supervise<F, Fut>(&self, name: &str, mut factory: F) -> Result<(), BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BusError>>,
    {
        let mut attempts = 0u32;
        loop {
            match factory().await {
                Ok(()) => {
                    tracing::info!(loop_name = %name, "receive loop ended cleanly");
                    return Ok(());
                },
                Err(e) => {
                    attempts += 1;
                    if attempts > self.max_restarts {
                        tracing::error!(
                            loop_name = %name,
                            error = %e,
                            attempts,
                            "receive loop failed, restart budget exhausted"
                        );
                        return Err(BusError::RestartBudgetExhausted(name.to_string()));
                    }
                    tracing::warn!(
                        loop_name = %name,
                        error = %e,
                        attempt = attempts,
                        "receive loop failed, restarting"
                    );
                },
            }
        }
    }
}
