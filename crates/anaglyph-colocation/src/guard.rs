//! Liveness guard and the retry loop built on it.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Interrupted;

/// Tells async work whether its component is still enabled.
///
/// Checked after every suspension point; a disabled guard turns the next
/// check into [`Interrupted::Canceled`].
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    token: CancellationToken,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            Err(Interrupted::Canceled)
        } else {
            Ok(())
        }
    }

    /// Awaits `fut` to completion, then checks the guard.
    pub async fn settle<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        let output = fut.await;
        self.check()?;
        Ok(output)
    }

    /// Sleeps for `delay`, waking early with `Canceled` if the guard is cancelled.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Interrupted> {
        tokio::select! {
            _ = self.token.cancelled() => Err(Interrupted::Canceled),
            _ = tokio::time::sleep(delay) => self.check(),
        }
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Outcome of a single attempt inside [`retry_until_success`].
#[derive(Debug)]
pub enum Attempt<E> {
    Interrupted(Interrupted),
    Failed(E),
}

impl<E> From<Interrupted> for Attempt<E> {
    fn from(reason: Interrupted) -> Self {
        Attempt::Interrupted(reason)
    }
}

/// Runs `attempt` until it succeeds, waiting `delay` after each failure.
///
/// Unbounded: only success or an interruption ends the loop. Failures are
/// logged; interruptions are not.
pub async fn retry_until_success<T, E, F, Fut>(
    liveness: &Liveness,
    delay: Duration,
    operation: &str,
    mut attempt: F,
) -> Result<T, Interrupted>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    loop {
        liveness.check()?;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Interrupted(reason)) => {
                debug!(operation, %reason, "abandoned");
                return Err(reason);
            }
            Err(Attempt::Failed(err)) => {
                warn!(operation, error = %err, "attempt failed; trying again in {delay:?}");
                if let Err(reason) = liveness.sleep(delay).await {
                    debug!(operation, %reason, "abandoned during retry delay");
                    return Err(reason);
                }
            }
        }
    }
}
