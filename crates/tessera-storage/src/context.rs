// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use tessera_core::TesseraError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline carried by every engine call.
///
/// Waits on the write gate, pool checkout, advisory-lock polling and driver
/// round trips all race against both.
#[derive(Debug, Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Ctx {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Derive a context that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some((existing, d)) if existing <= candidate => (existing, d),
            _ => (candidate, timeout),
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<(), TesseraError> {
        if self.cancel.is_cancelled() {
            return Err(TesseraError::Cancelled);
        }
        if let Some((deadline, duration)) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(TesseraError::Timeout { duration });
        }
        Ok(())
    }

    /// Drive `fut` to completion unless cancellation or the deadline wins first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, TesseraError>
    where
        F: Future<Output = Result<T, TesseraError>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some((at, duration)) => {
                    tokio::time::sleep_until(at).await;
                    duration
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TesseraError::Cancelled),
            duration = deadline => Err(TesseraError::Timeout { duration }),
            result = fut => result,
        }
    }

    /// Sleep for `period`, returning early with `Cancelled` if the token fires.
    pub async fn sleep(&self, period: Duration) -> Result<(), TesseraError> {
        self.run(async {
            tokio::time::sleep(period).await;
            Ok(())
        })
        .await
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}
