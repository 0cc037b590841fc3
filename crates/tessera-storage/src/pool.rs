// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Read pool: up to `max_open` read-only slots handed out round-robin.
//!
//! Slots connect lazily. Checkout prefers an idle open connection and only
//! opens another when every open one is busy, so the number of connections
//! tracks peak read concurrency rather than the configured ceiling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::TesseraError;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::conn::{Connector, Slot};
use crate::context::Ctx;
use crate::dialect::ConnRole;

pub(crate) struct ReadPool {
    slots: Vec<Arc<Mutex<Slot>>>,
    next: AtomicUsize,
    max_lifetime: Duration,
}

impl ReadPool {
    pub fn new(connector: &Arc<Connector>, size: usize, max_lifetime: Duration) -> Self {
        let slots = (0..size.max(1))
            .map(|_| Arc::new(Mutex::new(connector.slot(ConnRole::ReadOnly))))
            .collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
            max_lifetime,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Arc<Mutex<Slot>>] {
        &self.slots
    }

    /// Open `count` connections up front so the first reads skip the handshake.
    pub async fn warm(&self, count: usize) -> Result<(), TesseraError> {
        for slot in self.slots.iter().take(count) {
            slot.lock().await.ensure_ready(None).await?;
        }
        debug!(warmed = count.min(self.slots.len()), size = self.slots.len(), "read pool warmed");
        Ok(())
    }

    /// Connections currently open. Slots busy with a caller count as open.
    pub fn open_connections(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.try_lock().map_or(true, |guard| guard.is_open()))
            .count()
    }

    /// Take an idle open slot, else an unopened one, else wait for the next
    /// one in rotation.
    pub async fn checkout(&self, ctx: &Ctx) -> Result<OwnedMutexGuard<Slot>, TesseraError> {
        let n = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let mut unopened = None;
        for offset in 0..n {
            if let Ok(guard) = self.slots[(start + offset) % n].clone().try_lock_owned() {
                if guard.is_open() {
                    return self.ready(ctx, guard).await;
                }
                if unopened.is_none() {
                    unopened = Some(guard);
                }
            }
        }
        if let Some(guard) = unopened {
            debug!(open = self.open_connections(), size = n, "read pool growing");
            return self.ready(ctx, guard).await;
        }
        let slot = self.slots[start].clone();
        let guard = ctx.run(async move { Ok(slot.lock_owned().await) }).await?;
        self.ready(ctx, guard).await
    }

    async fn ready(
        &self,
        ctx: &Ctx,
        mut guard: OwnedMutexGuard<Slot>,
    ) -> Result<OwnedMutexGuard<Slot>, TesseraError> {
        ctx.run(guard.ensure_ready(Some(self.max_lifetime))).await?;
        Ok(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_config::model::StorageConfig;
    use tempfile::tempdir;

    fn connector(dir: &std::path::Path) -> Arc<Connector> {
        let mut config = StorageConfig::default();
        config.sqlite.path = dir.join("pool.db").display().to_string();
        Arc::new(Connector::from_config(&config).unwrap())
    }

    #[tokio::test]
    async fn checkout_rotates_and_opens_lazily() {
        let dir = tempdir().unwrap();
        let connector = connector(dir.path());
        let mut writer = connector.slot(ConnRole::ReadWrite);
        writer.ensure_ready(None).await.unwrap();

        let pool = ReadPool::new(&connector, 3, Duration::from_secs(3600));
        let ctx = Ctx::background();
        let a = pool.checkout(&ctx).await.unwrap();
        let b = pool.checkout(&ctx).await.unwrap();
        let c = pool.checkout(&ctx).await.unwrap();
        assert!(a.is_open() && b.is_open() && c.is_open());
        drop((a, b, c));

        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn connections_grow_only_with_concurrency() {
        let dir = tempdir().unwrap();
        let connector = connector(dir.path());
        let mut writer = connector.slot(ConnRole::ReadWrite);
        writer.ensure_ready(None).await.unwrap();

        let pool = ReadPool::new(&connector, 4, Duration::from_secs(3600));
        let ctx = Ctx::background();
        assert_eq!(pool.open_connections(), 0);
        for _ in 0..6 {
            drop(pool.checkout(&ctx).await.unwrap());
        }
        assert_eq!(pool.open_connections(), 1);

        let a = pool.checkout(&ctx).await.unwrap();
        let b = pool.checkout(&ctx).await.unwrap();
        drop((a, b));
        assert_eq!(pool.open_connections(), 2);
        assert_eq!(pool.size(), 4);

        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_pool_waits_and_honours_cancellation() {
        let dir = tempdir().unwrap();
        let connector = connector(dir.path());
        let mut writer = connector.slot(ConnRole::ReadWrite);
        writer.ensure_ready(None).await.unwrap();

        let pool = ReadPool::new(&connector, 1, Duration::from_secs(3600));
        let held = pool.checkout(&Ctx::background()).await.unwrap();

        let token = tokio_util::sync::CancellationToken::new();
        let ctx = Ctx::new(token.clone());
        token.cancel();
        let err = pool
            .checkout(&ctx)
            .await
            .err()
            .expect("cancelled checkout must fail");
        assert!(matches!(err, TesseraError::Cancelled));

        drop(held);
        assert!(pool.checkout(&Ctx::background()).await.is_ok());
        writer.close().await.unwrap();
    }
}
