// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The statement-running seam shared by [`Database`](crate::Database) and
//! [`Transaction`](crate::Transaction).

use async_trait::async_trait;
use tessera_core::{Backend, TesseraError};

use crate::context::Ctx;
use crate::value::{ExecResult, Row, Value};

/// Something that can run `?`-placeholder SQL.
///
/// Repositories take `&impl Executor` (or `&dyn Executor`) so the same code
/// works on the auto-routed database handle and inside a transaction.
#[async_trait]
pub trait Executor: Send + Sync {
    fn backend(&self) -> Backend;

    /// Run a statement for its side effects.
    async fn exec(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<ExecResult, TesseraError>;

    /// Run a statement and collect every returned row.
    async fn query(&self, ctx: &Ctx, query: &str, args: &[Value]) -> Result<Vec<Row>, TesseraError>;

    /// First returned row, if any.
    async fn query_row(
        &self,
        ctx: &Ctx,
        query: &str,
        args: &[Value],
    ) -> Result<Option<Row>, TesseraError> {
        Ok(self.query(ctx, query, args).await?.into_iter().next())
    }
}
