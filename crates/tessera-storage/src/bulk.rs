// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One-shot copy of an embedded database into PostgreSQL.
//!
//! Tables are copied parents-first along foreign keys, all inside one
//! PostgreSQL transaction: either every table lands with matching row counts
//! and resynchronized sequences, or nothing changes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use futures::pin_mut;
use rusqlite::OpenFlags;
use serde::Serialize;
use tessera_core::{Backend, TesseraError};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, info, warn};

use crate::conn::{map_pg_err, map_tr_err};
use crate::context::Ctx;
use crate::database::Database;
use crate::executor::Executor;
use crate::value::Value;

/// Rows read from the source and written to `COPY` per round trip.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// `pg_advisory_xact_lock` key held for the whole copy.
const BULK_LOCK_KEY: i64 = 0x7465_7373_6572_6102;

#[derive(Debug, Clone, Copy)]
pub struct BulkOptions {
    /// Write to the destination. Without it only counts are reported.
    pub apply: bool,
    pub batch_size: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            apply: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub source_rows: u64,
    /// `None` when the destination table does not exist (dry run).
    pub destination_rows: Option<u64>,
    pub copied_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub applied: bool,
    /// Tables in copy order.
    pub tables: Vec<TableReport>,
    pub missing_tables: Vec<String>,
    /// Tables on a foreign key cycle, appended to the order lexically.
    pub cyclic_tables: Vec<String>,
    pub sequences_reset: usize,
}

/// Quote an identifier for either engine.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// Parents-first order over `tables`, where `parents[t]` holds the tables `t`
/// references. Ties go to the lexically smallest name. Tables left on a cycle
/// are returned separately, sorted.
pub fn copy_order(
    tables: &[String],
    parents: &HashMap<String, BTreeSet<String>>,
) -> (Vec<String>, Vec<String>) {
    let known: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
    let mut indegree: HashMap<&str, usize> = known.iter().map(|t| (*t, 0)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for &table in &known {
        let Some(refs) = parents.get(table) else {
            continue;
        };
        for parent in refs {
            // Self references and references outside the copied set impose no order.
            if parent.as_str() == table || !known.contains(parent.as_str()) {
                continue;
            }
            *indegree.entry(table).or_default() += 1;
            children.entry(parent.as_str()).or_default().push(table);
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(t, _)| *t)
        .collect();
    let mut order = Vec::with_capacity(known.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        for &child in children.get(next).map(Vec::as_slice).unwrap_or_default() {
            if let Some(d) = indegree.get_mut(child) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
    let cyclic: Vec<String> = known
        .iter()
        .filter(|t| !placed.contains(**t))
        .map(|t| t.to_string())
        .collect();
    (order, cyclic)
}

/// Destination type-driven fixups for values SQLite stores loosely.
pub fn normalize(value: Value, ty: &Type) -> Value {
    match value {
        Value::Integer(i) if *ty == Type::BOOL => Value::Bool(i != 0),
        Value::Integer(i) if *ty == Type::FLOAT8 || *ty == Type::FLOAT4 => Value::Real(i as f64),
        Value::Text(s) if *ty == Type::BYTEA => Value::Blob(s.into_bytes()),
        Value::Text(s) if *ty == Type::BOOL => match s.to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Value::Bool(true),
            "0" | "f" | "false" => Value::Bool(false),
            _ => Value::Text(s),
        },
        other => other,
    }
}

/// Read side: a read-only connection to the source file.
struct Source {
    conn: tokio_rusqlite::Connection,
}

impl Source {
    async fn open(path: &Path) -> Result<Self, TesseraError> {
        if !path.exists() {
            return Err(TesseraError::Config(format!(
                "source database {} does not exist",
                path.display()
            )));
        }
        let conn = tokio_rusqlite::Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .await
        .map_err(|e| TesseraError::Connectivity {
            backend: Backend::Sqlite.to_string(),
            source: Box::new(e),
        })?;
        Ok(Self { conn })
    }

    async fn tables(&self) -> Result<Vec<String>, TesseraError> {
        const SQL: &str = "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != 'schema_migrations' ORDER BY name";
        self.conn
            .call(|c| -> Result<Vec<String>, rusqlite::Error> {
                let mut stmt = c.prepare(SQL)?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect()
            })
            .await
            .map_err(|e| map_tr_err(SQL, e))
    }

    async fn parents(&self, tables: &[String]) -> Result<HashMap<String, BTreeSet<String>>, TesseraError> {
        const SQL: &str = "SELECT DISTINCT \"table\" FROM pragma_foreign_key_list(?1)";
        let tables = tables.to_vec();
        self.conn
            .call(move |c| -> Result<HashMap<String, BTreeSet<String>>, rusqlite::Error> {
                let mut stmt = c.prepare(SQL)?;
                let mut out = HashMap::new();
                for table in tables {
                    let refs = stmt
                        .query_map([&table], |r| r.get::<_, String>(0))?
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    out.insert(table, refs);
                }
                Ok(out)
            })
            .await
            .map_err(|e| map_tr_err(SQL, e))
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>, TesseraError> {
        const SQL: &str = "SELECT name FROM pragma_table_info(?1) ORDER BY cid";
        let table = table.to_string();
        self.conn
            .call(move |c| -> Result<Vec<String>, rusqlite::Error> {
                let mut stmt = c.prepare(SQL)?;
                let rows = stmt.query_map([&table], |r| r.get::<_, String>(0))?;
                rows.collect()
            })
            .await
            .map_err(|e| map_tr_err(SQL, e))
    }

    async fn count(&self, table: &str) -> Result<u64, TesseraError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let query = sql.clone();
        self.conn
            .call(move |c| -> Result<i64, rusqlite::Error> { c.query_row(&query, [], |r| r.get(0)) })
            .await
            .map(|n| n.max(0) as u64)
            .map_err(|e| map_tr_err(&sql, e))
    }

    /// Up to `limit` rows with `rowid > after`, plus the last rowid read.
    async fn batch(
        &self,
        table: &str,
        columns: &[String],
        after: i64,
        limit: usize,
    ) -> Result<(Vec<Vec<Value>>, Option<i64>), TesseraError> {
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            column_list(columns),
            quote_ident(table)
        );
        let query = sql.clone();
        let width = columns.len();
        self.conn
            .call(move |c| -> Result<(Vec<Vec<Value>>, Option<i64>), rusqlite::Error> {
                let mut stmt = c.prepare_cached(&query)?;
                let mut rows = stmt.query(rusqlite::params![after, limit as i64])?;
                let mut out = Vec::new();
                let mut last = None;
                while let Some(row) = rows.next()? {
                    last = Some(row.get::<_, i64>(0)?);
                    let mut values = Vec::with_capacity(width);
                    for i in 1..=width {
                        values.push(Value::from(row.get_ref(i)?));
                    }
                    out.push(values);
                }
                Ok((out, last))
            })
            .await
            .map_err(|e| map_tr_err(&sql, e))
    }

    async fn close(self) {
        if let Err(e) = self.conn.close().await {
            debug!(error = %e, "closing bulk source failed");
        }
    }
}

/// Copy every user table from the SQLite file at `source` into `target`.
///
/// Without [`BulkOptions::apply`] nothing is written and the report carries
/// the counts and the destination tables that do not exist yet.
pub async fn copy_sqlite_to_postgres(
    ctx: &Ctx,
    source: &Path,
    target: &Database,
    options: BulkOptions,
) -> Result<BulkReport, TesseraError> {
    if target.backend() != Backend::Postgres {
        return Err(TesseraError::Config(
            "bulk copy target must be a postgres database".to_string(),
        ));
    }
    let source = Source::open(source).await?;
    let result = copy_with(ctx, &source, target, options).await;
    source.close().await;
    result
}

async fn copy_with(
    ctx: &Ctx,
    source: &Source,
    target: &Database,
    options: BulkOptions,
) -> Result<BulkReport, TesseraError> {
    let tables = ctx.run(source.tables()).await?;
    let parents = ctx.run(source.parents(&tables)).await?;
    let (mut order, cyclic) = copy_order(&tables, &parents);
    if !cyclic.is_empty() {
        warn!(tables = ?cyclic, "foreign key cycle, copying remaining tables in name order");
        order.extend(cyclic.iter().cloned());
    }
    debug!(order = ?order, "bulk copy order");

    if options.apply {
        target.migrate(ctx).await?;
        apply(ctx, source, target, &order, cyclic, options.batch_size.max(1)).await
    } else {
        dry_run(ctx, source, target, &order, cyclic).await
    }
}

async fn destination_exists(ctx: &Ctx, target: &Database, table: &str) -> Result<bool, TesseraError> {
    let rows = target
        .query_on_writer(ctx, "SELECT to_regclass(?)::text", &[quote_ident(table).into()])
        .await?;
    Ok(rows
        .first()
        .and_then(|r| r.values().first())
        .is_some_and(|v| !v.is_null()))
}

async fn dry_run(
    ctx: &Ctx,
    source: &Source,
    target: &Database,
    order: &[String],
    cyclic: Vec<String>,
) -> Result<BulkReport, TesseraError> {
    let mut tables = Vec::with_capacity(order.len());
    let mut missing = Vec::new();
    for table in order {
        let source_rows = ctx.run(source.count(table)).await?;
        let destination_rows = if destination_exists(ctx, target, table).await? {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
            let rows = target.query_on_writer(ctx, &sql, &[]).await?;
            Some(rows.first().map(|r| r.get::<u64>(0)).transpose()?.unwrap_or(0))
        } else {
            missing.push(table.clone());
            None
        };
        tables.push(TableReport {
            table: table.clone(),
            source_rows,
            destination_rows,
            copied_rows: 0,
        });
    }
    info!(tables = tables.len(), missing = missing.len(), "bulk copy dry run complete");
    Ok(BulkReport {
        applied: false,
        tables,
        missing_tables: missing,
        cyclic_tables: cyclic,
        sequences_reset: 0,
    })
}

async fn apply(
    ctx: &Ctx,
    source: &Source,
    target: &Database,
    order: &[String],
    cyclic: Vec<String>,
    batch_size: usize,
) -> Result<BulkReport, TesseraError> {
    let mut guard = target.lock_writer(ctx).await?;
    let client = guard.pg_client_mut()?;

    // Dropping the transaction on any error or cancellation rolls it back.
    ctx.run(async move {
        let tx = client
            .transaction()
            .await
            .map_err(|e| map_pg_err("BEGIN", e))?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&BULK_LOCK_KEY])
            .await
            .map_err(|e| map_pg_err("SELECT pg_advisory_xact_lock($1)", e))?;

        let mut missing = Vec::new();
        for table in order {
            let row = tx
                .query_one("SELECT to_regclass($1)::text", &[&quote_ident(table)])
                .await
                .map_err(|e| map_pg_err("SELECT to_regclass($1)::text", e))?;
            if row.get::<_, Option<String>>(0).is_none() {
                missing.push(table.clone());
            }
        }
        if !missing.is_empty() {
            return Err(TesseraError::Config(format!(
                "destination is missing tables: {}",
                missing.join(", ")
            )));
        }

        if !order.is_empty() {
            let truncate = format!(
                "TRUNCATE {} RESTART IDENTITY CASCADE",
                order.iter().map(|t| quote_ident(t)).collect::<Vec<_>>().join(", ")
            );
            tx.batch_execute(&truncate)
                .await
                .map_err(|e| map_pg_err(&truncate, e))?;
        }

        let mut reports = Vec::with_capacity(order.len());
        for table in order {
            reports.push(copy_table(ctx, source, &tx, table, batch_size).await?);
        }

        let sequences_reset = reset_sequences(&tx, order).await?;
        tx.commit().await.map_err(|e| map_pg_err("COMMIT", e))?;

        info!(tables = reports.len(), sequences_reset, "bulk copy committed");
        Ok(BulkReport {
            applied: true,
            tables: reports,
            missing_tables: Vec::new(),
            cyclic_tables: cyclic,
            sequences_reset,
        })
    })
    .await
}

async fn destination_columns(
    tx: &tokio_postgres::Transaction<'_>,
    table: &str,
) -> Result<BTreeSet<String>, TesseraError> {
    const SQL: &str = "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name::text = $1";
    let rows = tx.query(SQL, &[&table]).await.map_err(|e| map_pg_err(SQL, e))?;
    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

async fn copy_table(
    ctx: &Ctx,
    source: &Source,
    tx: &tokio_postgres::Transaction<'_>,
    table: &str,
    batch_size: usize,
) -> Result<TableReport, TesseraError> {
    let dest_columns = destination_columns(tx, table).await?;
    let (columns, skipped): (Vec<String>, Vec<String>) = source
        .columns(table)
        .await?
        .into_iter()
        .partition(|c| dest_columns.contains(c));
    if !skipped.is_empty() {
        warn!(table, columns = ?skipped, "source columns missing from destination, skipping");
    }

    let source_rows = source.count(table).await?;
    let mut copied: u64 = 0;

    if !columns.is_empty() {
        let cols = column_list(&columns);
        let columns_sql = format!("SELECT {cols} FROM {} LIMIT 0", quote_ident(table));
        let stmt = tx.prepare(&columns_sql).await.map_err(|e| map_pg_err(&columns_sql, e))?;
        let types: Vec<Type> = stmt.columns().iter().map(|c| c.type_().clone()).collect();

        let copy = format!("COPY {} ({cols}) FROM STDIN BINARY", quote_ident(table));
        let sink = tx.copy_in(&copy).await.map_err(|e| map_pg_err(&copy, e))?;
        let writer = BinaryCopyInWriter::new(sink, &types);
        pin_mut!(writer);

        let mut after = i64::MIN;
        loop {
            ctx.check()?;
            let (batch, last) = source.batch(table, &columns, after, batch_size).await?;
            let fetched = batch.len();
            for row in batch {
                let values: Vec<Value> = row
                    .into_iter()
                    .zip(&types)
                    .map(|(v, ty)| normalize(v, ty))
                    .collect();
                let params: Vec<&(dyn ToSql + Sync)> =
                    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                writer
                    .as_mut()
                    .write(&params)
                    .await
                    .map_err(|e| map_pg_err(&copy, e))?;
            }
            copied += fetched as u64;
            match last {
                Some(rowid) if fetched == batch_size => after = rowid,
                _ => break,
            }
        }
        writer.as_mut().finish().await.map_err(|e| map_pg_err(&copy, e))?;
    }

    let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let destination_rows = tx
        .query_one(&count_sql, &[])
        .await
        .map_err(|e| map_pg_err(&count_sql, e))?
        .get::<_, i64>(0)
        .max(0) as u64;

    if source_rows != destination_rows || source_rows != copied {
        return Err(TesseraError::BulkMismatch {
            table: table.to_string(),
            source_rows,
            destination_rows,
            copied_rows: copied,
        });
    }
    debug!(table, rows = copied, "table copied");
    Ok(TableReport {
        table: table.to_string(),
        source_rows,
        destination_rows: Some(destination_rows),
        copied_rows: copied,
    })
}

/// Point every serial/identity sequence of the copied tables past `MAX(col)`.
async fn reset_sequences(tx: &tokio_postgres::Transaction<'_>, order: &[String]) -> Result<usize, TesseraError> {
    const SQL: &str = "SELECT table_name::text, column_name::text FROM information_schema.columns \
         WHERE table_schema = current_schema() \
         AND (column_default LIKE 'nextval(%' OR is_identity = 'YES') \
         ORDER BY table_name, column_name";
    let rows = tx.query(SQL, &[]).await.map_err(|e| map_pg_err(SQL, e))?;
    let mut reset = 0;
    for row in rows {
        let table: String = row.get(0);
        let column: String = row.get(1);
        if !order.contains(&table) {
            continue;
        }
        let setval = format!(
            "SELECT setval(pg_get_serial_sequence($1, $2), COALESCE(MAX({}), 0) + 1, false) FROM {}",
            quote_ident(&column),
            quote_ident(&table)
        );
        tx.query_one(&setval, &[&quote_ident(&table), &column])
            .await
            .map_err(|e| map_pg_err(&setval, e))?;
        reset += 1;
    }
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn deps(pairs: &[(&str, &[&str])]) -> HashMap<String, BTreeSet<String>> {
        pairs
            .iter()
            .map(|(t, ps)| (t.to_string(), ps.iter().map(|p| p.to_string()).collect()))
            .collect()
    }

    #[test]
    fn parents_come_first_with_lexical_ties() {
        let tables = names(&["b", "a", "c", "d"]);
        let parents = deps(&[("b", &["a"]), ("d", &["c", "b"])]);
        let (order, cyclic) = copy_order(&tables, &parents);
        assert_eq!(order, names(&["a", "b", "c", "d"]));
        assert!(cyclic.is_empty());
    }

    #[test]
    fn self_and_external_references_are_ignored() {
        let tables = names(&["tree", "leaf"]);
        let parents = deps(&[("tree", &["tree"]), ("leaf", &["tree", "elsewhere"])]);
        let (order, cyclic) = copy_order(&tables, &parents);
        assert_eq!(order, names(&["tree", "leaf"]));
        assert!(cyclic.is_empty());
    }

    #[test]
    fn cycles_are_reported_separately() {
        let tables = names(&["x", "y", "z"]);
        let parents = deps(&[("x", &["y"]), ("y", &["x"])]);
        let (order, cyclic) = copy_order(&tables, &parents);
        assert_eq!(order, names(&["z"]));
        assert_eq!(cyclic, names(&["x", "y"]));
    }

    #[test]
    fn schema_order_copies_pool_before_referencing_tables() {
        let tables = names(&["audit_events", "collections", "document_tags", "documents", "string_pool"]);
        let parents = deps(&[
            ("collections", &["string_pool"]),
            ("documents", &["collections", "string_pool"]),
            ("document_tags", &["documents", "string_pool"]),
            ("audit_events", &["documents", "string_pool"]),
        ]);
        let (order, _) = copy_order(&tables, &parents);
        assert_eq!(
            order,
            names(&["string_pool", "collections", "documents", "audit_events", "document_tags"])
        );
    }

    #[test]
    fn normalize_by_destination_type() {
        assert_eq!(normalize(Value::Integer(1), &Type::BOOL), Value::Bool(true));
        assert_eq!(normalize(Value::Integer(0), &Type::BOOL), Value::Bool(false));
        assert_eq!(normalize(Value::Text("ab".into()), &Type::BYTEA), Value::Blob(b"ab".to_vec()));
        assert_eq!(normalize(Value::Integer(2), &Type::FLOAT8), Value::Real(2.0));
        assert_eq!(normalize(Value::Text("x".into()), &Type::TEXT), Value::Text("x".into()));
        assert_eq!(normalize(Value::Null, &Type::BOOL), Value::Null);
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
