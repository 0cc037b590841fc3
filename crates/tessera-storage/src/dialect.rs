// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-backend behaviour table and placeholder rewriting.
//!
//! Everything that differs between the embedded and client/server engines
//! lives in a [`Dialect`] selected once at open time, so call sites never
//! branch on connection strings or driver types.

use std::borrow::Cow;
use std::time::Duration;

pub use tessera_core::Backend;

/// Whether a connection may mutate the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    ReadWrite,
    ReadOnly,
}

/// Inputs that parameterize tuning directives.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub busy_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Static per-backend behaviour.
#[derive(Debug)]
pub struct Dialect {
    pub backend: Backend,
    /// Statement opening a write transaction.
    pub begin_write: &'static str,
    /// Statement opening a read-only transaction.
    pub begin_read: &'static str,
    /// Best-effort planner maintenance run at close.
    pub optimize: &'static str,
    /// Cluster-wide advisory locks are available.
    pub advisory_locks: bool,
    /// Disable / re-enable / verify foreign key enforcement. `None` when the
    /// backend cannot toggle enforcement per connection.
    pub fk_disable: Option<&'static str>,
    pub fk_enable: Option<&'static str>,
    pub fk_check: Option<&'static str>,
    /// Numbered `$n` placeholders instead of `?`.
    pub numbered_placeholders: bool,
}

static SQLITE: Dialect = Dialect {
    backend: Backend::Sqlite,
    begin_write: "BEGIN IMMEDIATE",
    begin_read: "BEGIN",
    optimize: "PRAGMA optimize",
    advisory_locks: false,
    fk_disable: Some("PRAGMA foreign_keys = OFF"),
    fk_enable: Some("PRAGMA foreign_keys = ON"),
    fk_check: Some("PRAGMA foreign_key_check"),
    numbered_placeholders: false,
};

static POSTGRES: Dialect = Dialect {
    backend: Backend::Postgres,
    begin_write: "BEGIN",
    begin_read: "BEGIN TRANSACTION READ ONLY",
    optimize: "ANALYZE",
    advisory_locks: true,
    fk_disable: None,
    fk_enable: None,
    fk_check: None,
    numbered_placeholders: true,
};

impl Dialect {
    pub fn for_backend(backend: Backend) -> &'static Dialect {
        match backend {
            Backend::Sqlite => &SQLITE,
            Backend::Postgres => &POSTGRES,
        }
    }

    pub fn begin(&self, read_only: bool) -> &'static str {
        if read_only { self.begin_read } else { self.begin_write }
    }

    /// Rewrite `?` placeholders into this backend's native syntax.
    pub fn rewrite<'a>(&self, query: &'a str) -> Cow<'a, str> {
        if self.numbered_placeholders {
            rewrite_placeholders(query)
        } else {
            Cow::Borrowed(query)
        }
    }

    /// Ordered tuning directives applied to each new connection.
    ///
    /// Read-only embedded connections never touch `journal_mode`; WAL is a
    /// property of the database file and is set by the writer.
    pub fn tuning(&self, role: ConnRole, tuning: Tuning) -> Vec<String> {
        let busy_ms = tuning.busy_timeout.as_millis();
        match (self.backend, role) {
            (Backend::Sqlite, ConnRole::ReadWrite) => vec![
                "PRAGMA journal_mode = WAL".to_string(),
                "PRAGMA synchronous = NORMAL".to_string(),
                "PRAGMA foreign_keys = ON".to_string(),
                format!("PRAGMA busy_timeout = {busy_ms}"),
                "PRAGMA temp_store = MEMORY".to_string(),
                "PRAGMA cache_size = -64000".to_string(),
                "PRAGMA wal_autocheckpoint = 1000".to_string(),
            ],
            (Backend::Sqlite, ConnRole::ReadOnly) => vec![
                format!("PRAGMA busy_timeout = {busy_ms}"),
                "PRAGMA foreign_keys = ON".to_string(),
                "PRAGMA temp_store = MEMORY".to_string(),
                "PRAGMA cache_size = -64000".to_string(),
                "PRAGMA mmap_size = 268435456".to_string(),
                "PRAGMA query_only = ON".to_string(),
            ],
            (Backend::Postgres, ConnRole::ReadWrite) => vec![
                "SET application_name = 'tessera'".to_string(),
                "SET idle_in_transaction_session_timeout = '5min'".to_string(),
                format!("SET lock_timeout = '{busy_ms}ms'"),
            ],
            (Backend::Postgres, ConnRole::ReadOnly) => vec![
                "SET application_name = 'tessera-reader'".to_string(),
                "SET default_transaction_read_only = on".to_string(),
            ],
        }
    }
}

/// Rewrite `?` into `$1, $2, ...`, leaving placeholders inside quoted
/// literals, quoted identifiers, comments and dollar-quoted bodies alone.
///
/// Numbering continues after the highest `$n` already in the text, so a
/// query mixing both styles never binds two markers to one parameter.
pub fn rewrite_placeholders(query: &str) -> Cow<'_, str> {
    if !query.contains('?') {
        return Cow::Borrowed(query);
    }

    let markers = scan_markers(query);
    if markers.questions.is_empty() {
        return Cow::Borrowed(query);
    }

    let mut out = String::with_capacity(query.len() + 2 * markers.questions.len());
    let mut n = markers.highest_numbered;
    let mut copied = 0usize;
    for pos in markers.questions {
        n += 1;
        out.push_str(&query[copied..pos]);
        out.push('$');
        out.push_str(&n.to_string());
        copied = pos + 1;
    }
    out.push_str(&query[copied..]);
    Cow::Owned(out)
}

/// Bare `?` offsets and the largest `$n` outside quotes and comments.
struct Markers {
    questions: Vec<usize>,
    highest_numbered: usize,
}

fn scan_markers(query: &str) -> Markers {
    let bytes = query.as_bytes();
    let mut markers = Markers {
        questions: Vec::new(),
        highest_numbered: 0,
    };
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => match numbered_param(query, i) {
                Some((value, end)) => {
                    markers.highest_numbered = markers.highest_numbered.max(value);
                    i = end;
                }
                None => i = skip_dollar_quoted(query, i),
            },
            b'?' => {
                markers.questions.push(i);
                i += 1;
            }
            _ => i += 1,
        }
    }
    markers
}

/// `$<digits>` at `start`, as its value and end offset.
fn numbered_param(query: &str, start: usize) -> Option<(usize, usize)> {
    let bytes = query.as_bytes();
    if start > 0 && (bytes[start - 1].is_ascii_alphanumeric() || bytes[start - 1] == b'_') {
        return None;
    }
    let mut end = start + 1;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == start + 1 {
        return None;
    }
    // Absurdly large indexes are left to the server to reject.
    let value = query[start + 1..end].parse::<u32>().ok()?;
    Some((value as usize, end))
}

/// Skip a `'...'` or `"..."` run starting at `start`; a doubled quote is an
/// escaped quote, not a terminator.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// Skip `$tag$ ... $tag$` if one starts at `start`; otherwise step over the `$`.
fn skip_dollar_quoted(query: &str, start: usize) -> usize {
    let bytes = query.as_bytes();
    // `a$b` is part of an identifier, not a quote opener.
    if start > 0 && (bytes[start - 1].is_ascii_alphanumeric() || bytes[start - 1] == b'_') {
        return start + 1;
    }
    let mut j = start + 1;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    let tag_is_valid = j < bytes.len()
        && bytes[j] == b'$'
        && !bytes.get(start + 1).is_some_and(|b| b.is_ascii_digit());
    if !tag_is_valid {
        return start + 1;
    }
    let delimiter = &query[start..=j];
    match query[j + 1..].find(delimiter) {
        Some(pos) => j + 1 + pos + delimiter.len(),
        None => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rewrites_positional_placeholders() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn string_literal_placeholder_untouched() {
        assert_eq!(
            rewrite_placeholders("SELECT '?' AS q, id FROM t WHERE a = ?"),
            "SELECT '?' AS q, id FROM t WHERE a = $1"
        );
        assert_eq!(
            rewrite_placeholders("SELECT 'it''s ?' FROM t WHERE a = ?"),
            "SELECT 'it''s ?' FROM t WHERE a = $1"
        );
    }

    #[test]
    fn identifiers_and_comments_untouched() {
        assert_eq!(
            rewrite_placeholders(r#"SELECT "odd?col" FROM t -- why?
WHERE a = ? /* or ? /* nested ? */ still */ AND b = ?"#),
            r#"SELECT "odd?col" FROM t -- why?
WHERE a = $1 /* or ? /* nested ? */ still */ AND b = $2"#
        );
    }

    #[test]
    fn dollar_quoted_bodies_untouched() {
        let q = "CREATE FUNCTION f() RETURNS text AS $body$ SELECT '?' || ? $body$ LANGUAGE sql; SELECT ?";
        assert_eq!(
            rewrite_placeholders(q),
            "CREATE FUNCTION f() RETURNS text AS $body$ SELECT '?' || ? $body$ LANGUAGE sql; SELECT $1"
        );
        assert_eq!(rewrite_placeholders("SELECT $$?$$, ?"), "SELECT $$?$$, $1");
    }

    #[test]
    fn existing_numbered_params_are_not_dollar_quotes() {
        assert_eq!(rewrite_placeholders("SELECT $1, ?"), "SELECT $1, $2");
    }

    #[test]
    fn numbering_continues_after_highest_existing_param() {
        assert_eq!(rewrite_placeholders("SELECT ?, $3, ?"), "SELECT $4, $3, $5");
        assert_eq!(
            rewrite_placeholders("SELECT '$9', ? -- $7\n"),
            "SELECT '$9', $1 -- $7\n"
        );
        assert_eq!(rewrite_placeholders("SELECT a$2, ?"), "SELECT a$2, $1");
    }

    #[test]
    fn no_placeholders_borrows() {
        assert!(matches!(rewrite_placeholders("SELECT 1"), Cow::Borrowed(_)));
        assert!(matches!(rewrite_placeholders("SELECT '?'"), Cow::Borrowed(_)));
    }

    #[test]
    fn sqlite_dialect_leaves_queries_alone() {
        let d = Dialect::for_backend(Backend::Sqlite);
        assert_eq!(d.rewrite("SELECT ?"), "SELECT ?");
        let d = Dialect::for_backend(Backend::Postgres);
        assert_eq!(d.rewrite("SELECT ?"), "SELECT $1");
    }

    #[test]
    fn reader_tuning_never_sets_journal_mode() {
        let d = Dialect::for_backend(Backend::Sqlite);
        let reader = d.tuning(ConnRole::ReadOnly, Tuning::default());
        assert!(reader.iter().all(|s| !s.contains("journal_mode")));
        assert!(reader.iter().any(|s| s == "PRAGMA query_only = ON"));
        let writer = d.tuning(ConnRole::ReadWrite, Tuning::default());
        assert_eq!(writer[0], "PRAGMA journal_mode = WAL");
        assert!(writer.contains(&"PRAGMA busy_timeout = 5000".to_string()));
    }

    #[test]
    fn only_embedded_dialect_toggles_foreign_keys() {
        assert!(Dialect::for_backend(Backend::Sqlite).fk_disable.is_some());
        assert!(Dialect::for_backend(Backend::Postgres).fk_disable.is_none());
        assert!(Dialect::for_backend(Backend::Postgres).advisory_locks);
    }

    proptest! {
        #[test]
        fn placeholder_count_matches_bare_question_marks(parts in proptest::collection::vec("[a-z =,]{0,8}", 1..8)) {
            let query = parts.join("?");
            let expected = parts.len() - 1;
            let rewritten = rewrite_placeholders(&query);
            prop_assert!(!rewritten.contains('?'));
            let last = format!("${expected}");
            if expected > 0 {
                prop_assert!(rewritten.contains(&last));
            }
            let next = format!("${}", expected + 1);
            prop_assert!(!rewritten.contains(&next));
        }

        #[test]
        fn quoted_segments_survive_verbatim(body in "[a-z?]{0,12}") {
            let query = format!("SELECT '{body}' WHERE x = ?");
            let rewritten = rewrite_placeholders(&query);
            let expected_prefix = format!("SELECT '{body}' WHERE x = ");
            prop_assert!(rewritten.starts_with(&expected_prefix));
            prop_assert!(rewritten.ends_with("$1"));
        }
    }
}
