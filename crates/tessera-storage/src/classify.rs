// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Read/write routing by leading keyword.
//!
//! Text sniffing is a heuristic: a `WITH ... INSERT` statement starts with
//! `WITH` and is classified as a read. Callers with such statements use
//! [`Database::exec_on_writer`](crate::Database::exec_on_writer).

const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "UPSERT", "REPLACE", "DELETE", "COMMIT", "ROLLBACK", "BEGIN", "CREATE",
    "ALTER", "DROP", "VACUUM",
];

/// Which endpoint a statement is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Writer,
    Reader,
}

/// The first keyword of `query`, skipping whitespace, `--` and `/* */` comments.
pub fn leading_keyword(query: &str) -> Option<&str> {
    let bytes = query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b if b.is_ascii_whitespace() || b == b'(' || b == b';' => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut depth = 1;
                i += 2;
                while i < bytes.len() && depth > 0 {
                    if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                        depth += 1;
                        i += 2;
                    } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        depth -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
            }
            _ => break,
        }
    }
    let start = i;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    (i > start).then(|| &query[start..i])
}

/// Whether `query` mutates state and must run on the write slot.
pub fn is_write(query: &str) -> bool {
    leading_keyword(query)
        .is_some_and(|kw| WRITE_KEYWORDS.iter().any(|w| w.eq_ignore_ascii_case(kw)))
}

pub fn route(query: &str) -> Route {
    if is_write(query) {
        Route::Writer
    } else {
        Route::Reader
    }
}
