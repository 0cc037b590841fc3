// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection string assembly for the client/server backend.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::model::PostgresConfig;

/// Characters left unescaped in userinfo and path segments.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Build a `postgres://` URL from discrete settings.
///
/// Returns `None` unless host, user and database are all set. User, password
/// and database name are percent-encoded so credentials containing `@`, `:`
/// or `/` survive the round trip.
pub fn postgres_url(pg: &PostgresConfig) -> Option<String> {
    let host = pg.host.trim();
    let user = pg.user.trim();
    let database = pg.database.trim();
    if host.is_empty() || user.is_empty() || database.is_empty() {
        return None;
    }

    let mut userinfo = utf8_percent_encode(user, USERINFO).to_string();
    if let Some(password) = pg.password.as_deref() {
        userinfo.push(':');
        userinfo.push_str(&utf8_percent_encode(password, USERINFO).to_string());
    }

    // Bare IPv6 literals need brackets in the authority section.
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };

    Some(format!(
        "postgres://{userinfo}@{host}:{port}/{db}?sslmode={sslmode}&connect_timeout={timeout}",
        port = pg.port,
        db = utf8_percent_encode(database, USERINFO),
        sslmode = pg.sslmode,
        timeout = pg.connect_timeout_secs,
    ))
}

/// Same as [`postgres_url`] with the password replaced, for logging.
pub fn redacted_postgres_url(pg: &PostgresConfig) -> Option<String> {
    let mut masked = pg.clone();
    if masked.password.is_some() {
        masked.password = Some("***".to_string());
    }
    postgres_url(&masked)
}
