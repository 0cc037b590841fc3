// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Tessera storage engine.
//!
//! Provides the error taxonomy and the small set of types shared by the
//! configuration, storage, and metrics crates.

pub mod error;
pub mod types;

pub use error::{BoxError, TesseraError};
pub use types::{Backend, HealthStatus};
