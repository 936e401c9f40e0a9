// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers and shared-token checks.

pub mod locks;

pub use locks::{resilient_lock, resilient_read, resilient_write};

use subtle::ConstantTimeEq;

/// Compare a presented shared token against the expected one in constant time.
///
/// An empty `expected` token means authentication is disabled.
pub fn token_matches(expected: &str, presented: Option<&str>) -> bool {
    if expected.is_empty() {
        return true;
    }
    match presented {
        Some(presented) => expected.as_bytes().ct_eq(presented.as_bytes()).into(),
        None => false,
    }
}
