// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Validation utilities for store keys and lock names

use anyhow::Result;

/// Minimum length for a key
pub const MIN_KEY_LEN: usize = 1;

/// Maximum length for a key
pub const MAX_KEY_LEN: usize = 256;

/// Checks if a character is valid for a key or lock name.
/// Valid characters are ASCII alphanumeric, hyphens, underscores, dots, colons, and slashes.
pub fn is_valid_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')
}

/// Validates a counter key or lock name
pub fn validate_key(key: &str) -> Result<()> {
    let len = key.len();
    if !(MIN_KEY_LEN..=MAX_KEY_LEN).contains(&len) {
        return Err(anyhow::anyhow!(
            "Key length must be between {} and {} characters, got {}",
            MIN_KEY_LEN,
            MAX_KEY_LEN,
            len
        ));
    }

    if !key.chars().all(is_valid_key_char) {
        return Err(anyhow::anyhow!(
            "Key '{}' can only contain ASCII alphanumeric characters, hyphens, underscores, dots, colons, and slashes",
            key
        ));
    }

    Ok(())
}
