// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

pub const PRIMARY_PREFIX: &[u8] = b"P:";
pub const RANGE_PREFIX: &[u8] = b"R:";

/// `P:<source-id>:<logical-path>`
pub fn primary_key(source: &str, logical_path: &Path) -> Vec<u8> {
    let path = logical_path.to_string_lossy();
    let mut key = Vec::with_capacity(2 + source.len() + 1 + path.len());
    key.extend_from_slice(PRIMARY_PREFIX);
    key.extend_from_slice(source.as_bytes());
    key.push(b':');
    key.extend_from_slice(path.as_bytes());
    key
}

/// `R:<primary-key>:<index>`
pub fn range_key(primary: &[u8], index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + primary.len() + 1 + 10);
    key.extend_from_slice(RANGE_PREFIX);
    key.extend_from_slice(primary);
    key.push(b':');
    key.extend_from_slice(index.to_string().as_bytes());
    key
}

/// Splits a range key back into `(primary_key, index)`. Returns `None` for
/// keys that are not well-formed range keys.
pub fn split_range_key(key: &[u8]) -> Option<(&[u8], u32)> {
    let rest = key.strip_prefix(RANGE_PREFIX)?;
    let colon = rest.iter().rposition(|&b| b == b':')?;
    let index = std::str::from_utf8(&rest[colon + 1..]).ok()?.parse().ok()?;
    Some((&rest[..colon], index))
}

/// The source name embedded in a primary key. Source names cannot contain
/// colons, so the first colon after the prefix is unambiguous.
pub fn primary_key_source(key: &[u8]) -> Option<&str> {
    let rest = key.strip_prefix(PRIMARY_PREFIX)?;
    let colon = rest.iter().position(|&b| b == b':')?;
    std::str::from_utf8(&rest[..colon]).ok()
}

/// Prefix under which every range checkpoint of `primary` sorts.
pub fn range_scan_prefix(primary: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(2 + primary.len() + 1);
    prefix.extend_from_slice(RANGE_PREFIX);
    prefix.extend_from_slice(primary);
    prefix.push(b':');
    prefix
}
