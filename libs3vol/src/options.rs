//! Mount option codec.
//!
//! Converts between the compact `key,key=value` form used on the command
//! line, in the registry document and on the mount helper command line, and
//! a [`MountOptions`] map.
//!
//! Parsing normalizes: bare keys become `"true"`, keys whose value is
//! `false` (any case) are dropped.  Serializing orders keys ascending and
//! renders `true`/empty values as bare keys, so `serialize(parse(s))` is a
//! canonical form of `s` rather than `s` itself.

use crate::error::{Result, VolError};
use crate::types::MountOptions;

/// Parse an option string into a map.
///
/// Empty input and empty entries (`a,,b`) are accepted.  An entry with an
/// empty key (`=x`) is rejected.
pub fn parse(s: &str) -> Result<MountOptions> {
    let mut options = MountOptions::new();
    for entry in s.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (entry, "true"),
        };
        if key.is_empty() {
            return Err(VolError::InvalidOption(entry.to_owned()));
        }
        if value.eq_ignore_ascii_case("false") {
            continue;
        }
        options.insert(key.to_owned(), value.to_owned());
    }
    Ok(options)
}

/// Render a map in canonical form.
pub fn serialize(options: &MountOptions) -> String {
    options
        .iter()
        .filter(|(_, value)| !value.eq_ignore_ascii_case("false"))
        .map(|(key, value)| {
            if value.is_empty() || value.eq_ignore_ascii_case("true") {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Overlay `overrides` on top of `defaults`; keys present in both take the
/// value from `overrides`.
pub fn merge(defaults: &MountOptions, overrides: &MountOptions) -> MountOptions {
    let mut merged = defaults.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
