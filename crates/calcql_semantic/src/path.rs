//! Query paths.
//!
//! A query path joins the response keys from the root down to a field with
//! `#`. List indices never appear in a path.

/// Separator between path segments.
pub const SEPARATOR: char = '#';

/// Appends `key` to `parent`, or starts a path at the root.
pub fn join(parent: Option<&str>, key: &str) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => {
            let mut path = String::with_capacity(parent.len() + 1 + key.len());
            path.push_str(parent);
            path.push(SEPARATOR);
            path.push_str(key);
            path
        }
        _ => key.to_string(),
    }
}

/// Splits a path into its response keys.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// The last response key of a path.
pub fn leaf(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}
