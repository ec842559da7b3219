//! Case-insensitive header storage.

use std::fmt;

/// An ordered, case-insensitive multi-map of header fields.
///
/// Field names are canonicalized on insertion (`content-length` becomes
/// `Content-Length`) so emission is deterministic; lookups ignore case.
/// Multiple values for the same name are kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.remove(name.as_ref());
        self.add(name, value);
    }

    /// Appends a value for `name`, keeping existing ones.
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.fields
            .push((canonical(name.as_ref()), value.into()));
    }

    /// Removes every value of `name`.
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when any comma-separated value of `name` equals `token`,
    /// case-insensitively. This is how `Connection: keep-alive, upgrade`
    /// style fields are meant to be queried.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|v| {
            v.split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Removes the listed tokens from the comma-separated values of `name`,
    /// dropping the field entirely when nothing remains.
    pub fn remove_tokens(&mut self, name: &str, tokens: &[&str]) {
        let mut kept: Vec<String> = Vec::new();
        for value in self.get_all(name) {
            let remaining: Vec<&str> = value
                .split(',')
                .map(str::trim)
                .filter(|item| {
                    !item.is_empty() && !tokens.iter().any(|t| t.eq_ignore_ascii_case(item))
                })
                .collect();
            if !remaining.is_empty() {
                kept.push(remaining.join(", "));
            }
        }
        self.remove(name);
        for value in kept {
            self.add(name, value);
        }
    }

    /// Serializes the fields as `Name: value\r\n` lines, without the final
    /// blank line.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

/// Canonical header-field casing: each dash-separated segment starts with
/// an uppercase letter, the rest is lowercase.
pub fn canonical(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if c == '-' {
            out.push('-');
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}
