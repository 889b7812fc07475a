//! Ordered header lists.
//!
//! Header order is part of a browser's fingerprint, so headers are kept as an
//! ordered list: lookups are case-insensitive, duplicates are preserved, and
//! names keep the caller's casing until a protocol driver lowercases them.

use crate::error::{Error, Result};

/// Ordered, case-insensitive header list that preserves duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append without touching existing entries of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every entry named `name` with a single one at the position of
    /// the first occurrence (or at the end).
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => {
                self.entries[idx] = (name.clone(), value);
                let mut i = 0;
                self.entries.retain(|(n, _)| {
                    let keep = i <= idx || !n.eq_ignore_ascii_case(&name);
                    i += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove every entry named `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Fill in every name from `defaults` that is not already present.
    ///
    /// Entries set here take precedence; names only in `defaults` are added
    /// with all their values.
    pub fn merge_defaults(&mut self, defaults: &Headers) {
        let own: Vec<String> = self.entries.iter().map(|(n, _)| n.to_ascii_lowercase()).collect();
        for (name, value) in &defaults.entries {
            if !own.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                self.entries.push((name.clone(), value.clone()));
            }
        }
    }

    /// Reorder in place: names listed in `order` first (in that order), then
    /// everything else in insertion order.
    pub fn apply_order(&mut self, order: &[&str]) {
        let rank = |name: &str| {
            order
                .iter()
                .position(|o| o.eq_ignore_ascii_case(name))
                .unwrap_or(order.len())
        };
        // stable sort keeps duplicates and unknown names in insertion order
        self.entries.sort_by_key(|(n, _)| rank(n));
    }

    /// Reject names and values that would corrupt the wire format.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in &self.entries {
            if !is_valid_name(name) {
                return Err(Error::local_protocol(format!("invalid header name {:?}", name)));
            }
            if !is_valid_value(value) {
                return Err(Error::local_protocol(format!(
                    "invalid value for header {:?}",
                    name
                )));
            }
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl<K, V> Extend<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        self.entries
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// RFC 9110 token characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}

/// No CR, LF or NUL.
pub fn is_valid_value(value: &str) -> bool {
    !value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0))
}

/// Hop-by-hop headers that must not be sent on HTTP/2 or HTTP/3 (RFC 9113 8.2.2).
pub(crate) fn is_connection_specific(name: &str) -> bool {
    const NAMES: [&str; 5] = [
        "connection",
        "keep-alive",
        "proxy-connection",
        "transfer-encoding",
        "upgrade",
    ];
    NAMES.iter().any(|n| n.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup_preserves_casing() {
        let mut h = Headers::new();
        h.append("X-Custom", "a");
        assert_eq!(h.get("x-custom"), Some("a"));
        assert_eq!(h.iter().next(), Some(("X-Custom", "a")));
    }

    #[test]
    fn test_duplicates_preserved() {
        let mut h = Headers::new();
        h.append("Set-Cookie", "a=1");
        h.append("set-cookie", "b=2");
        assert_eq!(h.get_all("SET-COOKIE").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut h: Headers = [("A", "1"), ("B", "2"), ("a", "3")].into_iter().collect();
        h.insert("a", "x");
        assert_eq!(
            h.iter().collect::<Vec<_>>(),
            vec![("a", "x"), ("B", "2")]
        );
    }

    #[test]
    fn test_merge_defaults_request_wins() {
        let defaults: Headers = [("User-Agent", "ua"), ("Accept", "*/*")].into_iter().collect();
        let mut h: Headers = [("accept", "text/html")].into_iter().collect();
        h.merge_defaults(&defaults);
        assert_eq!(h.get("Accept"), Some("text/html"));
        assert_eq!(h.get("user-agent"), Some("ua"));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_apply_order() {
        let mut h: Headers = [("X-Extra", "1"), ("accept", "a"), ("User-Agent", "u"), ("X-Two", "2")]
            .into_iter()
            .collect();
        h.apply_order(&["user-agent", "accept"]);
        let names: Vec<_> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["User-Agent", "accept", "X-Extra", "X-Two"]);
    }

    #[test]
    fn test_validate() {
        let ok: Headers = [("X-Ok", "fine value")].into_iter().collect();
        assert!(ok.validate().is_ok());

        let bad_name: Headers = [("Bad Name", "v")].into_iter().collect();
        assert_eq!(
            bad_name.validate().unwrap_err().kind(),
            crate::ErrorKind::LocalProtocolError
        );

        let bad_value: Headers = [("X", "a\r\nInjected: 1")].into_iter().collect();
        assert!(bad_value.validate().is_err());
    }

    #[test]
    fn test_connection_specific() {
        assert!(is_connection_specific("Connection"));
        assert!(is_connection_specific("transfer-encoding"));
        assert!(!is_connection_specific("te"));
    }
}
