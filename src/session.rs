//! Session parameters.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use crate::raw::escape_literal;

/// Run-time parameters a connection must carry, such as `search_path`.
///
/// Parameters are kept sorted by name so equal sets compare and hash equal
/// regardless of insertion order. The empty set hashes to 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    params: Arc<[(String, String)]>,
    hash: u64,
}

impl SessionParams {
    /// Build from name/value pairs. A repeated name keeps its last value.
    pub fn new<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let hash = if sorted.is_empty() {
            0
        } else {
            let mut hasher = DefaultHasher::new();
            sorted.hash(&mut hasher);
            hasher.finish()
        };
        Self {
            params: sorted.into_iter().collect(),
            hash,
        }
    }

    /// Identity used to match pooled connections.
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// These parameters overlaid with `other`.
    pub fn merged(&self, other: &SessionParams) -> Self {
        Self::new(self.iter().chain(other.iter()))
    }

    /// `SELECT set_config(...)` applying every parameter at session level.
    pub(crate) fn apply_sql(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let calls: Vec<String> = self
            .iter()
            .map(|(name, value)| {
                format!(
                    "set_config({}, {}, false)",
                    escape_literal(name),
                    escape_literal(value)
                )
            })
            .collect();
        Some(format!("SELECT {}", calls.join(", ")))
    }

    /// Reset a connection to server defaults, then apply these parameters.
    pub(crate) fn reconfigure_sql(&self) -> String {
        match self.apply_sql() {
            Some(apply) => format!("RESET ALL; {apply}"),
            None => "RESET ALL".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_does_not_matter() {
        let a = SessionParams::new([("search_path", "api"), ("timezone", "UTC")]);
        let b = SessionParams::new([("timezone", "UTC"), ("search_path", "api")]);
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_ne!(a.hash_value(), SessionParams::default().hash_value());
        assert_eq!(SessionParams::default().hash_value(), 0);
    }

    #[test]
    fn merge_overrides() {
        let base = SessionParams::new([("search_path", "public")]);
        let derived = base.merged(&SessionParams::new([("search_path", "api")]));
        assert_eq!(derived.get("search_path"), Some("api"));
    }

    #[test]
    fn reconfigure_statement() {
        let params = SessionParams::new([("search_path", "it's")]);
        assert_eq!(
            params.reconfigure_sql(),
            "RESET ALL; SELECT set_config('search_path', 'it''s', false)"
        );
        assert_eq!(SessionParams::default().reconfigure_sql(), "RESET ALL");
    }
}
