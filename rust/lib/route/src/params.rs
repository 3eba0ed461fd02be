use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Flat map of path and query params.
///
/// Values are always strings at the matcher boundary; use [`Params::get_as`]
/// to parse them into typed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.to_string(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse a param into `T`. `None` if missing or unparsable.
    ///
    /// ```ignore
    /// let id: u32 = params.get_as("id")?;
    /// ```
    pub fn get_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Keep only the entries whose key satisfies `keep`.
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.0.retain(|k, _| keep(k));
    }

    /// Compare `self` (the old params) against `next`.
    pub fn diff(&self, next: &Params) -> ParamsDiff {
        let mut diff = ParamsDiff::default();
        for (key, old) in &self.0 {
            match next.0.get(key) {
                None => {
                    diff.removed.insert(key.clone());
                }
                Some(new) if new != old => {
                    diff.changed.insert(key.clone());
                }
                Some(_) => {}
            }
        }
        for key in next.0.keys() {
            if !self.0.contains_key(key) {
                diff.added.insert(key.clone());
            }
        }
        diff
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Params {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Names of params that differ between two param sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamsDiff {
    /// Present only in the new params.
    pub added: BTreeSet<String>,
    /// Present only in the old params.
    pub removed: BTreeSet<String>,
    /// Present in both with different values.
    pub changed: BTreeSet<String>,
}

impl ParamsDiff {
    /// Every param name that differs, in any way.
    pub fn all(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.changed)
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.added.contains(name) || self.removed.contains(name) || self.changed.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

// ── Query strings ──

/// Parse a query string (without the leading `?`) into decoded pairs.
///
/// A key without `=` gets an empty value. Pairs that fail to decode are
/// skipped.
pub(crate) fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(k).ok()?;
            let v = urlencoding::decode(v).ok()?;
            Some((k.into_owned(), v.into_owned()))
        })
        .collect()
}

/// Format pairs as `a=1&b=2`, percent-encoding keys and values.
pub(crate) fn format_query<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
