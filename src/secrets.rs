use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

/// Placeholder written wherever a secret value would have appeared.
pub const REDACTED: &str = "[REDACTED]";

/// Values shorter than this are not redacted; they would match too much
/// unrelated text.
pub const MIN_REDACTED_LEN: usize = 3;

/// Read-only key to value view handed to one call.
///
/// Values are held as [`SecretString`] and never appear in `Debug` output.
/// There is no mutating method once the view is built.
#[derive(Clone, Default)]
pub struct SecretView {
    entries: Arc<BTreeMap<String, SecretString>>,
}

impl SecretView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        let entries = map
            .into_iter()
            .map(|(k, v)| (k, SecretString::from(v)))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Expose one value to the running script.
    pub(crate) fn expose(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.expose_secret())
    }

    /// Redactable values, longest first so overlapping secrets are fully
    /// replaced.
    fn redactable(&self) -> Vec<&str> {
        let mut values: Vec<&str> = self
            .entries
            .values()
            .map(|v| v.expose_secret())
            .filter(|v| v.len() >= MIN_REDACTED_LEN)
            .collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()));
        values.dedup();
        values
    }

    /// Replace every secret value in `text` with [`REDACTED`].
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for value in self.redactable() {
            if out.contains(value) {
                out = Cow::Owned(out.replace(value, REDACTED));
            }
        }
        out
    }

    /// Redact every string (and object key) inside a JSON value.
    pub fn redact_json(&self, value: &mut JsonValue) {
        if self.is_empty() {
            return;
        }
        match value {
            JsonValue::String(s) => {
                if let Cow::Owned(redacted) = self.redact(s) {
                    *s = redacted;
                }
            }
            JsonValue::Array(items) => {
                for item in items {
                    self.redact_json(item);
                }
            }
            JsonValue::Object(map) => {
                let entries = std::mem::take(map);
                for (key, mut item) in entries {
                    self.redact_json(&mut item);
                    map.insert(self.redact(&key).into_owned(), item);
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for SecretView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.keys().map(|k| (k, REDACTED)))
            .finish()
    }
}

impl<'de> Deserialize<'de> for SecretView {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(Self::from_map(map))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretView {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view() -> SecretView {
        [("API_KEY", "sk-live-12345"), ("SHORT", "ab"), ("PREFIX", "sk-live")]
            .into_iter()
            .collect()
    }

    #[test]
    fn debug_hides_values() {
        let dbg = format!("{:?}", view());
        assert!(dbg.contains("API_KEY"));
        assert!(!dbg.contains("sk-live-12345"));
        assert!(dbg.contains(REDACTED));
    }

    #[test]
    fn redacts_longest_first_and_skips_short_values() {
        let v = view();
        assert_eq!(
            v.redact("token=sk-live-12345 ab"),
            format!("token={REDACTED} ab")
        );
        assert_eq!(v.redact("nothing here"), "nothing here");
    }

    #[test]
    fn redacts_inside_json() {
        let v = view();
        let mut value = json!({"k": ["sk-live-12345", 1], "sk-live-12345": true});
        v.redact_json(&mut value);
        assert_eq!(value["k"][0], REDACTED);
        assert_eq!(value[REDACTED], true);
    }

    #[test]
    fn deserializes_from_plain_map() {
        let v: SecretView = serde_json::from_value(json!({"A": "alpha"})).unwrap();
        assert_eq!(v.expose("A"), Some("alpha"));
        assert!(v.contains_key("A"));
        assert_eq!(v.keys().collect::<Vec<_>>(), vec!["A"]);
    }
}
