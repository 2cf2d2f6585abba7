//! Intent keys.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::app::AppId;

/// Globally unique intent key, scoped by the submitting application.
///
/// Keys come in two shapes, string and 64-bit numeric, and are totally
/// ordered by their rendered form, so the two shapes interleave
/// deterministically. Numeric keys render as lower-case hex with a `0x`
/// prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    text: String,
    numeric: Option<u64>,
    app_id: AppId,
    fingerprint: u64,
}

impl Key {
    /// Creates a string key scoped to `app_id`.
    pub fn of(key: impl Into<String>, app_id: AppId) -> Self {
        Self::build(key.into(), None, app_id)
    }

    /// Creates a numeric key scoped to `app_id`.
    #[must_use]
    pub fn of_numeric(key: u64, app_id: AppId) -> Self {
        Self::build(format!("{key:#x}"), Some(key), app_id)
    }

    fn build(text: String, numeric: Option<u64>, app_id: AppId) -> Self {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        app_id.name().hash(&mut hasher);
        let fingerprint = hasher.finish();
        Self {
            text,
            numeric,
            app_id,
            fingerprint,
        }
    }

    /// The application the key is scoped to.
    #[must_use]
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// The numeric value, when the key is numeric.
    #[must_use]
    pub fn numeric(&self) -> Option<u64> {
        self.numeric
    }

    /// Stable 64-bit fingerprint of the key.
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.fingerprint
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.app_id == other.app_id
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text
            .cmp(&other.text)
            .then_with(|| self.app_id.name().cmp(other.app_id.name()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppId {
        AppId::new(7, "lattice.test")
    }

    #[test]
    fn string_keys_with_equal_content_are_equal() {
        let a = Key::of("key3", app());
        let b = Key::of("key3", app());
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn numeric_keys_with_equal_content_are_equal() {
        let a = Key::of_numeric(0x3333, app());
        let b = Key::of_numeric(0x3333, app());
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn distinct_keys_differ() {
        let one = Key::of("key1", app());
        let two = Key::of("key2", app());
        let three = Key::of_numeric(0x1111, app());
        assert_ne!(one, two);
        assert_ne!(one, three);
        assert_ne!(two, three);
    }

    #[test]
    fn string_keys_order_lexicographically() {
        let one = Key::of("key1", app());
        let two = Key::of("key2", app());
        let three = Key::of("key3", app());
        assert!(one < two);
        assert!(two < three);
        assert!(one < three);
    }

    #[test]
    fn numeric_keys_order_by_rendered_form() {
        let one = Key::of_numeric(0x1111, app());
        let two = Key::of_numeric(0x2222, app());
        let three = Key::of_numeric(0x3333, app());
        assert!(one < two);
        assert!(two < three);
    }

    #[test]
    fn string_and_numeric_keys_interleave_by_rendered_form() {
        let zero = Key::of("0key1", app());
        let numeric = Key::of_numeric(0x1111, app());
        let string = Key::of("key2", app());

        // "0key1" < "0x1111" < "key2"
        assert!(zero < numeric);
        assert!(numeric < string);
        assert!(zero < string);
    }
}
