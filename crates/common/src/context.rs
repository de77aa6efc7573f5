//! [`EncryptionContext`]: the attribute set bound to every data key.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Fixed `purpose` attribute stamped on every context built for a session.
pub const PURPOSE: &str = "client-side-encryption";

pub const USER_ID: &str = "userId";
pub const SESSION_ID: &str = "sessionId";
pub const TIMESTAMP: &str = "timestamp";
pub const PURPOSE_KEY: &str = "purpose";

/// Ordered string-to-string mapping sent to the KMS alongside a data key.
///
/// Backed by a [`BTreeMap`], so iteration and serialisation are always
/// key-sorted. Two contexts compare equal exactly when their canonical
/// serialisations are byte-equal, independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionContext(BTreeMap<String, String>);

impl EncryptionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the context used when generating a data key for a session.
    pub fn for_session(user_id: &str, session_id: &str, timestamp_ms: u128) -> Self {
        let mut ctx = Self::new();
        ctx.insert(USER_ID, user_id);
        ctx.insert(SESSION_ID, session_id);
        ctx.insert(TIMESTAMP, timestamp_ms.to_string());
        ctx.insert(PURPOSE_KEY, PURPOSE);
        ctx
    }

    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Key-sorted JSON serialisation used for cache keys and equality.
    ///
    /// # Errors
    ///
    /// Propagates the serialiser error; a string map never produces one in
    /// practice.
    pub fn canonical(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// Copy the attributes into an unordered map, the shape most KMS SDKs take.
    pub fn to_hash_map(&self) -> HashMap<String, String> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EncryptionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_session_has_required_attributes() {
        let ctx = EncryptionContext::for_session("u1", "s1", 1_700_000_000_000);
        assert_eq!(ctx.get(USER_ID), Some("u1"));
        assert_eq!(ctx.get(SESSION_ID), Some("s1"));
        assert_eq!(ctx.get(TIMESTAMP), Some("1700000000000"));
        assert_eq!(ctx.get(PURPOSE_KEY), Some(PURPOSE));
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a: EncryptionContext = [("b", "2"), ("a", "1")].into_iter().collect();
        let b: EncryptionContext = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.canonical().unwrap(), b.canonical().unwrap());
    }

    #[test]
    fn canonical_is_key_sorted() {
        let ctx: EncryptionContext = [("z", "last"), ("a", "first")].into_iter().collect();
        assert_eq!(ctx.canonical().unwrap(), r#"{"a":"first","z":"last"}"#);
    }

    #[test]
    fn different_values_are_not_equal() {
        let a = EncryptionContext::for_session("u1", "s1", 1);
        let b = EncryptionContext::for_session("u1", "s2", 1);
        assert_ne!(a, b);
        assert_ne!(a.canonical().unwrap(), b.canonical().unwrap());
    }

    #[test]
    fn serialises_as_flat_object() {
        let ctx: EncryptionContext = [("userId", "u1")].into_iter().collect();
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"userId":"u1"}"#);
        let back: EncryptionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
