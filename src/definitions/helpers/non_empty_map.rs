use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;

/// An ordered map that holds at least one entry. Decoding an empty map fails.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "BTreeMap<K, V>", into = "BTreeMap<K, V>")]
pub struct NonEmptyMap<K: Ord + Clone, V: Clone>(BTreeMap<K, V>);

#[derive(Debug, thiserror::Error)]
#[error("map must hold at least one entry")]
pub struct Empty;

impl<K: Ord + Clone, V: Clone> TryFrom<BTreeMap<K, V>> for NonEmptyMap<K, V> {
    type Error = Empty;

    fn try_from(map: BTreeMap<K, V>) -> Result<Self, Empty> {
        if map.is_empty() {
            Err(Empty)
        } else {
            Ok(Self(map))
        }
    }
}

impl<K: Ord + Clone, V: Clone> From<NonEmptyMap<K, V>> for BTreeMap<K, V> {
    fn from(NonEmptyMap(map): NonEmptyMap<K, V>) -> Self {
        map
    }
}

impl<K: Ord + Clone, V: Clone> Deref for NonEmptyMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
