//! Scan boundaries over a store's primary key order.

use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    key::Key,
};

/// Caller-facing description of a range: the whole store, or lower and/or
/// upper bounds with independent open/closed flags.
///
/// At least one of `full`, `lower` or `upper` has to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyRangeDescriptor {
    pub full: bool,
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRangeDescriptor {
    /// Every entry in the store.
    pub fn full() -> Self {
        Self {
            full: true,
            ..Self::default()
        }
    }

    /// Closed range `[lower, upper]`.
    pub fn bound(lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            ..Self::default()
        }
    }

    /// Exactly one key, expressed as a range.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self::bound(key.clone(), key)
    }

    pub fn lower_bound(lower: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(lower.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    pub fn upper_bound(upper: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(upper.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    pub fn lower_open(mut self, open: bool) -> Self {
        self.lower_open = open;
        self
    }

    pub fn upper_open(mut self, open: bool) -> Self {
        self.upper_open = open;
        self
    }

    /// Resolve into the range the engine scans. `None` means the whole store.
    pub fn resolve(&self) -> Result<Option<KeyRange>> {
        if self.full {
            return Ok(None);
        }

        let bound = |key: &Option<Key>, open: bool| match key {
            Some(key) if open => Bound::Excluded(key.clone()),
            Some(key) => Bound::Included(key.clone()),
            None => Bound::Unbounded,
        };

        match (&self.lower, &self.upper) {
            (None, None) => Err(Error::invalid("must specify full, lower, or upper")),
            _ => KeyRange::new(
                bound(&self.lower, self.lower_open),
                bound(&self.upper, self.upper_open),
            )
            .map(Some),
        }
    }
}

impl TryFrom<&Value> for KeyRangeDescriptor {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::invalid(
                "expected a key range descriptor; use the single-key operation for a bare key",
            ));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid(format!("malformed key range descriptor: {}", e)))
    }
}

/// A resolved, non-empty range with at least one bound.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    lower: Bound<Key>,
    upper: Bound<Key>,
}

impl KeyRange {
    pub fn new(lower: Bound<Key>, upper: Bound<Key>) -> Result<Self> {
        if let (Some((l, l_open)), Some((u, u_open))) = (endpoint(&lower), endpoint(&upper)) {
            if l > u || (l == u && (l_open || u_open)) {
                return Err(Error::invalid("lower bound is greater than upper bound"));
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn lower(&self) -> Bound<&Key> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Bound<&Key> {
        self.upper.as_ref()
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    pub fn bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.lower(), self.upper())
    }
}

fn endpoint(bound: &Bound<Key>) -> Option<(&Key, bool)> {
    match bound {
        Bound::Included(key) => Some((key, false)),
        Bound::Excluded(key) => Some((key, true)),
        Bound::Unbounded => None,
    }
}

/// What `delete_items` removes: a list of individual keys or a range.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    Keys(Vec<Key>),
    Range(KeyRangeDescriptor),
}

impl TryFrom<&Value> for DeleteTarget {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    Key::from_value(item)
                        .ok_or_else(|| Error::invalid(format!("{} is not a valid key", item)))
                })
                .collect::<Result<Vec<_>>>()
                .map(DeleteTarget::Keys),
            Value::Object(_) => KeyRangeDescriptor::try_from(value).map(DeleteTarget::Range),
            _ => Err(Error::invalid(
                "expected an array of keys or a key range descriptor; use delete_item for a bare key",
            )),
        }
    }
}

/// Arguments accepted where a range is expected.
///
/// Implemented for descriptors and for loosely typed JSON, where a bare key is
/// rejected rather than guessed at.
pub trait IntoKeyRange {
    fn into_key_range(self) -> Result<KeyRangeDescriptor>;
}

impl IntoKeyRange for KeyRangeDescriptor {
    fn into_key_range(self) -> Result<KeyRangeDescriptor> {
        Ok(self)
    }
}

impl IntoKeyRange for &KeyRangeDescriptor {
    fn into_key_range(self) -> Result<KeyRangeDescriptor> {
        Ok(self.clone())
    }
}

impl IntoKeyRange for &Value {
    fn into_key_range(self) -> Result<KeyRangeDescriptor> {
        KeyRangeDescriptor::try_from(self)
    }
}

impl IntoKeyRange for Value {
    fn into_key_range(self) -> Result<KeyRangeDescriptor> {
        KeyRangeDescriptor::try_from(&self)
    }
}

/// Arguments accepted by `delete_items`.
pub trait IntoDeleteTarget {
    fn into_delete_target(self) -> Result<DeleteTarget>;
}

impl IntoDeleteTarget for DeleteTarget {
    fn into_delete_target(self) -> Result<DeleteTarget> {
        Ok(self)
    }
}

impl IntoDeleteTarget for KeyRangeDescriptor {
    fn into_delete_target(self) -> Result<DeleteTarget> {
        Ok(DeleteTarget::Range(self))
    }
}

impl IntoDeleteTarget for Vec<Key> {
    fn into_delete_target(self) -> Result<DeleteTarget> {
        Ok(DeleteTarget::Keys(self))
    }
}

impl IntoDeleteTarget for &[Key] {
    fn into_delete_target(self) -> Result<DeleteTarget> {
        Ok(DeleteTarget::Keys(self.to_vec()))
    }
}

impl IntoDeleteTarget for &Value {
    fn into_delete_target(self) -> Result<DeleteTarget> {
        DeleteTarget::try_from(self)
    }
}

impl IntoDeleteTarget for Value {
    fn into_delete_target(self) -> Result<DeleteTarget> {
        DeleteTarget::try_from(&self)
    }
}

#[cfg(test)]
mod test {
    use std::ops::Bound;

    use serde_json::json;

    use super::{DeleteTarget, KeyRange, KeyRangeDescriptor};
    use crate::{error::Error, key::Key};

    #[test]
    fn full_resolves_to_whole_store() {
        assert_eq!(KeyRangeDescriptor::full().resolve().unwrap(), None);
    }

    #[test]
    fn empty_descriptor_is_rejected() {
        let err = KeyRangeDescriptor::default().resolve().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("full, lower, or upper")));
    }

    #[test]
    fn one_sided_ranges() {
        let range = KeyRangeDescriptor::lower_bound("m", true).resolve().unwrap().unwrap();
        assert_eq!(range.bounds(), (Bound::Excluded(&Key::from("m")), Bound::Unbounded));
        assert!(!range.contains(&Key::from("m")));
        assert!(range.contains(&Key::from("z")));

        let range = KeyRangeDescriptor::upper_bound(5, false).resolve().unwrap().unwrap();
        assert_eq!(range.bounds(), (Bound::Unbounded, Bound::Included(&Key::from(5))));
        assert!(range.contains(&Key::from(5)));
        assert!(!range.contains(&Key::from("a")));
    }

    #[test]
    fn bounded_range_flags_are_independent() {
        let range = KeyRangeDescriptor::bound(1, 3)
            .lower_open(true)
            .resolve()
            .unwrap()
            .unwrap();
        assert!(!range.contains(&Key::from(1)));
        assert!(range.contains(&Key::from(2)));
        assert!(range.contains(&Key::from(3)));
    }

    #[test]
    fn inverted_or_empty_bounds_are_rejected() {
        assert!(KeyRangeDescriptor::bound(3, 1).resolve().is_err());
        assert!(KeyRange::new(Bound::Excluded(Key::from(1)), Bound::Included(Key::from(1))).is_err());
        assert!(KeyRangeDescriptor::only("a").resolve().is_ok());
    }

    #[test]
    fn descriptor_from_json() {
        let descriptor =
            KeyRangeDescriptor::try_from(&json!({"lower": "a", "upper": "a", "upperOpen": false}))
                .unwrap();
        assert_eq!(descriptor, KeyRangeDescriptor::only("a"));
    }

    #[test]
    fn bare_keys_are_not_ranges() {
        assert!(matches!(
            KeyRangeDescriptor::try_from(&json!("a")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            DeleteTarget::try_from(&json!(42)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn delete_target_from_json() {
        assert_eq!(
            DeleteTarget::try_from(&json!(["a", 2])).unwrap(),
            DeleteTarget::Keys(vec![Key::from("a"), Key::from(2)])
        );
        assert_eq!(
            DeleteTarget::try_from(&json!({"full": true})).unwrap(),
            DeleteTarget::Range(KeyRangeDescriptor::full())
        );
        assert!(DeleteTarget::try_from(&json!([true])).is_err());
    }
}
