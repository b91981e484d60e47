use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A primary key as the engine orders it.
///
/// Keys of different kinds order as `Number < String < Array`; arrays compare
/// element by element, a shorter prefix sorting first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    /// Convert a JSON value into a key. Booleans, nulls and objects are not
    /// valid keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_f64().map(Key::Number),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                Value::from(*n as i64)
            }
            Key::Number(n) => Value::from(*n),
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

macro_rules! key_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Key {
                fn from(n: $ty) -> Key {
                    Key::Number(n as f64)
                }
            }
        )*
    };
}

key_from_number!(i32, i64, u32, u64, f64);

impl From<String> for Key {
    fn from(s: String) -> Key {
        Key::String(s)
    }
}

impl<'a> From<&'a str> for Key {
    fn from(s: &'a str) -> Key {
        Key::String(s.to_owned())
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Key {
        Key::Array(items)
    }
}

/// The path to the key inside a stored value.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// Keys are stored *out-of-line* and passed with every write.
    #[default]
    None,
    /// Dotted path to a single property.
    Single(String),
    /// One dotted path per component of a compound key.
    Multi(Vec<String>),
}

impl KeyPath {
    pub fn is_none(&self) -> bool {
        matches!(self, KeyPath::None)
    }

    /// Extract the key this path selects from `value`.
    pub fn evaluate(&self, value: &Value) -> Option<Key> {
        match self {
            KeyPath::None => None,
            KeyPath::Single(path) => lookup(value, path).and_then(Key::from_value),
            KeyPath::Multi(paths) => paths
                .iter()
                .map(|path| lookup(value, path).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// Write a generated key into `value` at this path, creating intermediate
    /// objects. Only single paths into objects can receive a key.
    pub fn inject(&self, value: &mut Value, key: &Key) -> bool {
        let path = match self {
            KeyPath::Single(path) if !path.is_empty() => path,
            _ => return false,
        };

        let mut segments = path.split('.').peekable();
        let mut current = value;
        while let Some(segment) = segments.next() {
            let object = match current.as_object_mut() {
                Some(object) => object,
                None => return false,
            };
            if segments.peek().is_none() {
                object.insert(segment.to_owned(), key.to_value());
                return true;
            }
            current = object
                .entry(segment.to_owned())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        false
    }
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

impl From<Vec<String>> for KeyPath {
    fn from(inner: Vec<String>) -> KeyPath {
        KeyPath::Multi(inner)
    }
}

impl<S> From<&[S]> for KeyPath
where
    S: AsRef<str>,
{
    fn from(inner: &[S]) -> KeyPath {
        KeyPath::Multi(inner.iter().map(|s| s.as_ref().to_owned()).collect())
    }
}

impl From<String> for KeyPath {
    fn from(inner: String) -> KeyPath {
        KeyPath::Single(inner)
    }
}

impl<'a> From<&'a str> for KeyPath {
    fn from(inner: &'a str) -> KeyPath {
        KeyPath::Single(inner.to_owned())
    }
}

impl From<()> for KeyPath {
    fn from((): ()) -> KeyPath {
        KeyPath::None
    }
}

#[cfg(test)]
mod test {
    use super::{Key, KeyPath};
    use serde_json::json;

    #[test]
    fn keys_order_by_kind_then_value() {
        let mut keys = vec![
            Key::from(vec![Key::from(1)]),
            Key::from("b"),
            Key::from(10),
            Key::from("a"),
            Key::from(-2.5),
            Key::from(Vec::new()),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::from(-2.5),
                Key::from(10),
                Key::from("a"),
                Key::from("b"),
                Key::from(Vec::new()),
                Key::from(vec![Key::from(1)]),
            ]
        );
    }

    #[test]
    fn booleans_and_objects_are_not_keys() {
        assert_eq!(Key::from_value(&json!(true)), None);
        assert_eq!(Key::from_value(&json!({"a": 1})), None);
        assert_eq!(Key::from_value(&json!([1, null])), None);
        assert_eq!(Key::from_value(&json!([1, "x"])), Some(Key::from(vec![Key::from(1), Key::from("x")])));
    }

    #[test]
    fn key_path_evaluation() {
        let value = json!({"id": 7, "name": {"first": "Ada"}});

        assert_eq!(KeyPath::from("id").evaluate(&value), Some(Key::from(7)));
        assert_eq!(KeyPath::from("name.first").evaluate(&value), Some(Key::from("Ada")));
        assert_eq!(KeyPath::from("missing").evaluate(&value), None);
        assert_eq!(KeyPath::None.evaluate(&value), None);
        assert_eq!(
            KeyPath::from(&["id", "name.first"][..]).evaluate(&value),
            Some(Key::from(vec![Key::from(7), Key::from("Ada")]))
        );
    }

    #[test]
    fn key_path_injection_creates_parents() {
        let mut value = json!({"body": "x"});
        assert!(KeyPath::from("meta.id").inject(&mut value, &Key::from(3)));
        assert_eq!(value, json!({"body": "x", "meta": {"id": 3}}));

        let mut scalar = json!(5);
        assert!(!KeyPath::from("id").inject(&mut scalar, &Key::from(3)));
    }

    #[test]
    fn key_path_deserializes_from_option_bag_shapes() {
        let single: KeyPath = serde_json::from_value(json!("key")).unwrap();
        let multi: KeyPath = serde_json::from_value(json!(["a", "b"])).unwrap();
        let none: KeyPath = serde_json::from_value(json!(null)).unwrap();

        assert_eq!(single, KeyPath::Single("key".into()));
        assert_eq!(multi, KeyPath::Multi(vec!["a".into(), "b".into()]));
        assert_eq!(none, KeyPath::None);
    }
}
