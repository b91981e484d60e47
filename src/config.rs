use serde::{Deserialize, Serialize};

use crate::{error::Result, schema::StoreSpec};

/// Everything needed to open a database, loadable from JSON.
///
/// ```
/// # use idb_kv::DatabaseConfig;
/// let config = DatabaseConfig::from_json(
///     r#"{
///         "name": "test",
///         "version": 1,
///         "stores": [{ "name": "kv", "keyPath": "key" }]
///     }"#,
/// )
/// .unwrap();
/// assert_eq!(config.stores[0].name, "kv");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub stores: Vec<StoreSpec>,
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            stores: Vec::new(),
        }
    }

    pub fn store(mut self, store: StoreSpec) -> Self {
        self.stores.push(store);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::DatabaseConfig;
    use crate::{
        error::Error,
        key::KeyPath,
        schema::{IndexSpec, StoreSpec},
    };

    #[test]
    fn from_json_with_option_names() {
        let config = DatabaseConfig::from_json(
            r#"{
                "name": "contacts",
                "version": 3,
                "stores": [
                    {
                        "name": "contact",
                        "keyPath": "id",
                        "autoIncrement": true,
                        "indexSpecs": [
                            { "name": "by_email", "keyPath": "email", "unique": true },
                            { "name": "by_tag", "keyPath": "tags", "multiEntry": true }
                        ]
                    },
                    { "name": "cache", "reset": true }
                ]
            }"#,
        )
        .unwrap();

        let expected = DatabaseConfig::new("contacts", 3)
            .store(
                StoreSpec::new("contact")
                    .key_path("id")
                    .auto_increment(true)
                    .index(IndexSpec::new("by_email", "email").unique(true))
                    .index(IndexSpec::new("by_tag", "tags").multi_entry(true)),
            )
            .store(StoreSpec::new("cache").reset(true));
        assert_eq!(config, expected);
        assert_eq!(config.stores[1].key_path, KeyPath::None);
    }

    #[test]
    fn compound_key_path() {
        let config = DatabaseConfig::from_json(
            r#"{ "name": "db", "version": 1, "stores": [{ "name": "s", "keyPath": ["a", "b"] }] }"#,
        )
        .unwrap();
        assert_eq!(
            config.stores[0].key_path,
            KeyPath::Multi(vec!["a".to_owned(), "b".to_owned()])
        );
    }

    #[test]
    fn missing_version_is_an_error() {
        let err = DatabaseConfig::from_json(r#"{ "name": "db" }"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn survives_json() {
        let config = DatabaseConfig::new("db", 2).store(StoreSpec::new("kv").key_path("key"));
        let json = config.to_json().unwrap();
        assert_eq!(DatabaseConfig::from_json(&json).unwrap(), config);
    }
}
