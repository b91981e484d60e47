//! Desired store layout and its reconciliation against the engine.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    rc::Rc,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{Capabilities, SchemaStore, UpgradeDatabase},
    error::{EngineError, Error, Result},
    key::KeyPath,
};

/// Desired shape of one store for an open call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    pub name: String,
    #[serde(default)]
    pub key_path: KeyPath,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub index_specs: Vec<IndexSpec>,
    /// Drop and recreate the store even if it already exists.
    #[serde(default)]
    pub reset: bool,
}

impl StoreSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = key_path.into();
        self
    }

    pub fn auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.index_specs.push(index);
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Whether the store produces its own primary keys.
    pub fn has_key(&self) -> bool {
        !self.key_path.is_none() || self.auto_increment
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            ..Self::default()
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn multi_entry(mut self, multi_entry: bool) -> Self {
        self.multi_entry = multi_entry;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Options passed to the engine when a store is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreParameters {
    pub key_path: KeyPath,
    pub auto_increment: bool,
}

impl From<&StoreSpec> for StoreParameters {
    fn from(spec: &StoreSpec) -> Self {
        Self {
            key_path: spec.key_path.clone(),
            auto_increment: spec.auto_increment,
        }
    }
}

/// Options passed to the engine when an index is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexParameters {
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
    pub locale: Option<String>,
}

impl From<&IndexSpec> for IndexParameters {
    fn from(spec: &IndexSpec) -> Self {
        Self {
            key_path: spec.key_path.clone(),
            unique: spec.unique,
            multi_entry: spec.multi_entry,
            locale: spec.locale.clone(),
        }
    }
}

/// Reject spec lists the reconciler cannot act on unambiguously.
pub fn validate_specs(specs: &[StoreSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.is_empty() {
            return Err(Error::invalid("store name must not be empty"));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::invalid(format!(
                "store \"{}\" is specified more than once",
                spec.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    /// Present and wanted; left untouched, indexes included.
    Remain,
    /// Wanted but absent; created with its indexes.
    New,
    /// Present but no longer wanted.
    Delete,
    /// Present and marked for reset; dropped and created again.
    Recreate,
}

/// One action for every store name that is present or desired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreUpdatePlan {
    actions: BTreeMap<String, StoreAction>,
}

impl StoreUpdatePlan {
    pub fn compute<S: AsRef<str>>(existing: &[S], specs: &[StoreSpec]) -> Self {
        let mut actions: BTreeMap<String, StoreAction> = existing
            .iter()
            .map(|name| (name.as_ref().to_owned(), StoreAction::Delete))
            .collect();

        for spec in specs {
            let action = match actions.get(&spec.name) {
                Some(_) if spec.reset => StoreAction::Recreate,
                Some(_) => StoreAction::Remain,
                None => StoreAction::New,
            };
            actions.insert(spec.name.clone(), action);
        }

        Self { actions }
    }

    pub fn action(&self, store: &str) -> Option<StoreAction> {
        self.actions.get(store).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, StoreAction)> {
        self.actions.iter().map(|(name, action)| (name.as_str(), *action))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Carry the plan out inside the upgrade phase.
    pub fn apply(
        &self,
        db: &dyn UpgradeDatabase,
        specs: &[StoreSpec],
        capabilities: Capabilities,
    ) -> std::result::Result<(), EngineError> {
        let by_name: HashMap<&str, &StoreSpec> =
            specs.iter().map(|spec| (spec.name.as_str(), spec)).collect();

        for (name, action) in self.iter() {
            match action {
                StoreAction::Remain => {}
                StoreAction::Delete => db.delete_object_store(name)?,
                StoreAction::Recreate => {
                    db.delete_object_store(name)?;
                    if let Some(spec) = by_name.get(name) {
                        create_store(db, spec, capabilities)?;
                    }
                }
                StoreAction::New => {
                    if let Some(spec) = by_name.get(name) {
                        create_store(db, spec, capabilities)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn create_store(
    db: &dyn UpgradeDatabase,
    spec: &StoreSpec,
    capabilities: Capabilities,
) -> std::result::Result<Rc<dyn SchemaStore>, EngineError> {
    let store = db.create_object_store(&spec.name, &StoreParameters::from(spec))?;

    for index in &spec.index_specs {
        let mut parameters = IndexParameters::from(index);
        if parameters.locale.is_some() && !capabilities.index_locale {
            tracing::warn!(
                store = %spec.name,
                index = %index.name,
                "engine does not support index locales, ignoring"
            );
            parameters.locale = None;
        }
        store.create_index(&index.name, &parameters)?;
    }

    Ok(store)
}

/// Compute and apply the plan for `specs` against the database being upgraded.
pub fn reconcile(
    db: &dyn UpgradeDatabase,
    specs: &[StoreSpec],
    capabilities: Capabilities,
) -> std::result::Result<StoreUpdatePlan, EngineError> {
    let plan = StoreUpdatePlan::compute(&db.object_store_names(), specs);
    tracing::debug!(?plan, "applying store update plan");
    plan.apply(db, specs, capabilities)?;
    Ok(plan)
}

/// Per store: does it produce its own keys, or does every write need one?
///
/// Built from the specs of the last successful open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HasKeyTable(HashMap<String, bool>);

impl HasKeyTable {
    pub fn from_specs(specs: &[StoreSpec]) -> Self {
        Self(
            specs
                .iter()
                .map(|spec| (spec.name.clone(), spec.has_key()))
                .collect(),
        )
    }

    pub fn get(&self, store: &str) -> Option<bool> {
        self.0.get(store).copied()
    }

    pub fn contains(&self, store: &str) -> bool {
        self.0.contains_key(store)
    }
}
