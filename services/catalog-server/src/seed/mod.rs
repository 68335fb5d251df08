//! Reference-data bootstrap.
//!
//! A [`SeedCatalog`] is an ordered list of [`SeedRecordSet`]s. Records may
//! point at rows of an earlier set through a [`SymbolicRef`]; those are
//! resolved to the ids created (or found) earlier in the same run.
//!
//! Whether a set is already present is decided by a row count taken before
//! inserting, never by relying on a unique-constraint failure.

pub mod catalog;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::store::{Record, RecordValue, ReferenceStore, StoreError};

/// Seeding errors. None of these abort startup.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("store operation on '{entity}' failed: {source}")]
    Store {
        entity: String,
        #[source]
        source: StoreError,
    },

    #[error("'{from}' references {entity} '{key}', which was not created")]
    UnresolvedReference {
        from: String,
        entity: String,
        key: String,
    },

    #[error("invalid seed catalog: {0}")]
    InvalidCatalog(String),

    #[error("unknown seed set '{0}'")]
    UnknownSet(String),
}

/// Pointer to a row of an earlier set, by that set's key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicRef {
    pub entity: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedValue {
    Literal(RecordValue),
    Reference(SymbolicRef),
}

pub fn text(value: &str) -> SeedValue {
    SeedValue::Literal(RecordValue::Text(value.to_string()))
}

pub fn integer(value: i64) -> SeedValue {
    SeedValue::Literal(RecordValue::Integer(value))
}

pub fn reference(entity: &str, key: &str) -> SeedValue {
    SeedValue::Reference(SymbolicRef {
        entity: entity.to_string(),
        key: key.to_string(),
    })
}

pub type RecordTemplate = BTreeMap<String, SeedValue>;

/// One reference entity and the rows it must contain.
#[derive(Debug, Clone)]
pub struct SeedRecordSet {
    /// Table name; doubles as the idempotency key.
    pub entity: String,
    /// Text column other sets use to refer to rows of this set.
    pub key_field: String,
    pub records: Vec<RecordTemplate>,
}

impl SeedRecordSet {
    pub fn new(entity: &str, key_field: &str) -> Self {
        Self {
            entity: entity.to_string(),
            key_field: key_field.to_string(),
            records: Vec::new(),
        }
    }

    pub fn record<const N: usize>(mut self, fields: [(&str, SeedValue); N]) -> Self {
        self.records.push(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        );
        self
    }

    pub fn idempotency_key(&self) -> &str {
        &self.entity
    }

    fn references(&self) -> impl Iterator<Item = &SymbolicRef> {
        self.records.iter().flat_map(|r| r.values()).filter_map(|v| match v {
            SeedValue::Reference(r) => Some(r),
            SeedValue::Literal(_) => None,
        })
    }
}

/// How `populate` decides a set is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedGate {
    /// Each set is gated on its own row count.
    #[default]
    PerSet,
    /// The first set's row count gates every set.
    Anchor,
}

impl FromStr for SeedGate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-set" | "per_set" | "perset" => Ok(Self::PerSet),
            "anchor" => Ok(Self::Anchor),
            other => Err(format!("unknown seed gate '{other}' (expected per-set or anchor)")),
        }
    }
}

impl fmt::Display for SeedGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerSet => f.write_str("per-set"),
            Self::Anchor => f.write_str("anchor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted(usize),
    AlreadyPopulated,
    Failed(String),
}

/// Result of one `populate` run, in catalog order.
#[derive(Debug, Clone, Default)]
pub struct SeedReport {
    pub outcomes: Vec<(String, SetOutcome)>,
}

impl SeedReport {
    pub fn inserted_total(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                SetOutcome::Inserted(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|(entity, o)| match o {
            SetOutcome::Failed(msg) => Some((entity.as_str(), msg.as_str())),
            _ => None,
        })
    }

    pub fn outcome(&self, entity: &str) -> Option<&SetOutcome> {
        self.outcomes
            .iter()
            .find(|(e, _)| e == entity)
            .map(|(_, o)| o)
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    fn push(&mut self, entity: &str, outcome: SetOutcome) {
        self.outcomes.push((entity.to_string(), outcome));
    }
}

/// Resolved ids per entity: key -> id.
type Resolved = HashMap<String, HashMap<String, i64>>;

/// Declarative reference data plus the idempotency gate.
pub struct SeedCatalog {
    store: Arc<dyn ReferenceStore>,
    sets: Vec<SeedRecordSet>,
    gate: SeedGate,
    referenced: HashSet<String>,
}

impl SeedCatalog {
    /// Validate and build a catalog.
    ///
    /// Sets must be declared in dependency order: every reference targets a
    /// set declared earlier and a key that set actually contains.
    pub fn new(
        store: Arc<dyn ReferenceStore>,
        sets: Vec<SeedRecordSet>,
        gate: SeedGate,
    ) -> Result<Self, SeedError> {
        let mut keys: HashMap<&str, HashSet<String>> = HashMap::new();
        let mut referenced = HashSet::new();

        for set in &sets {
            if keys.contains_key(set.entity.as_str()) {
                return Err(SeedError::InvalidCatalog(format!(
                    "set '{}' declared twice",
                    set.entity
                )));
            }

            let columns = set.records.first().map(|r| r.keys().collect::<Vec<_>>());
            for record in &set.records {
                if Some(record.keys().collect::<Vec<_>>()) != columns {
                    return Err(SeedError::InvalidCatalog(format!(
                        "records of '{}' do not share the same columns",
                        set.entity
                    )));
                }
            }

            for r in set.references() {
                let known = keys.get(r.entity.as_str()).ok_or_else(|| {
                    SeedError::InvalidCatalog(format!(
                        "'{}' references '{}', which is not declared before it",
                        set.entity, r.entity
                    ))
                })?;
                if !known.contains(&r.key) {
                    return Err(SeedError::InvalidCatalog(format!(
                        "'{}' references unknown {} '{}'",
                        set.entity, r.entity, r.key
                    )));
                }
                referenced.insert(r.entity.clone());
            }

            let mut set_keys = HashSet::new();
            for record in &set.records {
                match record.get(&set.key_field) {
                    Some(SeedValue::Literal(value)) => {
                        set_keys.insert(value.to_string());
                    }
                    _ => {
                        return Err(SeedError::InvalidCatalog(format!(
                            "a record of '{}' has no literal '{}'",
                            set.entity, set.key_field
                        )))
                    }
                }
            }
            keys.insert(set.entity.as_str(), set_keys);
        }

        Ok(Self {
            store,
            sets,
            gate,
            referenced,
        })
    }

    pub fn gate(&self) -> SeedGate {
        self.gate
    }

    pub fn sets(&self) -> &[SeedRecordSet] {
        &self.sets
    }

    /// Whether the set identified by `idempotency_key` is already present.
    ///
    /// Under [`SeedGate::Anchor`] the answer for every key is the first set's.
    pub async fn is_populated(&self, idempotency_key: &str) -> Result<bool, SeedError> {
        let set = self
            .sets
            .iter()
            .find(|s| s.idempotency_key() == idempotency_key)
            .ok_or_else(|| SeedError::UnknownSet(idempotency_key.to_string()))?;

        let gate_set = match self.gate {
            SeedGate::PerSet => set,
            SeedGate::Anchor => &self.sets[0],
        };
        Ok(self.count(gate_set).await? > 0)
    }

    /// Insert every missing set, in declared order.
    ///
    /// Never fails: per-set errors are logged and recorded in the report, and
    /// the remaining sets are still attempted.
    #[instrument(skip(self), fields(gate = %self.gate))]
    pub async fn populate(&self) -> SeedReport {
        let mut report = SeedReport::default();
        let mut resolved = Resolved::new();

        if self.gate == SeedGate::Anchor {
            if let Some(anchor) = self.sets.first() {
                match self.is_populated(anchor.idempotency_key()).await {
                    Ok(true) => {
                        info!(anchor = %anchor.entity, "Reference data already present");
                        for set in &self.sets {
                            report.push(&set.entity, SetOutcome::AlreadyPopulated);
                        }
                        return report;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(anchor = %anchor.entity, error = %e, "Failed to check reference data");
                        for set in &self.sets {
                            report.push(&set.entity, SetOutcome::Failed(e.to_string()));
                        }
                        return report;
                    }
                }
            }
        }

        for set in &self.sets {
            if self.gate == SeedGate::PerSet {
                match self.count(set).await {
                    Ok(0) => {}
                    Ok(existing) => {
                        debug!(entity = %set.entity, existing, "Set already populated");
                        self.load_existing(set, &mut resolved).await;
                        report.push(&set.entity, SetOutcome::AlreadyPopulated);
                        continue;
                    }
                    Err(e) => {
                        error!(entity = %set.entity, error = %e, "Failed to count reference rows");
                        report.push(&set.entity, SetOutcome::Failed(e.to_string()));
                        continue;
                    }
                }
            }

            match self.insert_set(set, &resolved).await {
                Ok(ids) => {
                    info!(entity = %set.entity, created = ids.len(), "Reference data created");
                    report.push(&set.entity, SetOutcome::Inserted(ids.len()));
                    resolved.insert(set.entity.clone(), ids);
                }
                Err(e) => {
                    error!(entity = %set.entity, error = %e, "Failed to seed reference data");
                    report.push(&set.entity, SetOutcome::Failed(e.to_string()));
                }
            }
        }

        report
    }

    async fn count(&self, set: &SeedRecordSet) -> Result<i64, SeedError> {
        self.store
            .count_rows(&set.entity)
            .await
            .map_err(|source| SeedError::Store {
                entity: set.entity.clone(),
                source,
            })
    }

    /// Load ids of an existing set if later sets point at it.
    async fn load_existing(&self, set: &SeedRecordSet, resolved: &mut Resolved) {
        if !self.referenced.contains(&set.entity) {
            return;
        }
        match self.store.fetch_keys(&set.entity, &set.key_field).await {
            Ok(keys) => {
                resolved.insert(set.entity.clone(), keys.into_iter().collect());
            }
            Err(e) => {
                warn!(entity = %set.entity, error = %e, "Failed to load existing reference keys");
            }
        }
    }

    async fn insert_set(
        &self,
        set: &SeedRecordSet,
        resolved: &Resolved,
    ) -> Result<HashMap<String, i64>, SeedError> {
        let rows = set
            .records
            .iter()
            .map(|template| resolve(&set.entity, template, resolved))
            .collect::<Result<Vec<Record>, _>>()?;

        let created = self
            .store
            .insert_rows(&set.entity, &set.key_field, &rows)
            .await
            .map_err(|source| SeedError::Store {
                entity: set.entity.clone(),
                source,
            })?;
        Ok(created.into_iter().collect())
    }
}

fn resolve(from: &str, template: &RecordTemplate, resolved: &Resolved) -> Result<Record, SeedError> {
    template
        .iter()
        .map(|(column, value)| {
            let value = match value {
                SeedValue::Literal(v) => v.clone(),
                SeedValue::Reference(r) => resolved
                    .get(&r.entity)
                    .and_then(|ids| ids.get(&r.key))
                    .map(|id| RecordValue::Integer(*id))
                    .ok_or_else(|| SeedError::UnresolvedReference {
                        from: from.to_string(),
                        entity: r.entity.clone(),
                        key: r.key.clone(),
                    })?,
            };
            Ok::<_, SeedError>((column.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRelationalStore, StoreDriver};

    fn small_sets() -> Vec<SeedRecordSet> {
        vec![
            SeedRecordSet::new("statuses", "name")
                .record([("name", text("Activo"))])
                .record([("name", text("Inactivo"))]),
            SeedRecordSet::new("genres", "name")
                .record([("name", text("Drama")), ("status_id", reference("statuses", "Activo"))]),
        ]
    }

    async fn connected_store() -> Arc<MemoryRelationalStore> {
        let store = Arc::new(MemoryRelationalStore::with_tables(["statuses", "genres"]));
        store.connect().await.unwrap();
        store
    }

    #[test]
    fn test_seed_gate_parse() {
        assert_eq!("per-set".parse::<SeedGate>().unwrap(), SeedGate::PerSet);
        assert_eq!("ANCHOR".parse::<SeedGate>().unwrap(), SeedGate::Anchor);
        assert!("sometimes".parse::<SeedGate>().is_err());
    }

    #[tokio::test]
    async fn test_forward_reference_rejected() {
        let store = connected_store().await;
        let mut sets = small_sets();
        sets.reverse();
        let err = SeedCatalog::new(store, sets, SeedGate::PerSet).err().unwrap();
        assert!(matches!(err, SeedError::InvalidCatalog(_)));
    }

    #[tokio::test]
    async fn test_unknown_reference_key_rejected() {
        let store = connected_store().await;
        let sets = vec![
            SeedRecordSet::new("statuses", "name").record([("name", text("Activo"))]),
            SeedRecordSet::new("genres", "name")
                .record([("name", text("Drama")), ("status_id", reference("statuses", "Retirado"))]),
        ];
        assert!(SeedCatalog::new(store, sets, SeedGate::PerSet).is_err());
    }

    #[tokio::test]
    async fn test_mixed_columns_rejected() {
        let store = connected_store().await;
        let sets = vec![SeedRecordSet::new("statuses", "name")
            .record([("name", text("Activo"))])
            .record([("name", text("Inactivo")), ("extra", integer(1))])];
        assert!(SeedCatalog::new(store, sets, SeedGate::PerSet).is_err());
    }

    #[tokio::test]
    async fn test_references_resolve_to_created_ids() {
        let store = connected_store().await;
        let catalog = SeedCatalog::new(store.clone(), small_sets(), SeedGate::PerSet).unwrap();

        let report = catalog.populate().await;
        assert!(report.is_clean());
        assert_eq!(report.inserted_total(), 3);

        let activo_id = store
            .rows("statuses")
            .into_iter()
            .find(|(_, row)| row["name"] == RecordValue::Text("Activo".into()))
            .map(|(id, _)| id)
            .unwrap();
        let genres = store.rows("genres");
        assert_eq!(genres[0].1["status_id"], RecordValue::Integer(activo_id));
    }

    #[tokio::test]
    async fn test_populate_twice_is_noop() {
        let store = connected_store().await;
        let catalog = SeedCatalog::new(store.clone(), small_sets(), SeedGate::PerSet).unwrap();

        catalog.populate().await;
        let second = catalog.populate().await;

        assert_eq!(second.inserted_total(), 0);
        assert_eq!(store.count_rows("statuses").await.unwrap(), 2);
        assert_eq!(store.count_rows("genres").await.unwrap(), 1);
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_per_set_gate_fills_missing_set() {
        let store = connected_store().await;
        store.fail_table("genres");
        let catalog = SeedCatalog::new(store.clone(), small_sets(), SeedGate::PerSet).unwrap();

        let first = catalog.populate().await;
        assert_eq!(first.outcome("statuses"), Some(&SetOutcome::Inserted(2)));
        assert!(matches!(first.outcome("genres"), Some(SetOutcome::Failed(_))));

        store.clear_failures();
        let retry = catalog.populate().await;
        assert_eq!(retry.outcome("statuses"), Some(&SetOutcome::AlreadyPopulated));
        assert_eq!(retry.outcome("genres"), Some(&SetOutcome::Inserted(1)));
        assert_eq!(store.count_rows("statuses").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_per_set_gate_resolves_against_existing_rows() {
        let store = connected_store().await;
        let statuses_only = vec![small_sets().remove(0)];
        SeedCatalog::new(store.clone(), statuses_only, SeedGate::PerSet)
            .unwrap()
            .populate()
            .await;

        let catalog = SeedCatalog::new(store.clone(), small_sets(), SeedGate::PerSet).unwrap();
        let report = catalog.populate().await;
        assert_eq!(report.outcome("statuses"), Some(&SetOutcome::AlreadyPopulated));
        assert_eq!(report.outcome("genres"), Some(&SetOutcome::Inserted(1)));

        let activo_id = store.rows("statuses")[0].0;
        assert_eq!(
            store.rows("genres")[0].1["status_id"],
            RecordValue::Integer(activo_id)
        );
    }

    #[tokio::test]
    async fn test_anchor_gate_skips_everything_once_anchor_exists() {
        let store = connected_store().await;
        let statuses_only = vec![small_sets().remove(0)];
        SeedCatalog::new(store.clone(), statuses_only, SeedGate::Anchor)
            .unwrap()
            .populate()
            .await;

        let catalog = SeedCatalog::new(store.clone(), small_sets(), SeedGate::Anchor).unwrap();
        assert!(catalog.is_populated("genres").await.unwrap());

        let report = catalog.populate().await;
        assert_eq!(report.inserted_total(), 0);
        assert_eq!(store.count_rows("genres").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_dependency_never_inserts_null_reference() {
        let store = connected_store().await;
        store.fail_table("statuses");
        let catalog = SeedCatalog::new(store.clone(), small_sets(), SeedGate::PerSet).unwrap();

        let report = catalog.populate().await;
        assert!(matches!(report.outcome("statuses"), Some(SetOutcome::Failed(_))));
        assert!(matches!(report.outcome("genres"), Some(SetOutcome::Failed(msg)) if msg.contains("Activo")));
        assert!(store.rows("genres").is_empty());
    }

    #[tokio::test]
    async fn test_is_populated_unknown_key() {
        let store = connected_store().await;
        let catalog = SeedCatalog::new(store, small_sets(), SeedGate::PerSet).unwrap();
        assert!(matches!(
            catalog.is_populated("planets").await,
            Err(SeedError::UnknownSet(_))
        ));
    }
}
