//! Primary ↔ internal metric name resolution.
//!
//! Clients subscribe using primary names. When a suffix is configured the
//! broker may only know the metric as `<primary>.<suffix>`; the resolver
//! finds out which form exists and keeps the mapping in both directions.
//!
//! # Locking
//!
//! `resolve` holds an async section across the broker existence query so
//! that two connections racing on the same unseen metric cause one query
//! and one mapping. The maps themselves sit behind a short synchronous
//! lock so the dispatch path can translate names without awaiting.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;

use crate::ports::MetricBroker;

use super::error::SinkError;

/// Bidirectional one-to-one map between primary and internal names.
#[derive(Debug, Default)]
struct NameTable {
    suffix: Option<String>,
    to_internal: HashMap<String, String>,
    to_primary: HashMap<String, String>,
}

impl NameTable {
    fn with_suffix(suffix: Option<String>) -> Self {
        Self {
            suffix,
            ..Self::default()
        }
    }

    /// Primary name currently owning `internal`, if different from `primary`.
    fn conflicting_owner(&self, primary: &str, internal: &str) -> Option<&String> {
        self.to_primary
            .get(internal)
            .filter(|owner| owner.as_str() != primary)
    }

    fn insert(&mut self, primary: String, internal: String) {
        debug_assert!(self.conflicting_owner(&primary, &internal).is_none());
        self.to_primary.insert(internal.clone(), primary.clone());
        self.to_internal.insert(primary, internal);
    }
}

/// Resolves client-visible metric names to broker-internal names.
pub struct NameResolver {
    broker: Arc<dyn MetricBroker>,
    resolve_section: Mutex<()>,
    table: RwLock<NameTable>,
}

impl NameResolver {
    /// Create a resolver. `suffix = None` makes every mapping the identity.
    pub fn new(broker: Arc<dyn MetricBroker>, suffix: Option<String>) -> Self {
        Self {
            broker,
            resolve_section: Mutex::new(()),
            table: RwLock::new(NameTable::with_suffix(normalize_suffix(suffix))),
        }
    }

    /// Currently configured suffix.
    pub fn suffix(&self) -> Option<String> {
        self.read().suffix.clone()
    }

    /// Ensure every name in `primary_names` has an internal mapping.
    ///
    /// No-op while suffixing is disabled. Otherwise asks the broker which of
    /// `name` / `name.suffix` exist and prefers the suffixed form. Names for
    /// which neither form exists map to themselves and are subscribed
    /// optimistically.
    pub async fn resolve(&self, primary_names: &[String]) -> Result<(), SinkError> {
        let _section = self.resolve_section.lock().await;

        let (suffix, unknown) = {
            let table = self.read();
            let Some(suffix) = table.suffix.clone() else {
                return Ok(());
            };
            let mut seen = HashSet::new();
            let unknown: Vec<String> = primary_names
                .iter()
                .filter(|name| !table.to_internal.contains_key(name.as_str()))
                .filter(|name| seen.insert(name.as_str()))
                .cloned()
                .collect();
            (suffix, unknown)
        };

        if unknown.is_empty() {
            return Ok(());
        }

        let candidates: Vec<String> = unknown
            .iter()
            .flat_map(|name| [name.clone(), suffixed(name, &suffix)])
            .collect();

        tracing::debug!(count = unknown.len(), "Resolving metric names");
        let existing: HashSet<String> = self
            .broker
            .get_metrics(&candidates, false)
            .await?
            .into_iter()
            .collect();

        let resolved: Vec<(String, String)> = unknown
            .into_iter()
            .map(|name| {
                let with_suffix = suffixed(&name, &suffix);
                if existing.contains(&with_suffix) {
                    (name, with_suffix)
                } else {
                    if !existing.contains(&name) {
                        tracing::warn!(
                            metric = %name,
                            "Metric not found with or without suffix, subscribing anyway"
                        );
                    }
                    (name.clone(), name)
                }
            })
            .collect();

        let mut table = self.write();
        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for (primary, internal) in &resolved {
            let owner = table
                .conflicting_owner(primary, internal)
                .map(String::as_str)
                .or_else(|| claimed.get(internal.as_str()).copied());
            if let Some(existing) = owner {
                return Err(SinkError::NameConflict {
                    primary: primary.clone(),
                    internal: internal.clone(),
                    existing: existing.to_string(),
                });
            }
            claimed.insert(internal.as_str(), primary.as_str());
        }
        for (primary, internal) in resolved {
            tracing::debug!(primary = %primary, internal = %internal, "Resolved metric name");
            table.insert(primary, internal);
        }

        Ok(())
    }

    /// Internal name for `primary`; the identity when nothing is mapped.
    pub fn to_internal(&self, primary: &str) -> String {
        self.read()
            .to_internal
            .get(primary)
            .cloned()
            .unwrap_or_else(|| primary.to_string())
    }

    /// Primary name for `internal`; the identity when nothing is mapped.
    pub fn to_primary(&self, internal: &str) -> String {
        self.read()
            .to_primary
            .get(internal)
            .cloned()
            .unwrap_or_else(|| internal.to_string())
    }

    /// Swap the suffix and drop every mapping except those in `retain`.
    ///
    /// Retained mappings belong to metrics that are still subscribed upstream
    /// under their old internal name; they keep it until they are released.
    pub async fn reconfigure(&self, suffix: Option<String>, retain: &HashSet<String>) {
        let _section = self.resolve_section.lock().await;
        let mut table = self.write();

        let mut next = NameTable::with_suffix(normalize_suffix(suffix));
        for (primary, internal) in table.to_internal.drain() {
            if retain.contains(&primary) {
                next.insert(primary, internal);
            }
        }
        *table = next;
    }

    /// Drop the mapping for metrics that are no longer subscribed and whose
    /// mapping was kept alive across a reconfiguration.
    pub fn release(&self, primary_names: &[String]) {
        let mut table = self.write();
        for primary in primary_names {
            let stale = match &table.suffix {
                None => true,
                Some(suffix) => table
                    .to_internal
                    .get(primary)
                    .is_some_and(|internal| {
                        internal != primary && internal != &suffixed(primary, suffix)
                    }),
            };
            if stale {
                if let Some(internal) = table.to_internal.remove(primary) {
                    table.to_primary.remove(&internal);
                }
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, NameTable> {
        self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, NameTable> {
        self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn suffixed(name: &str, suffix: &str) -> String {
    format!("{name}.{suffix}")
}

fn normalize_suffix(suffix: Option<String>) -> Option<String> {
    suffix.filter(|s| !s.is_empty())
}
