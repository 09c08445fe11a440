//! Desired-state graph store
//!
//! One slot per model key. A slot holding `None` is a tombstone: the model was
//! deleted in the cluster and the backend objects must go. The slot is dropped
//! once the deletion converged. Each slot carries the retry counter consulted
//! by the retry classifier.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use super::node::ModelGraph;
use crate::keys::{IngestionKey, ModelKey};

#[derive(Debug, Clone, Default)]
pub struct ModelSlot {
    pub graph: Option<Arc<ModelGraph>>,
    pub retry_counter: u32,
}

impl ModelSlot {
    pub fn is_tombstone(&self) -> bool {
        self.graph.is_none()
    }
}

/// Result of [`GraphStore::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// No slot existed for the key
    Created,
    /// Content differs from the stored graph
    Changed,
    /// Same checksum as the stored graph
    Unchanged,
}

#[derive(Debug, Default)]
pub struct GraphStore {
    models: RwLock<HashMap<ModelKey, ModelSlot>>,
    /// Ingestion key -> model key it was last translated into
    sources: RwLock<HashMap<IngestionKey, ModelKey>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a graph, or a tombstone when `graph` is `None`
    ///
    /// A content change resets the retry counter.
    pub fn save(&self, key: &ModelKey, graph: Option<ModelGraph>) -> SaveOutcome {
        let new_checksum = graph.as_ref().map(ModelGraph::checksum);
        let mut models = self.models.write();
        match models.get_mut(key) {
            None => {
                models.insert(
                    key.clone(),
                    ModelSlot {
                        graph: graph.map(Arc::new),
                        retry_counter: 0,
                    },
                );
                SaveOutcome::Created
            }
            Some(slot) => {
                let old_checksum = slot.graph.as_ref().map(|g| g.checksum());
                if old_checksum == new_checksum {
                    return SaveOutcome::Unchanged;
                }
                slot.graph = graph.map(Arc::new);
                slot.retry_counter = 0;
                SaveOutcome::Changed
            }
        }
    }

    /// Slot for a key; `None` if the key is unknown
    pub fn get(&self, key: &ModelKey) -> Option<ModelSlot> {
        self.models.read().get(key).cloned()
    }

    /// Graph for a key; `None` for tombstones and unknown keys
    pub fn graph(&self, key: &ModelKey) -> Option<Arc<ModelGraph>> {
        self.models.read().get(key).and_then(|slot| slot.graph.clone())
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.models.read().contains_key(key)
    }

    /// Drop the slot if it is still a tombstone. Returns whether it was removed.
    ///
    /// A graph saved after the deletion started keeps its slot.
    pub fn remove_tombstone(&self, key: &ModelKey) -> bool {
        let mut models = self.models.write();
        if models.get(key).is_some_and(ModelSlot::is_tombstone) {
            models.remove(key);
            return true;
        }
        false
    }

    /// All keys, tombstones included, sorted
    pub fn keys(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self.models.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Count a failed convergence. An unknown key gets a tombstone slot, since
    /// the only failures on keys without a graph are deletions.
    pub fn increment_retry(&self, key: &ModelKey) -> u32 {
        let mut models = self.models.write();
        let slot = models.entry(key.clone()).or_default();
        slot.retry_counter = slot.retry_counter.saturating_add(1);
        slot.retry_counter
    }

    pub fn retry_counter(&self, key: &ModelKey) -> u32 {
        self.models
            .read()
            .get(key)
            .map(|slot| slot.retry_counter)
            .unwrap_or(0)
    }

    pub fn reset_retry(&self, key: &ModelKey) {
        if let Some(slot) = self.models.write().get_mut(key) {
            slot.retry_counter = 0;
        }
    }

    pub fn reset_all_retries(&self) {
        for slot in self.models.write().values_mut() {
            slot.retry_counter = 0;
        }
    }

    /// Record that `source` translates into `model`. Returns the previous
    /// model key when it differs (tenant change).
    pub fn bind_source(&self, source: &IngestionKey, model: &ModelKey) -> Option<ModelKey> {
        self.sources
            .write()
            .insert(source.clone(), model.clone())
            .filter(|previous| previous != model)
    }

    pub fn source_model(&self, source: &IngestionKey) -> Option<ModelKey> {
        self.sources.read().get(source).cloned()
    }

    pub fn unbind_source(&self, source: &IngestionKey) -> Option<ModelKey> {
        self.sources.write().remove(source)
    }

    /// Bound ingestion keys in a namespace, sorted
    pub fn sources_in_namespace(&self, namespace: &str) -> Vec<IngestionKey> {
        self.sources
            .read()
            .keys()
            .filter(|source| source.namespace() == Some(namespace))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
