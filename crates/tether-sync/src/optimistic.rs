//! Optimistic mutation coordinator.
//!
//! Entities live in the cache twice: inside list-shaped entries and under
//! their own by-id entry. Every speculative edit must land in both views in
//! the same logical step, and must be reconciled once the remote call
//! resolves. This module owns that dual-view propagation and the pending
//! mutation bookkeeping; the cache itself stays a dumb store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use tether_core::QueryKey;

use crate::cache::QueryCache;

/// A speculative edit awaiting its remote outcome. At most one is tracked
/// per entity id; a second mutation supersedes the first's patch (last patch
/// wins, no composition) while both remote calls proceed independently.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Every cache entry the edit touched. The by-id entry comes first.
    pub target_keys: Vec<QueryKey>,
    /// The optimistic patch, or `None` for a deletion.
    pub patch: Option<Value>,
    pub applied_at: DateTime<Utc>,
}

pub struct MutationCoordinator {
    cache: Arc<QueryCache>,
    pending: Mutex<HashMap<String, PendingMutation>>,
}

impl MutationCoordinator {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self {
            cache,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending_lock(&self) -> MutexGuard<'_, HashMap<String, PendingMutation>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending_for(&self, id: &str) -> Option<PendingMutation> {
        self.pending_lock().get(id).cloned()
    }

    /// Shallow-merge `patch` into every affected entry: the matching element
    /// (by `id` equality) of list-shaped entries, and the entity object of
    /// by-id entries. Absent entries stay absent; fields missing from the
    /// patch are preserved.
    pub fn propagate(&self, id: &str, patch: &Value, affected_keys: &[QueryKey]) {
        for key in affected_keys {
            self.cache.write(key, |old| match old {
                Some(Value::Array(items)) => Some(Value::Array(
                    items
                        .into_iter()
                        .map(|item| {
                            if value_id(&item) == Some(id) {
                                merge_patch(&item, patch)
                            } else {
                                item
                            }
                        })
                        .collect(),
                )),
                Some(object @ Value::Object(_)) => {
                    if value_id(&object) == Some(id) {
                        Some(merge_patch(&object, patch))
                    } else {
                        Some(object)
                    }
                }
                other => other,
            });
        }
    }

    /// Speculatively patch an entity in its by-id view and in every list
    /// view that contains it, registering the pending mutation.
    pub fn apply_update(
        &self,
        id: &str,
        patch: Value,
        by_id_key: QueryKey,
        list_keys: Vec<QueryKey>,
    ) {
        let target_keys = collect_targets(by_id_key, list_keys);
        self.propagate(id, &patch, &target_keys);
        self.register(id, target_keys, Some(patch));
    }

    /// Speculatively add a new entity: appended to each list entry (seeding
    /// an unfetched list as a single-element collection) and written to its
    /// by-id entry.
    pub fn apply_create(
        &self,
        id: &str,
        entity: Value,
        by_id_key: QueryKey,
        list_keys: Vec<QueryKey>,
    ) {
        for key in &list_keys {
            upsert_in_list(&self.cache, key, &entity);
        }
        self.cache.write(&by_id_key, |_| Some(entity.clone()));
        let target_keys = collect_targets(by_id_key, list_keys);
        self.register(id, target_keys, Some(entity));
    }

    /// Speculatively add an entity that only lives in list views (no by-id
    /// entry), seeding absent lists.
    pub fn apply_append(&self, id: &str, entity: Value, list_keys: Vec<QueryKey>) {
        for key in &list_keys {
            upsert_in_list(&self.cache, key, &entity);
        }
        self.register(id, list_keys, Some(entity));
    }

    /// Speculatively delete an entity: filtered out of each list entry,
    /// while the by-id entry is invalidated — not locally deleted — so any
    /// in-flight reader refetches and observes the authoritative absence.
    pub fn apply_delete(&self, id: &str, by_id_key: QueryKey, list_keys: Vec<QueryKey>) {
        for key in &list_keys {
            remove_from_list(&self.cache, key, id);
        }
        self.cache.invalidate(&by_id_key);
        let target_keys = collect_targets(by_id_key, list_keys);
        self.register(id, target_keys, None);
    }

    /// Reconcile a successful mutation. The optimistic value stands unless
    /// the server responded with something different, in which case the
    /// server value is authoritative and is re-propagated through every
    /// target view.
    pub fn confirm(&self, id: &str, server_value: Option<&Value>) {
        let Some(pending) = self.pending_lock().remove(id) else {
            // Superseded mutations resolve with no record; the cache already
            // reflects the most recently expressed intent.
            return;
        };

        let Some(server) = server_value else {
            return;
        };

        let cached = pending
            .target_keys
            .first()
            .and_then(|key| self.cache.read(key))
            .and_then(|entry| entry.value);
        if cached.as_ref() == Some(server) {
            return;
        }

        tracing::debug!(entity = id, "server value differs from optimistic value");
        self.propagate(id, server, &pending.target_keys);
    }

    /// Reconcile a failed mutation: every target entry is invalidated so
    /// the next read refetches server truth. No attempt is made to
    /// reconstruct pre-patch snapshots; a refetch is correct even when
    /// another mutation interleaved.
    pub fn revert(&self, id: &str) {
        let Some(pending) = self.pending_lock().remove(id) else {
            return;
        };
        for key in &pending.target_keys {
            self.cache.invalidate(key);
        }
    }

    fn register(&self, id: &str, target_keys: Vec<QueryKey>, patch: Option<Value>) {
        self.pending_lock().insert(
            id.to_string(),
            PendingMutation {
                target_keys,
                patch,
                applied_at: Utc::now(),
            },
        );
    }
}

fn collect_targets(by_id_key: QueryKey, list_keys: Vec<QueryKey>) -> Vec<QueryKey> {
    let mut targets = Vec::with_capacity(list_keys.len() + 1);
    targets.push(by_id_key);
    targets.extend(list_keys);
    targets
}

/// Update-or-append `entity` in a list entry by id, seeding an absent entry
/// as a single-element list.
pub fn upsert_in_list(cache: &QueryCache, key: &QueryKey, entity: &Value) {
    let id = value_id(entity).map(str::to_string);
    cache.write(key, |old| match old {
        Some(Value::Array(mut items)) => {
            let position = id
                .as_deref()
                .and_then(|id| items.iter().position(|item| value_id(item) == Some(id)));
            match position {
                Some(index) => items[index] = merge_patch(&items[index], entity),
                None => items.push(entity.clone()),
            }
            Some(Value::Array(items))
        }
        None => Some(Value::Array(vec![entity.clone()])),
        other => other,
    });
}

/// Filter an entity out of a list entry by id. Absent entries stay absent.
pub fn remove_from_list(cache: &QueryCache, key: &QueryKey, id: &str) {
    cache.write(key, |old| match old {
        Some(Value::Array(items)) => Some(Value::Array(
            items
                .into_iter()
                .filter(|item| value_id(item) != Some(id))
                .collect(),
        )),
        other => other,
    });
}

fn value_id(value: &Value) -> Option<&str> {
    value.get("id")?.as_str()
}

/// Shallow merge: patch fields overwrite, everything else is preserved.
fn merge_patch(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (field, value) in patch_map {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
