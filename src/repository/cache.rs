//! Opt-in read-through cache for entity rows.
//!
//! Keyed by `(table, id)` and shared across repositories of different
//! entity types. Mutations invalidate before returning, so a read that
//! follows a write always goes to the database.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use super::entity::RawRow;

/// Process-local entity cache. No TTL; correctness comes from
/// invalidation on every mutation path.
#[derive(Debug, Default)]
pub struct StateCache {
    rows: Mutex<HashMap<(String, Uuid), RawRow>>,
}

impl StateCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached rows, across all entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached row.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub(crate) fn get(&self, table: &str, id: Uuid) -> Option<RawRow> {
        self.lock().get(&(table.to_owned(), id)).cloned()
    }

    pub(crate) fn put(&self, table: &str, id: Uuid, row: RawRow) {
        self.lock().insert((table.to_owned(), id), row);
    }

    pub(crate) fn invalidate(&self, table: &str, id: Uuid) {
        self.lock().remove(&(table.to_owned(), id));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, Uuid), RawRow>> {
        match self.rows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample_row() -> RawRow {
        RawRow {
            id: Uuid::new_v4().to_string(),
            data: "{}".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            version: 1,
        }
    }

    #[test]
    fn put_get_invalidate() {
        let cache = StateCache::new();
        let id = Uuid::new_v4();
        cache.put("widgets", id, sample_row());
        assert!(cache.get("widgets", id).is_some());
        assert!(cache.get("gadgets", id).is_none());
        cache.invalidate("widgets", id);
        assert!(cache.get("widgets", id).is_none());
        assert!(cache.is_empty());
    }
}
