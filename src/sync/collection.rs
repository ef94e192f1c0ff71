//! Reconciling collection
//!
//! Pure state: every method runs synchronously and reports whether the
//! visible contents changed. Ordering is append order when the query has no
//! sort keys, otherwise the query's sort with ties placed after equal keys.
//!
//! A query range caps the view at `limit` rows: rows pushed past the end by
//! inserts are dropped. Rows that leave the view are not backfilled from the
//! next page until the baseline is fetched again.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::LiveEntity;
use crate::store::{row_id, ChangeEvent, ChangeKind, Filter, Query, Sort};

struct Entry<T> {
    item: T,
    row: Value,
    version: u64,
    /// Provisional entity that the store has not confirmed yet
    pending_insert: bool,
    /// Held value is a local edit awaiting confirmation
    optimistic: bool,
    /// Removal in flight
    hidden: bool,
    /// Server row installed by a baseline while a local edit is in flight
    fallback: Option<T>,
}

/// Handle returned by [`LiveCollection::stage_update`].
#[derive(Debug, Clone)]
pub struct StagedUpdate<T> {
    id: Uuid,
    previous: T,
    version: u64,
}

/// Handle returned by [`LiveCollection::stage_remove`].
#[derive(Debug, Clone, Copy)]
pub struct StagedRemove {
    id: Uuid,
}

pub struct LiveCollection<T> {
    filter: Filter,
    sort: Vec<Sort>,
    entries: Vec<Entry<T>>,
    limit: Option<usize>,
    next_version: u64,
}

impl<T: LiveEntity> LiveCollection<T> {
    pub fn new(filter: Filter, sort: Vec<Sort>) -> Self {
        Self {
            filter,
            sort,
            entries: Vec::new(),
            limit: None,
            next_version: 0,
        }
    }

    pub fn from_query(query: &Query) -> Self {
        let mut collection = Self::new(query.filter.clone(), query.sort.clone());
        collection.limit = query.range.map(|r| r.limit as usize);
        collection
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Visible items in view order.
    pub fn items(&self) -> Vec<T> {
        self.entries
            .iter()
            .filter(|e| !e.hidden)
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| !e.hidden && e.item.id() == id)
            .map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.hidden).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.pending_insert).count()
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn entry(&mut self, item: T) -> Option<Entry<T>> {
        let row = match serde_json::to_value(&item) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode live entity");
                return None;
            }
        };
        Some(Entry {
            item,
            row,
            version: self.bump(),
            pending_insert: false,
            optimistic: false,
            hidden: false,
            fallback: None,
        })
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.entries.iter().position(|e| e.item.id() == id)
    }

    fn position_pending(&self, client_ref: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.pending_insert && e.item.client_ref() == Some(client_ref))
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        self.sort
            .iter()
            .map(|s| s.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }

    fn place(&mut self, entry: Entry<T>) {
        if self.sort.is_empty() {
            self.entries.push(entry);
            return;
        }
        let at = self
            .entries
            .partition_point(|e| self.compare(&e.row, &entry.row) != Ordering::Greater);
        self.entries.insert(at, entry);
    }

    /// Swap the entry at `index` for `entry`, keeping append position or
    /// re-sorting.
    fn replace_at(&mut self, index: usize, entry: Entry<T>) {
        if self.sort.is_empty() {
            self.entries[index] = entry;
        } else {
            self.entries.remove(index);
            self.place(entry);
        }
    }

    /// Drop confirmed rows from the end until the view fits its limit.
    /// Local pending and edited entries are never dropped.
    fn trim(&mut self) {
        let Some(limit) = self.limit else {
            return;
        };
        let mut index = self.entries.len();
        while self.len() > limit && index > 0 {
            index -= 1;
            let entry = &self.entries[index];
            if !entry.hidden && !entry.pending_insert && !entry.optimistic {
                self.entries.remove(index);
            }
        }
    }

    /// Install a fresh baseline. Pending optimistic entries survive unless the
    /// baseline already holds their confirmed row. Staged edits stay visible
    /// over their baseline row, which becomes their rollback target.
    pub fn install_baseline(&mut self, rows: Vec<T>) {
        let refs: HashSet<String> = rows
            .iter()
            .filter_map(|r| r.client_ref().map(str::to_string))
            .collect();
        let hidden: HashSet<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.hidden)
            .map(|e| e.item.id())
            .collect();
        let mut pending = Vec::new();
        let mut edited = HashMap::new();
        for entry in std::mem::take(&mut self.entries) {
            if entry.pending_insert {
                if entry.item.client_ref().map_or(true, |r| !refs.contains(r)) {
                    pending.push(entry);
                }
            } else if entry.optimistic {
                edited.insert(entry.item.id(), entry);
            }
        }

        let mut seen = HashSet::new();
        for item in rows {
            if !seen.insert(item.id()) {
                continue;
            }
            if let Some(mut held) = edited.remove(&item.id()) {
                held.hidden = hidden.contains(&item.id());
                held.fallback = Some(item);
                if self.sort.is_empty() {
                    self.entries.push(held);
                } else {
                    pending.push(held);
                }
                continue;
            }
            if let Some(mut entry) = self.entry(item) {
                entry.hidden = hidden.contains(&entry.item.id());
                // baseline arrives in query order already
                self.entries.push(entry);
            }
        }
        for entry in pending {
            self.place(entry);
        }
        self.trim();
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::Delete => match row_id(&event.row) {
                Some(id) => self.apply_delete(id),
                None => false,
            },
            ChangeKind::Insert | ChangeKind::Update => {
                let item: T = match serde_json::from_value(event.row.clone()) {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!(
                            collection = %event.collection,
                            error = %e,
                            "Dropping undecodable change event"
                        );
                        return false;
                    }
                };
                if event.kind == ChangeKind::Insert {
                    self.apply_insert(item)
                } else {
                    self.apply_update(item)
                }
            }
        }
    }

    pub fn apply_insert(&mut self, item: T) -> bool {
        let Some(entry) = self.entry(item) else {
            return false;
        };
        if !self.filter.matches(&entry.row) || self.position(entry.item.id()).is_some() {
            return false;
        }
        let pending = entry
            .item
            .client_ref()
            .and_then(|r| self.position_pending(r));
        match pending {
            Some(index) => self.replace_at(index, entry),
            None => self.place(entry),
        }
        self.trim();
        true
    }

    pub fn apply_update(&mut self, item: T) -> bool {
        let Some(index) = self.position(item.id()) else {
            return false;
        };
        let Some(mut entry) = self.entry(item) else {
            return false;
        };
        if !self.filter.matches(&entry.row) {
            self.entries.remove(index);
            return true;
        }
        let held = &self.entries[index];
        if !held.optimistic {
            if let (Some(incoming), Some(current)) = (entry.item.updated_at(), held.item.updated_at()) {
                if incoming < current {
                    return false;
                }
            }
        }
        entry.hidden = held.hidden;
        self.replace_at(index, entry);
        true
    }

    pub fn apply_delete(&mut self, id: Uuid) -> bool {
        match self.position(id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Show a provisional entity immediately. It must carry a correlation key.
    pub fn insert_pending(&mut self, item: T) -> bool {
        if item.client_ref().is_none() || self.position(item.id()).is_some() {
            return false;
        }
        let Some(mut entry) = self.entry(item) else {
            return false;
        };
        entry.pending_insert = true;
        self.place(entry);
        true
    }

    /// Replace the provisional entity with the row the store returned.
    pub fn confirm_pending(&mut self, client_ref: &str, confirmed: T) -> bool {
        if self.position(confirmed.id()).is_some() {
            // the stream echo won the race
            let dropped = self.discard_pending(client_ref);
            return self.apply_update(confirmed) || dropped;
        }
        match self.position_pending(client_ref) {
            Some(index) => {
                let Some(entry) = self.entry(confirmed) else {
                    return false;
                };
                if self.filter.matches(&entry.row) {
                    self.replace_at(index, entry);
                    self.trim();
                } else {
                    self.entries.remove(index);
                }
                true
            }
            None => self.apply_insert(confirmed),
        }
    }

    pub fn discard_pending(&mut self, client_ref: &str) -> bool {
        match self.position_pending(client_ref) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Apply a local edit, remembering the previous version for rollback.
    pub fn stage_update(&mut self, item: T) -> Option<StagedUpdate<T>> {
        let index = self.position(item.id())?;
        let previous = self.entries[index].item.clone();
        let mut entry = self.entry(item)?;
        entry.optimistic = true;
        entry.hidden = self.entries[index].hidden;
        let staged = StagedUpdate {
            id: entry.item.id(),
            previous,
            version: entry.version,
        };
        self.replace_at(index, entry);
        Some(staged)
    }

    pub fn confirm_update(&mut self, staged: StagedUpdate<T>, confirmed: T) -> bool {
        let Some(index) = self.position(staged.id) else {
            return false;
        };
        if self.entries[index].version != staged.version {
            return self.apply_update(confirmed);
        }
        let Some(mut entry) = self.entry(confirmed) else {
            return false;
        };
        if !self.filter.matches(&entry.row) {
            self.entries.remove(index);
            return true;
        }
        entry.hidden = self.entries[index].hidden;
        self.replace_at(index, entry);
        true
    }

    /// Restore the previous version unless the entry changed since. A row
    /// installed by a baseline during the edit takes precedence over the
    /// staged copy.
    pub fn rollback_update(&mut self, staged: StagedUpdate<T>) -> bool {
        let Some(index) = self.position(staged.id) else {
            return false;
        };
        if self.entries[index].version != staged.version {
            return false;
        }
        let previous = self.entries[index].fallback.take().unwrap_or(staged.previous);
        let Some(mut entry) = self.entry(previous) else {
            return false;
        };
        entry.hidden = self.entries[index].hidden;
        self.replace_at(index, entry);
        true
    }

    /// Hide an entity while its removal is in flight.
    pub fn stage_remove(&mut self, id: Uuid) -> Option<StagedRemove> {
        let index = self.position(id)?;
        let entry = &mut self.entries[index];
        if entry.hidden {
            return None;
        }
        entry.hidden = true;
        Some(StagedRemove { id })
    }

    pub fn confirm_remove(&mut self, staged: StagedRemove) -> bool {
        // already invisible, so the visible contents do not change
        self.apply_delete(staged.id);
        false
    }

    pub fn rollback_remove(&mut self, staged: StagedRemove) -> bool {
        match self.position(staged.id) {
            Some(index) => {
                self.entries[index].hidden = false;
                true
            }
            None => false,
        }
    }
}
