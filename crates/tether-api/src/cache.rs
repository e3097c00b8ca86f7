//! Normalized record cache.
//!
//! The cache is an immutable [`CacheState`] value made of independent
//! sub-caches, each a reducer over [`DataUpdate`] events. Applying an update
//! produces a new state that shares every untouched map with the previous
//! one; touched maps are cloned on write, so snapshots held by readers are
//! never mutated.
//!
//! [`Store`] owns the current state, swaps in new states atomically and
//! broadcasts each applied update to subscribers.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::ids::{Identifiable, RecordId};
use crate::records::{Branch, Commit, ExtensionManifest, ExtensionVersion, File, Repository, Tree, User};
use crate::resources::{Record, Resource, ResourceName};

/// Default capacity of the store's update channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// The single event type that mutates the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataUpdate {
    /// New or changed records. For a given id the last record wins.
    pub updates: BTreeMap<ResourceName, Vec<Record>>,
    /// Ids removed upstream.
    pub deleted: BTreeMap<ResourceName, BTreeSet<RecordId>>,
    /// Ids known to be stale; absent until refetched.
    pub invalid: BTreeMap<ResourceName, BTreeSet<RecordId>>,
    /// Included resource types whose linked records the server withheld.
    pub limited: BTreeSet<ResourceName>,
}

impl DataUpdate {
    /// An update removing `ids` of `resource`.
    pub fn deleted(resource: ResourceName, ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            deleted: BTreeMap::from([(resource, ids.into_iter().collect())]),
            ..Default::default()
        }
    }

    /// An update marking `ids` of `resource` invalid.
    pub fn invalidated(resource: ResourceName, ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            invalid: BTreeMap::from([(resource, ids.into_iter().collect())]),
            ..Default::default()
        }
    }

    /// Add a record under its own resource type.
    pub fn push(&mut self, record: Record) {
        self.updates.entry(record.resource()).or_default().push(record);
    }

    /// True if applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        self.updates.values().all(Vec::is_empty)
            && self.deleted.values().all(BTreeSet::is_empty)
            && self.invalid.values().all(BTreeSet::is_empty)
            && self.limited.is_empty()
    }

    /// Records of one resource type.
    pub fn records(&self, resource: ResourceName) -> &[Record] {
        self.updates.get(&resource).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids of `resource` that must be absent after this update: deleted or invalid.
    pub fn removed_ids(&self, resource: ResourceName) -> HashSet<RecordId> {
        self.deleted
            .get(&resource)
            .into_iter()
            .chain(self.invalid.get(&resource))
            .flatten()
            .cloned()
            .collect()
    }

    /// Number of records carried.
    pub fn record_count(&self) -> usize {
        self.updates.values().map(Vec::len).sum()
    }
}

// =============================================================================
// Reducers
// =============================================================================

/// Typed records in update order, keeping only the last one for each id.
fn latest<T: Resource>(records: &[Record]) -> Vec<&Arc<T>> {
    let mut seen = HashSet::new();
    let mut latest: Vec<&Arc<T>> = records
        .iter()
        .rev()
        .filter_map(T::from_record)
        .filter(|record| seen.insert(record.id()))
        .collect();
    latest.reverse();
    latest
}

/// id → record for one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryMap {
    resource: ResourceName,
    items: Arc<HashMap<RecordId, Record>>,
}

impl PrimaryMap {
    pub fn new(resource: ResourceName) -> Self {
        Self {
            resource,
            items: Arc::default(),
        }
    }

    pub fn reduce(&self, update: &DataUpdate) -> Self {
        let records = update.records(self.resource);
        let removed = update.removed_ids(self.resource);
        if records.is_empty() && removed.is_empty() {
            return self.clone();
        }

        let mut next = self.clone();
        let items = Arc::make_mut(&mut next.items);
        for record in records {
            let id = record.id();
            trace!(resource = %self.resource, id = %id, "cache: record stored");
            items.insert(id, record.clone());
        }
        for id in &removed {
            if items.remove(id).is_some() {
                trace!(resource = %self.resource, id = %id, "cache: record removed");
            }
        }
        next
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.items.values()
    }
}

/// Secondary key → id, one key per record.
///
/// When a record is updated its previous key is dropped before the new one is
/// added, so renames never leave stale keys behind. Deletion prunes by value.
pub struct LookupMap<T, K> {
    key: fn(&T) -> Option<K>,
    entries: Arc<HashMap<K, RecordId>>,
}

impl<T: Resource, K: Clone + Eq + Hash> LookupMap<T, K> {
    pub fn new(key: fn(&T) -> Option<K>) -> Self {
        Self {
            key,
            entries: Arc::default(),
        }
    }

    pub fn reduce(&self, update: &DataUpdate) -> Self {
        let records = update.records(T::NAME);
        let removed = update.removed_ids(T::NAME);
        if records.is_empty() && removed.is_empty() {
            return self.clone();
        }

        let mut next = self.clone();
        let entries = Arc::make_mut(&mut next.entries);
        let updated: HashSet<RecordId> = records.iter().map(Identifiable::id).collect();
        entries.retain(|_, id| !updated.contains(id) && !removed.contains(id));
        for record in latest::<T>(records) {
            let id = record.id();
            if removed.contains(&id) {
                continue;
            }
            if let Some(key) = (self.key)(record) {
                entries.insert(key, id);
            }
        }
        next
    }

    pub fn get(&self, key: &K) -> Option<&RecordId> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.entries.values()
    }
}

/// Secondary keys → id, where one record contributes several keys.
pub struct LookupManyMap<T, K> {
    keys: fn(&T) -> Vec<K>,
    entries: Arc<HashMap<K, RecordId>>,
}

impl<T: Resource, K: Clone + Eq + Hash> LookupManyMap<T, K> {
    pub fn new(keys: fn(&T) -> Vec<K>) -> Self {
        Self {
            keys,
            entries: Arc::default(),
        }
    }

    pub fn reduce(&self, update: &DataUpdate) -> Self {
        let records = update.records(T::NAME);
        let removed = update.removed_ids(T::NAME);
        if records.is_empty() && removed.is_empty() {
            return self.clone();
        }

        let mut next = self.clone();
        let entries = Arc::make_mut(&mut next.entries);
        let updated: HashSet<RecordId> = records.iter().map(Identifiable::id).collect();
        entries.retain(|_, id| !updated.contains(id) && !removed.contains(id));
        for record in latest::<T>(records) {
            let id = record.id();
            if removed.contains(&id) {
                continue;
            }
            for key in (self.keys)(record) {
                entries.insert(key, id.clone());
            }
        }
        next
    }

    pub fn get(&self, key: &K) -> Option<&RecordId> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.entries.values()
    }
}

/// id → derived data extracted from a record.
///
/// Records for which the mapper yields nothing have no entry.
pub struct AuxiliaryMap<T, V> {
    mapper: fn(&T) -> Option<V>,
    values: Arc<HashMap<RecordId, Arc<V>>>,
}

impl<T: Resource, V> AuxiliaryMap<T, V> {
    pub fn new(mapper: fn(&T) -> Option<V>) -> Self {
        Self {
            mapper,
            values: Arc::default(),
        }
    }

    pub fn reduce(&self, update: &DataUpdate) -> Self {
        let records = update.records(T::NAME);
        let removed = update.removed_ids(T::NAME);
        if records.is_empty() && removed.is_empty() {
            return self.clone();
        }

        let mut next = self.clone();
        let values = Arc::make_mut(&mut next.values);
        for record in latest::<T>(records) {
            match (self.mapper)(record) {
                Some(value) => {
                    values.insert(record.id(), Arc::new(value));
                }
                None => {
                    values.remove(&record.id());
                }
            }
        }
        for id in &removed {
            values.remove(id);
        }
        next
    }

    pub fn get(&self, id: &RecordId) -> Option<&Arc<V>> {
        self.values.get(id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.values.keys()
    }
}

impl<T, K> Clone for LookupMap<T, K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T, K> Clone for LookupManyMap<T, K> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T, V> Clone for AuxiliaryMap<T, V> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper,
            values: Arc::clone(&self.values),
        }
    }
}

impl<T, K: Eq + Hash> PartialEq for LookupMap<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<T, K: Eq + Hash> PartialEq for LookupManyMap<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<T, V: PartialEq> PartialEq for AuxiliaryMap<T, V> {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl<T, K> fmt::Debug for LookupMap<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupMap")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T, K> fmt::Debug for LookupManyMap<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupManyMap")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T, V> fmt::Debug for AuxiliaryMap<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuxiliaryMap")
            .field("len", &self.values.len())
            .finish()
    }
}

// =============================================================================
// Cache state
// =============================================================================

fn user_name(user: &User) -> Option<String> {
    user.name.clone()
}

fn repository_name(repository: &Repository) -> Option<String> {
    repository.name.clone()
}

fn branch_name(branch: &Branch) -> Option<(RecordId, String)> {
    Some((branch.repository.clone()?, branch.name.clone()?))
}

fn commit_sha1(commit: &Commit) -> Option<(RecordId, String)> {
    Some((commit.repository.clone()?, commit.sha1.clone()?))
}

fn file_path(file: &File) -> Option<String> {
    file.path.clone()
}

fn tree_locations(tree: &Tree) -> Vec<(RecordId, String)> {
    tree.locations
        .iter()
        .map(|location| (location.commit.clone(), location.path.clone()))
        .collect()
}

fn extension_manifest(version: &ExtensionVersion) -> Option<ExtensionManifest> {
    version.parsed_manifest()
}

/// One immutable version of the whole cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheState {
    primary: BTreeMap<ResourceName, PrimaryMap>,
    users_by_name: LookupMap<User, String>,
    repositories_by_name: LookupMap<Repository, String>,
    branches_by_name: LookupMap<Branch, (RecordId, String)>,
    commits_by_sha1: LookupMap<Commit, (RecordId, String)>,
    files_by_path: LookupMap<File, String>,
    trees_by_location: LookupManyMap<Tree, (RecordId, String)>,
    extension_manifests: AuxiliaryMap<ExtensionVersion, ExtensionManifest>,
    invalid: Arc<BTreeMap<ResourceName, BTreeSet<RecordId>>>,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            primary: ResourceName::ALL
                .iter()
                .map(|name| (*name, PrimaryMap::new(*name)))
                .collect(),
            users_by_name: LookupMap::new(user_name),
            repositories_by_name: LookupMap::new(repository_name),
            branches_by_name: LookupMap::new(branch_name),
            commits_by_sha1: LookupMap::new(commit_sha1),
            files_by_path: LookupMap::new(file_path),
            trees_by_location: LookupManyMap::new(tree_locations),
            extension_manifests: AuxiliaryMap::new(extension_manifest),
            invalid: Arc::default(),
        }
    }
}

impl CacheState {
    /// Apply one update to every sub-cache.
    pub fn reduce(&self, update: &DataUpdate) -> Self {
        Self {
            primary: self
                .primary
                .iter()
                .map(|(name, map)| (*name, map.reduce(update)))
                .collect(),
            users_by_name: self.users_by_name.reduce(update),
            repositories_by_name: self.repositories_by_name.reduce(update),
            branches_by_name: self.branches_by_name.reduce(update),
            commits_by_sha1: self.commits_by_sha1.reduce(update),
            files_by_path: self.files_by_path.reduce(update),
            trees_by_location: self.trees_by_location.reduce(update),
            extension_manifests: self.extension_manifests.reduce(update),
            invalid: self.reduce_invalid(update),
        }
    }

    /// Invalid ids stay invalid until a later update or deletion for them.
    fn reduce_invalid(&self, update: &DataUpdate) -> Arc<BTreeMap<ResourceName, BTreeSet<RecordId>>> {
        let touched = self.invalid.iter().any(|(name, ids)| {
            !ids.is_empty()
                && (!update.records(*name).is_empty() || update.deleted.contains_key(name))
        });
        if !touched && update.invalid.values().all(BTreeSet::is_empty) {
            return Arc::clone(&self.invalid);
        }

        let mut next = Arc::clone(&self.invalid);
        let invalid = Arc::make_mut(&mut next);
        for (name, ids) in invalid.iter_mut() {
            for record in update.records(*name) {
                ids.remove(&record.id());
            }
            if let Some(deleted) = update.deleted.get(name) {
                ids.retain(|id| !deleted.contains(id));
            }
        }
        for (name, ids) in &update.invalid {
            invalid.entry(*name).or_default().extend(ids.iter().cloned());
        }
        invalid.retain(|_, ids| !ids.is_empty());
        next
    }

    /// Primary map for a resource type.
    pub fn primary(&self, resource: ResourceName) -> Option<&PrimaryMap> {
        self.primary.get(&resource)
    }

    /// A record of any type.
    pub fn record(&self, resource: ResourceName, id: &RecordId) -> Option<&Record> {
        self.primary.get(&resource)?.get(id)
    }

    /// A typed record.
    pub fn get<T: Resource>(&self, id: &RecordId) -> Option<Arc<T>> {
        self.record(T::NAME, id)?.downcast::<T>().cloned()
    }

    /// All cached records of one type, in no particular order.
    pub fn all<T: Resource>(&self) -> Vec<Arc<T>> {
        self.primary
            .get(&T::NAME)
            .map(|map| {
                map.records()
                    .filter_map(|r| r.downcast::<T>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of cached records of one type.
    pub fn count(&self, resource: ResourceName) -> usize {
        self.primary.get(&resource).map_or(0, PrimaryMap::len)
    }

    pub fn is_invalid(&self, resource: ResourceName, id: &RecordId) -> bool {
        self.invalid
            .get(&resource)
            .is_some_and(|ids| ids.contains(id))
    }

    pub fn invalid_ids(&self, resource: ResourceName) -> impl Iterator<Item = &RecordId> {
        self.invalid.get(&resource).into_iter().flatten()
    }

    pub fn user_by_name(&self, name: &str) -> Option<Arc<User>> {
        let id = self.users_by_name.get(&name.to_string())?;
        self.get(id)
    }

    pub fn repository_by_name(&self, name: &str) -> Option<Arc<Repository>> {
        let id = self.repositories_by_name.get(&name.to_string())?;
        self.get(id)
    }

    pub fn branch_by_name(&self, repository: &RecordId, name: &str) -> Option<Arc<Branch>> {
        let id = self
            .branches_by_name
            .get(&(repository.clone(), name.to_string()))?;
        self.get(id)
    }

    pub fn commit_by_sha1(&self, repository: &RecordId, sha1: &str) -> Option<Arc<Commit>> {
        let id = self
            .commits_by_sha1
            .get(&(repository.clone(), sha1.to_string()))?;
        self.get(id)
    }

    pub fn file_by_path(&self, path: &str) -> Option<Arc<File>> {
        let id = self.files_by_path.get(&path.to_string())?;
        self.get(id)
    }

    /// The tree at `path` in `commit`.
    pub fn tree_at(&self, commit: &RecordId, path: &str) -> Option<Arc<Tree>> {
        let id = self
            .trees_by_location
            .get(&(commit.clone(), path.to_string()))?;
        self.get(id)
    }

    pub fn extension_manifest(&self, version: &RecordId) -> Option<Arc<ExtensionManifest>> {
        self.extension_manifests.get(version).cloned()
    }

    /// Every id referenced by a secondary or auxiliary map, with its resource type.
    pub fn secondary_ids(&self) -> Vec<(ResourceName, &RecordId)> {
        let mut ids = Vec::new();
        ids.extend(self.users_by_name.ids().map(|id| (ResourceName::Users, id)));
        ids.extend(
            self.repositories_by_name
                .ids()
                .map(|id| (ResourceName::Repositories, id)),
        );
        ids.extend(
            self.branches_by_name
                .ids()
                .map(|id| (ResourceName::Branches, id)),
        );
        ids.extend(
            self.commits_by_sha1
                .ids()
                .map(|id| (ResourceName::Commits, id)),
        );
        ids.extend(self.files_by_path.ids().map(|id| (ResourceName::Files, id)));
        ids.extend(
            self.trees_by_location
                .ids()
                .map(|id| (ResourceName::Trees, id)),
        );
        ids.extend(
            self.extension_manifests
                .ids()
                .map(|id| (ResourceName::ExtensionVersions, id)),
        );
        ids
    }
}

// =============================================================================
// Store
// =============================================================================

/// Owner of the current cache state.
///
/// Readers take snapshots; writers go through [`Store::dispatch`], which
/// applies updates one at a time.
pub struct Store {
    state: RwLock<Arc<CacheState>>,
    updates_tx: broadcast::Sender<Arc<DataUpdate>>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            state: RwLock::new(Arc::new(CacheState::default())),
            updates_tx,
        })
    }

    /// The current state. Cheap; later dispatches do not affect it.
    pub fn snapshot(&self) -> Arc<CacheState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply an update atomically and broadcast it.
    pub fn dispatch(&self, update: DataUpdate) {
        if update.is_empty() {
            trace!("cache: empty update ignored");
            return;
        }

        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let next = state.reduce(&update);
            *state = Arc::new(next);
        }

        debug!(
            records = update.record_count(),
            deleted = update.deleted.values().map(BTreeSet::len).sum::<usize>(),
            invalid = update.invalid.values().map(BTreeSet::len).sum::<usize>(),
            limited = update.limited.len(),
            "cache: update applied"
        );

        if self.updates_tx.send(Arc::new(update)).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    /// Receive every update applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DataUpdate>> {
        self.updates_tx.subscribe()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("receivers", &self.updates_tx.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TreeLocation;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn branch(id: i64, repository: i64, name: &str) -> Record {
        Branch {
            id: RecordId::Int(id),
            repository: Some(RecordId::Int(repository)),
            name: Some(name.to_string()),
            head: None,
            size: None,
            updated_at: None,
        }
        .into_record()
    }

    fn updates(records: impl IntoIterator<Item = Record>) -> DataUpdate {
        let mut update = DataUpdate::default();
        for record in records {
            update.push(record);
        }
        update
    }

    #[test]
    fn test_primary_and_lookup() {
        let state = CacheState::default().reduce(&updates([branch(1, 10, "master")]));
        assert_eq!(state.count(ResourceName::Branches), 1);
        let found = state.branch_by_name(&RecordId::Int(10), "master").unwrap();
        assert_eq!(found.id, RecordId::Int(1));
        assert!(state.branch_by_name(&RecordId::Int(11), "master").is_none());
    }

    #[test]
    fn test_rename_drops_old_key() {
        let state = CacheState::default()
            .reduce(&updates([branch(1, 10, "master")]))
            .reduce(&updates([branch(1, 10, "main")]));
        assert!(state.branch_by_name(&RecordId::Int(10), "master").is_none());
        assert!(state.branch_by_name(&RecordId::Int(10), "main").is_some());
    }

    #[test]
    fn test_delete_prunes_secondary_maps() {
        let state = CacheState::default()
            .reduce(&updates([branch(1, 10, "master"), branch(2, 10, "dev")]))
            .reduce(&DataUpdate::deleted(ResourceName::Branches, [RecordId::Int(1)]));
        assert!(state.get::<Branch>(&RecordId::Int(1)).is_none());
        assert!(state.branch_by_name(&RecordId::Int(10), "master").is_none());
        assert!(state.branch_by_name(&RecordId::Int(10), "dev").is_some());
    }

    #[test]
    fn test_invalid_until_refetched() {
        let state = CacheState::default()
            .reduce(&updates([branch(1, 10, "master")]))
            .reduce(&DataUpdate::invalidated(ResourceName::Branches, [RecordId::Int(1)]));
        assert!(state.get::<Branch>(&RecordId::Int(1)).is_none());
        assert!(state.is_invalid(ResourceName::Branches, &RecordId::Int(1)));

        let state = state.reduce(&updates([branch(1, 10, "master")]));
        assert!(!state.is_invalid(ResourceName::Branches, &RecordId::Int(1)));
        assert!(state.get::<Branch>(&RecordId::Int(1)).is_some());
    }

    #[test]
    fn test_tree_multi_lookup() {
        let tree = Tree {
            id: RecordId::Str("4b825dc6".to_string()),
            repository: None,
            entries: Vec::new(),
            locations: vec![
                TreeLocation {
                    commit: RecordId::Int(5),
                    path: "src".to_string(),
                },
                TreeLocation {
                    commit: RecordId::Int(6),
                    path: "lib".to_string(),
                },
            ],
        };
        let state = CacheState::default().reduce(&updates([tree.into_record()]));
        assert!(state.tree_at(&RecordId::Int(5), "src").is_some());
        assert!(state.tree_at(&RecordId::Int(6), "lib").is_some());
        assert!(state.tree_at(&RecordId::Int(5), "lib").is_none());
    }

    #[test]
    fn test_extension_manifest_auxiliary() {
        let version = ExtensionVersion {
            id: RecordId::Int(3),
            extension: Some(RecordId::Int(1)),
            name: Some("stable".to_string()),
            sha1: None,
            manifest: Some(serde_json::json!({
                "description": "Test",
                "roles": [{"type": "Page", "description": "A page"}]
            })),
        };
        let state = CacheState::default().reduce(&updates([version.into_record()]));
        let manifest = state.extension_manifest(&RecordId::Int(3)).unwrap();
        assert_eq!(manifest.roles[0].role_type, "Page");

        let state = state.reduce(&DataUpdate::deleted(
            ResourceName::ExtensionVersions,
            [RecordId::Int(3)],
        ));
        assert!(state.extension_manifest(&RecordId::Int(3)).is_none());
    }

    #[test]
    fn test_untouched_maps_are_shared() {
        let before = CacheState::default().reduce(&updates([branch(1, 10, "master")]));
        let after = before.reduce(&DataUpdate::deleted(ResourceName::Users, [RecordId::Int(9)]));
        let branches_before = &before.primary[&ResourceName::Branches].items;
        let branches_after = &after.primary[&ResourceName::Branches].items;
        assert!(Arc::ptr_eq(branches_before, branches_after));
    }

    #[test]
    fn test_snapshot_isolated_from_dispatch() {
        let store = Store::new();
        let before = store.snapshot();
        store.dispatch(updates([branch(1, 10, "master")]));
        assert_eq!(before.count(ResourceName::Branches), 0);
        assert_eq!(store.snapshot().count(ResourceName::Branches), 1);
    }

    #[tokio::test]
    async fn test_dispatch_broadcasts() {
        let store = Store::new();
        let mut rx = store.subscribe();
        store.dispatch(updates([branch(1, 10, "master")]));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.records(ResourceName::Branches).len(), 1);
    }

    #[test]
    fn test_empty_update_not_broadcast() {
        let store = Store::new();
        let mut rx = store.subscribe();
        store.dispatch(DataUpdate::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_limited_only_update_is_broadcast() {
        let store = Store::new();
        let mut rx = store.subscribe();
        let update = DataUpdate {
            limited: BTreeSet::from([ResourceName::Users]),
            ..Default::default()
        };
        assert!(!update.is_empty());
        store.dispatch(update);
        let received = rx.try_recv().unwrap();
        assert!(received.limited.contains(&ResourceName::Users));
        assert_eq!(store.snapshot().count(ResourceName::Users), 0);
    }

    fn arb_branch() -> impl Strategy<Value = Record> {
        (0i64..8, 0i64..3, prop::sample::select(vec!["master", "dev", "topic"]))
            .prop_map(|(id, repo, name)| branch(id, repo, name))
    }

    fn arb_update() -> impl Strategy<Value = DataUpdate> {
        (
            prop::collection::vec(arb_branch(), 0..6),
            prop::collection::btree_set(0i64..8, 0..3),
            prop::collection::btree_set(0i64..8, 0..2),
        )
            .prop_map(|(records, deleted, invalid)| {
                let mut update = updates(records);
                if !deleted.is_empty() {
                    update.deleted.insert(
                        ResourceName::Branches,
                        deleted.into_iter().map(RecordId::Int).collect(),
                    );
                }
                if !invalid.is_empty() {
                    update.invalid.insert(
                        ResourceName::Branches,
                        invalid.into_iter().map(RecordId::Int).collect(),
                    );
                }
                update
            })
    }

    proptest! {
        #[test]
        fn applying_twice_equals_applying_once(
            history in prop::collection::vec(arb_update(), 0..5),
            update in arb_update(),
        ) {
            let base = history.iter().fold(CacheState::default(), |s, u| s.reduce(u));
            let once = base.reduce(&update);
            let twice = once.reduce(&update);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn secondary_ids_exist_in_primary(
            history in prop::collection::vec(arb_update(), 0..10),
        ) {
            let state = history.iter().fold(CacheState::default(), |s, u| s.reduce(u));
            for (resource, id) in state.secondary_ids() {
                prop_assert!(
                    state.record(resource, id).is_some(),
                    "dangling {} id {}", resource, id
                );
            }
        }
    }
}
