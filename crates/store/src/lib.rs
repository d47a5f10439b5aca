//! Reap inventory: the record of objects applied by one owner, and the diff used for pruning.

#![forbid(unsafe_code)]

use reap_core::{ChangeSet, CompactCodec, IdentityCodec, InventoryError, InventoryResult, ObjRef, ObjectId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Compact persisted record: encoded identity plus the version it was applied with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "v")]
    pub version: String,
}

/// Wire shape of an [`Inventory`]: `{"entries":[{"id":…,"v":…}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedInventory {
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

/// Objects keyed by identity, in first-insertion order.
///
/// Entries keep the encoded identity; decoding happens on read, so a corrupted
/// persisted inventory loads fine and fails in [`Inventory::list`] and friends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "PersistedInventory", into = "PersistedInventory")]
pub struct Inventory {
    entries: Vec<ResourceRef>,
    index: FxHashMap<String, usize>,
}

impl From<PersistedInventory> for Inventory {
    fn from(p: PersistedInventory) -> Self {
        let mut inv = Inventory::new();
        for r in p.entries {
            inv.upsert(r);
        }
        inv
    }
}

impl From<Inventory> for PersistedInventory {
    fn from(inv: Inventory) -> Self {
        PersistedInventory { entries: inv.entries }
    }
}

impl PartialEq for Inventory {
    fn eq(&self, other: &Self) -> bool { self.entries == other.entries }
}

impl Eq for Inventory {}

impl Inventory {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn entries(&self) -> &[ResourceRef] { &self.entries }

    pub fn contains(&self, id: &ObjectId) -> bool { self.contains_with(id, &CompactCodec) }

    pub fn contains_with<C: IdentityCodec + ?Sized>(&self, id: &ObjectId, codec: &C) -> bool {
        self.index.contains_key(&codec.encode(id))
    }

    /// Merge a change set, one record per identity, last write wins.
    ///
    /// All entries are validated before any is admitted; on `InvalidEntry` the inventory is untouched.
    pub fn add_change_set(&mut self, change_set: ChangeSet) -> InventoryResult<()> {
        self.add_change_set_with(change_set, &CompactCodec)
    }

    pub fn add_change_set_with<C: IdentityCodec + ?Sized>(
        &mut self,
        change_set: ChangeSet,
        codec: &C,
    ) -> InventoryResult<()> {
        for e in change_set.iter() {
            let missing = e.id.missing_field().or(if e.group_version.is_empty() { Some("version") } else { None });
            if let Some(field) = missing {
                return Err(InventoryError::InvalidEntry { subject: e.subject.clone(), field: field.to_string() });
            }
        }
        let before = self.entries.len();
        for e in change_set {
            debug!(subject = %e.subject, action = %e.action, "inventory add");
            self.upsert(ResourceRef { id: codec.encode(&e.id), version: e.group_version });
        }
        debug!(added = self.entries.len() - before, total = self.entries.len(), "change set merged");
        Ok(())
    }

    fn upsert(&mut self, r: ResourceRef) {
        match self.index.get(&r.id) {
            Some(&idx) => self.entries[idx] = r,
            None => {
                self.index.insert(r.id.clone(), self.entries.len());
                self.entries.push(r);
            }
        }
    }

    /// Every entry rehydrated into a cluster reference, in entry order.
    pub fn list(&self) -> InventoryResult<Vec<ObjRef>> { self.list_with(&CompactCodec) }

    pub fn list_with<C: IdentityCodec + ?Sized>(&self, codec: &C) -> InventoryResult<Vec<ObjRef>> {
        self.entries
            .iter()
            .map(|r| ObjRef::from_id(codec.decode(&r.id)?, &r.version))
            .collect()
    }

    /// Identities only, in entry order.
    pub fn list_metadata(&self) -> InventoryResult<Vec<ObjectId>> { self.list_metadata_with(&CompactCodec) }

    pub fn list_metadata_with<C: IdentityCodec + ?Sized>(&self, codec: &C) -> InventoryResult<Vec<ObjectId>> {
        self.entries.iter().map(|r| codec.decode(&r.id)).collect()
    }
}

/// Sides of a pruning diff. Named fields keep the direction explicit at call sites.
#[derive(Debug, Clone, Copy)]
pub struct DiffInput<'a> {
    /// Inventory built by the running reconciliation.
    pub current: &'a Inventory,
    /// Baseline from an earlier reconciliation.
    pub previous: &'a Inventory,
}

/// Objects recorded in `previous` whose identity is absent from `current`, in `previous` order.
///
/// Matching is on identity only; a version change alone never makes an object stale.
pub fn diff(input: DiffInput<'_>) -> InventoryResult<Vec<ObjRef>> { diff_with(input, &CompactCodec) }

pub fn diff_with<C: IdentityCodec + ?Sized>(input: DiffInput<'_>, codec: &C) -> InventoryResult<Vec<ObjRef>> {
    let keep: FxHashSet<ObjectId> = input.current.list_metadata_with(codec)?.into_iter().collect();
    let mut stale = Vec::new();
    for r in input.previous.entries() {
        let id = codec.decode(&r.id)?;
        if keep.contains(&id) {
            continue;
        }
        stale.push(ObjRef::from_id(id, &r.version)?);
    }
    debug!(current = input.current.len(), previous = input.previous.len(), stale = stale.len(), "inventory diff");
    Ok(stale)
}
