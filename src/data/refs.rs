use std::sync::Arc;

use anyhow::bail;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::wire::message::{downcast_arc, DataType, Message, RefIdentity};


type OwnerKey = (String, u32);

/// The latest known state of all live references and bound references.
///
/// Bound references are keyed by `(bound type, owner type, owner id)` - there is at most one
///  instance of each bound type per owner. A bound reference can only be stored while its owner
///  is stored, and removing the owner removes everything bound to it.
#[derive(Default)]
pub struct RefTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    refs: FxHashMap<String, FxHashMap<u32, Arc<dyn Message>>>,
    bound: FxHashMap<String, FxHashMap<OwnerKey, Arc<dyn Message>>>,
    /// for each owner, the types of all references bound to it
    bound_by_owner: FxHashMap<OwnerKey, FxHashSet<String>>,
}

impl RefTable {
    pub fn new() -> RefTable {
        Default::default()
    }

    /// Stores or removes `msg` depending on its [RefIdentity]. Messages that are not references
    ///  are ignored.
    ///
    /// Storing a live bound reference whose owner is not stored is an error.
    pub fn update(&self, msg: Arc<dyn Message>) -> anyhow::Result<()> {
        let Some(identity) = msg.reference() else {
            return Ok(());
        };

        match identity {
            RefIdentity::Global { id, alive: true } => {
                trace!("storing reference {}#{}", msg.data_type(), id);
                let data_type = msg.data_type().to_string();
                self.inner.write()
                    .refs.entry(data_type)
                    .or_default()
                    .insert(id, msg);
            }
            RefIdentity::Global { id, alive: false } => {
                self.free(msg.data_type(), id);
            }
            RefIdentity::Bound { owner_type, owner_id, alive: true } => {
                let mut inner = self.inner.write();
                let owner_exists = inner.refs.get(owner_type)
                    .map(|m| m.contains_key(&owner_id))
                    .unwrap_or(false);
                if !owner_exists {
                    bail!("cannot bind {} to {}#{}: no such reference", msg.data_type(), owner_type, owner_id);
                }

                trace!("storing bound reference {} for {}#{}", msg.data_type(), owner_type, owner_id);
                let bound_type = msg.data_type().to_string();
                let owner_key = (owner_type.to_string(), owner_id);
                inner.bound_by_owner.entry(owner_key.clone())
                    .or_default()
                    .insert(bound_type.clone());
                inner.bound.entry(bound_type)
                    .or_default()
                    .insert(owner_key, msg);
            }
            RefIdentity::Bound { owner_type, owner_id, alive: false } => {
                self.unbind(msg.data_type(), owner_type, owner_id);
            }
        }
        Ok(())
    }

    /// Removes a reference and (transitively) everything bound to it. Returns `true` if the
    ///  reference was present.
    pub fn free(&self, data_type: &str, id: u32) -> bool {
        let mut inner = self.inner.write();

        let removed = inner.refs.get_mut(data_type)
            .and_then(|m| m.remove(&id))
            .is_some();

        let owner_key = (data_type.to_string(), id);
        if let Some(bound_types) = inner.bound_by_owner.remove(&owner_key) {
            for bound_type in bound_types {
                if let Some(m) = inner.bound.get_mut(&bound_type) {
                    m.remove(&owner_key);
                }
            }
        }

        if removed {
            trace!("freed reference {}#{}", data_type, id);
        }
        removed
    }

    pub fn unbind(&self, bound_type: &str, owner_type: &str, owner_id: u32) -> bool {
        let mut inner = self.inner.write();
        let owner_key = (owner_type.to_string(), owner_id);

        let removed = inner.bound.get_mut(bound_type)
            .and_then(|m| m.remove(&owner_key))
            .is_some();
        if let Some(types) = inner.bound_by_owner.get_mut(&owner_key) {
            types.remove(bound_type);
            if types.is_empty() {
                inner.bound_by_owner.remove(&owner_key);
            }
        }
        removed
    }

    pub fn get_ref<T: DataType>(&self, id: u32) -> Option<Arc<T>> {
        self.get_ref_dyn(T::DATA_TYPE, id)
            .and_then(downcast_arc::<T>)
    }

    pub fn get_ref_dyn(&self, data_type: &str, id: u32) -> Option<Arc<dyn Message>> {
        self.inner.read()
            .refs.get(data_type)
            .and_then(|m| m.get(&id))
            .cloned()
    }

    pub fn get_bound<T: DataType>(&self, owner_type: &str, owner_id: u32) -> Option<Arc<T>> {
        let owner_key = (owner_type.to_string(), owner_id);
        self.inner.read()
            .bound.get(T::DATA_TYPE)
            .and_then(|m| m.get(&owner_key))
            .cloned()
            .and_then(downcast_arc::<T>)
    }

    /// all live references of a given type
    pub fn refs_of<T: DataType>(&self) -> Vec<Arc<T>> {
        let inner = self.inner.read();
        inner.refs.get(T::DATA_TYPE)
            .map(|m| m.values()
                .cloned()
                .filter_map(downcast_arc::<T>)
                .collect())
            .unwrap_or_default()
    }

    /// everything bound to a given owner, in no particular order
    pub fn bound_to(&self, owner_type: &str, owner_id: u32) -> Vec<Arc<dyn Message>> {
        let inner = self.inner.read();
        let owner_key = (owner_type.to_string(), owner_id);
        let Some(types) = inner.bound_by_owner.get(&owner_key) else {
            return Vec::new();
        };
        types.iter()
            .filter_map(|t| inner.bound.get(t))
            .filter_map(|m| m.get(&owner_key))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::message::{TestAvatar, TestPlayer};
    use super::*;

    fn player(id: u32, name: &str) -> Arc<dyn Message> {
        Arc::new(TestPlayer { id, name: name.to_string(), alive: true })
    }

    fn avatar(owner: u32, skin: &str) -> Arc<dyn Message> {
        Arc::new(TestAvatar { owner, skin: skin.to_string(), alive: true })
    }

    #[test]
    fn test_global_refs() {
        let table = RefTable::new();
        table.update(player(1, "a")).unwrap();
        table.update(player(2, "b")).unwrap();
        table.update(player(1, "a2")).unwrap();

        assert_eq!(table.get_ref::<TestPlayer>(1).unwrap().name, "a2");
        assert_eq!(table.get_ref::<TestPlayer>(2).unwrap().name, "b");
        assert!(table.get_ref::<TestPlayer>(3).is_none());

        let mut names = table.refs_of::<TestPlayer>().iter()
            .map(|p| p.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["a2", "b"]);

        table.update(Arc::new(TestPlayer { id: 1, name: "a2".to_string(), alive: false })).unwrap();
        assert!(table.get_ref::<TestPlayer>(1).is_none());
    }

    #[test]
    fn test_wrong_type_does_not_resolve() {
        let table = RefTable::new();
        table.update(player(1, "a")).unwrap();
        assert!(table.get_ref::<TestAvatar>(1).is_none());
    }

    #[test]
    fn test_bind_requires_owner() {
        let table = RefTable::new();
        assert!(table.update(avatar(1, "red")).is_err());
        assert!(table.get_bound::<TestAvatar>(TestPlayer::DATA_TYPE, 1).is_none());

        table.update(player(1, "a")).unwrap();
        table.update(avatar(1, "red")).unwrap();
        assert_eq!(table.get_bound::<TestAvatar>(TestPlayer::DATA_TYPE, 1).unwrap().skin, "red");
        assert_eq!(table.bound_to(TestPlayer::DATA_TYPE, 1).len(), 1);
    }

    #[test]
    fn test_free_owner_frees_bound_and_does_not_resurrect() {
        let table = RefTable::new();
        table.update(player(1, "a")).unwrap();
        table.update(avatar(1, "red")).unwrap();

        assert!(table.free(TestPlayer::DATA_TYPE, 1));
        assert!(table.get_bound::<TestAvatar>(TestPlayer::DATA_TYPE, 1).is_none());
        assert!(table.bound_to(TestPlayer::DATA_TYPE, 1).is_empty());

        // same ID registered again: the stale binding stays gone
        table.update(player(1, "a-again")).unwrap();
        assert!(table.get_bound::<TestAvatar>(TestPlayer::DATA_TYPE, 1).is_none());
        assert!(!table.free(TestPlayer::DATA_TYPE, 2));
    }

    #[test]
    fn test_dead_bound_ref_unbinds() {
        let table = RefTable::new();
        table.update(player(1, "a")).unwrap();
        table.update(avatar(1, "red")).unwrap();

        table.update(Arc::new(TestAvatar { owner: 1, skin: "red".to_string(), alive: false })).unwrap();
        assert!(table.get_bound::<TestAvatar>(TestPlayer::DATA_TYPE, 1).is_none());
        assert!(table.get_ref::<TestPlayer>(1).is_some());
    }
}
