//! Contract with the subsystem that owns the objects attributes refer to.
//!
//! The parser never owns objects. It asks the registry to resolve each object attribute under the
//! attribute's access mode, keeps the returned [`ObjectHandle`] for the duration of the request,
//! and afterwards either commits or aborts every handle it obtained.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::spec::{AccessMode, ObjectClass, ObjectType};

/// A resolved object, valid for the lifetime of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub class: ObjectClass,
    /// Spec-tree object id describing the object's type.
    pub obj_type: u16,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no such object")]
    NotFound,

    #[error("object has a different type")]
    TypeMismatch,

    #[error("object is in use")]
    Busy,

    #[error("object id space exhausted")]
    Exhausted,
}

pub trait ObjectRegistry {
    /// Resolves `id` under `access`.
    ///
    /// - `Read` takes a shared hold on an existing object.
    /// - `Write` and `Destroy` take an exclusive hold on an existing object.
    /// - `Create` allocates a pending object with a fresh id and ignores `id`.
    fn resolve(
        &mut self,
        obj_type: u16,
        type_attrs: &ObjectType,
        id: u32,
        access: AccessMode,
    ) -> Result<ObjectHandle, RegistryError>;

    /// Makes the outcome of a successful request permanent: publishes created objects, removes
    /// destroyed ones and drops any hold.
    fn commit(&mut self, handle: &ObjectHandle, access: AccessMode);

    /// Undoes `resolve`: discards pending objects and drops any hold.
    fn abort(&mut self, handle: &ObjectHandle, access: AccessMode);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Live,
}

#[derive(Debug, Clone)]
struct Entry {
    obj_type: u16,
    state: EntryState,
    /// Positive: number of shared holds. `-1`: held exclusively.
    usecnt: i32,
}

/// In-memory [`ObjectRegistry`] with per-class id spaces and reader/writer holds.
#[derive(Debug, Clone, Default)]
pub struct HandleTable {
    entries: BTreeMap<(ObjectClass, u32), Entry>,
    next_idr: u32,
    next_fd: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (committed) objects.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Live)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, class: ObjectClass, id: u32) -> bool {
        self.entries
            .get(&(class, id))
            .is_some_and(|e| e.state == EntryState::Live)
    }

    /// Current hold count of a live object: shared holds, `-1` if exclusive, `None` if absent.
    pub fn use_count(&self, class: ObjectClass, id: u32) -> Option<i32> {
        self.entries
            .get(&(class, id))
            .filter(|e| e.state == EntryState::Live)
            .map(|e| e.usecnt)
    }

    /// Publishes a new object directly, bypassing a request.
    pub fn insert(
        &mut self,
        class: ObjectClass,
        obj_type: u16,
    ) -> Result<ObjectHandle, RegistryError> {
        let id = self.alloc_id(class)?;
        self.entries.insert(
            (class, id),
            Entry {
                obj_type,
                state: EntryState::Live,
                usecnt: 0,
            },
        );
        Ok(ObjectHandle {
            class,
            obj_type,
            id,
        })
    }

    fn alloc_id(&mut self, class: ObjectClass) -> Result<u32, RegistryError> {
        let next = match class {
            ObjectClass::Idr => &mut self.next_idr,
            ObjectClass::Fd => &mut self.next_fd,
        };
        // Ids must stay representable as a non-negative i32 on the wire.
        if *next > i32::MAX as u32 {
            return Err(RegistryError::Exhausted);
        }
        let id = *next;
        *next += 1;
        Ok(id)
    }
}

impl ObjectRegistry for HandleTable {
    fn resolve(
        &mut self,
        obj_type: u16,
        type_attrs: &ObjectType,
        id: u32,
        access: AccessMode,
    ) -> Result<ObjectHandle, RegistryError> {
        let class = type_attrs.class;
        let id = match access {
            AccessMode::Create => self.create_pending(class, obj_type)?,
            AccessMode::Read | AccessMode::Write | AccessMode::Destroy => {
                self.hold(class, obj_type, id, access)?;
                id
            }
        };
        Ok(ObjectHandle {
            class,
            obj_type,
            id,
        })
    }

    fn commit(&mut self, handle: &ObjectHandle, access: AccessMode) {
        let key = (handle.class, handle.id);
        match access {
            AccessMode::Create => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.state = EntryState::Live;
                    entry.usecnt = 0;
                }
            }
            AccessMode::Destroy => {
                self.entries.remove(&key);
            }
            AccessMode::Read | AccessMode::Write => self.release(key, access),
        }
    }

    fn abort(&mut self, handle: &ObjectHandle, access: AccessMode) {
        let key = (handle.class, handle.id);
        match access {
            AccessMode::Create => {
                if self
                    .entries
                    .get(&key)
                    .is_some_and(|e| e.state == EntryState::Pending)
                {
                    self.entries.remove(&key);
                }
            }
            AccessMode::Read | AccessMode::Write | AccessMode::Destroy => {
                self.release(key, access)
            }
        }
    }
}

impl HandleTable {
    fn create_pending(&mut self, class: ObjectClass, obj_type: u16) -> Result<u32, RegistryError> {
        let id = self.alloc_id(class)?;
        if self.entries.contains_key(&(class, id)) {
            return Err(RegistryError::Busy);
        }
        self.entries.insert(
            (class, id),
            Entry {
                obj_type,
                state: EntryState::Pending,
                usecnt: -1,
            },
        );
        Ok(id)
    }

    fn hold(
        &mut self,
        class: ObjectClass,
        obj_type: u16,
        id: u32,
        access: AccessMode,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(&(class, id))
            .filter(|e| e.state == EntryState::Live)
            .ok_or(RegistryError::NotFound)?;
        if entry.obj_type != obj_type {
            return Err(RegistryError::TypeMismatch);
        }

        if access == AccessMode::Read {
            if entry.usecnt < 0 {
                return Err(RegistryError::Busy);
            }
            entry.usecnt += 1;
        } else {
            if entry.usecnt != 0 {
                return Err(RegistryError::Busy);
            }
            entry.usecnt = -1;
        }
        Ok(())
    }

    fn release(&mut self, key: (ObjectClass, u32), access: AccessMode) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        match access {
            AccessMode::Read => entry.usecnt = (entry.usecnt - 1).max(0),
            _ => entry.usecnt = 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PD: ObjectType = ObjectType::idr("pd");
    const PD_ID: u16 = 3;

    #[test]
    fn create_is_invisible_until_committed() {
        let mut table = HandleTable::new();
        let handle = table.resolve(PD_ID, &PD, 0, AccessMode::Create).unwrap();
        assert!(!table.contains(ObjectClass::Idr, handle.id));
        assert_eq!(
            table.resolve(PD_ID, &PD, handle.id, AccessMode::Read),
            Err(RegistryError::NotFound)
        );

        table.commit(&handle, AccessMode::Create);
        assert!(table.contains(ObjectClass::Idr, handle.id));
        assert_eq!(table.use_count(ObjectClass::Idr, handle.id), Some(0));
    }

    #[test]
    fn aborted_create_leaves_nothing_behind() {
        let mut table = HandleTable::new();
        let handle = table.resolve(PD_ID, &PD, 0, AccessMode::Create).unwrap();
        table.abort(&handle, AccessMode::Create);
        assert!(table.is_empty());

        // Ids are not reused.
        let next = table.resolve(PD_ID, &PD, 0, AccessMode::Create).unwrap();
        assert_ne!(next.id, handle.id);
    }

    #[test]
    fn readers_share_and_writers_exclude() {
        let mut table = HandleTable::new();
        let obj = table.insert(ObjectClass::Idr, PD_ID).unwrap();

        let r1 = table.resolve(PD_ID, &PD, obj.id, AccessMode::Read).unwrap();
        let r2 = table.resolve(PD_ID, &PD, obj.id, AccessMode::Read).unwrap();
        assert_eq!(table.use_count(ObjectClass::Idr, obj.id), Some(2));
        assert_eq!(
            table.resolve(PD_ID, &PD, obj.id, AccessMode::Write),
            Err(RegistryError::Busy)
        );

        table.commit(&r1, AccessMode::Read);
        table.abort(&r2, AccessMode::Read);
        let w = table.resolve(PD_ID, &PD, obj.id, AccessMode::Write).unwrap();
        assert_eq!(
            table.resolve(PD_ID, &PD, obj.id, AccessMode::Read),
            Err(RegistryError::Busy)
        );
        table.commit(&w, AccessMode::Write);
        assert_eq!(table.use_count(ObjectClass::Idr, obj.id), Some(0));
    }

    #[test]
    fn destroy_removes_on_commit_only() {
        let mut table = HandleTable::new();
        let obj = table.insert(ObjectClass::Idr, PD_ID).unwrap();

        let d = table.resolve(PD_ID, &PD, obj.id, AccessMode::Destroy).unwrap();
        table.abort(&d, AccessMode::Destroy);
        assert!(table.contains(ObjectClass::Idr, obj.id));

        let d = table.resolve(PD_ID, &PD, obj.id, AccessMode::Destroy).unwrap();
        table.commit(&d, AccessMode::Destroy);
        assert!(!table.contains(ObjectClass::Idr, obj.id));
    }

    #[test]
    fn type_and_class_must_match() {
        let mut table = HandleTable::new();
        let obj = table.insert(ObjectClass::Idr, PD_ID).unwrap();

        assert_eq!(
            table.resolve(PD_ID + 1, &PD, obj.id, AccessMode::Read),
            Err(RegistryError::TypeMismatch)
        );
        assert_eq!(
            table.resolve(PD_ID, &ObjectType::fd("pd"), obj.id, AccessMode::Read),
            Err(RegistryError::NotFound)
        );
    }
}
