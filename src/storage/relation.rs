//! Bidirectional relationship fields.
//!
//! A many-to-one forward pointer is paired with a one-to-many list on the
//! target schema; the forward side caches its position in the target's list
//! so unlinking is O(1) with swap-remove. A one-to-one forward pointer is
//! paired with a single backpointer. Both pairings are set up once, while the
//! schemas are being authored, and every mutation keeps the two sides in sync.
//!
//! Records that lose their last reference are queued for deferred deletion
//! when their schema is reference counted; ownership flags queue deletions
//! unconditionally.

use std::sync::{Arc, OnceLock};

use crate::db::{DeletionKind, Nd};
use crate::primitives::store::PTR_SIZE;
use crate::types::{Address, NdError, Result};

use super::array::GrowableArray;
use super::schema::{FieldHooks, FieldSlot, StructDef};

/// Lifetime coupling between the two ends of a relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Neither end's lifetime depends on the other.
    #[default]
    None,
    /// The source owns its target: dropping or replacing the target deletes it.
    OwnsTarget,
    /// The source is owned by its target: losing the target deletes the source.
    OwnedByTarget,
}

const INDEX_OFFSET: u64 = PTR_SIZE as u64;
const DEFAULT_INLINE: u32 = 2;

/// Forward pointer of a many-to-one relationship.
#[derive(Clone)]
pub struct FieldManyToOne {
    slot: FieldSlot,
    ownership: Ownership,
    list: Arc<OnceLock<GrowableArray>>,
}

impl FieldManyToOne {
    /// Bytes the field occupies: target pointer plus cached list index.
    pub const RECORD_SIZE: u32 = PTR_SIZE + 4;

    /// Ownership flag of this pointer.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Target of the record at `record`, null if unlinked.
    pub fn get(&self, nd: &Nd, record: Address) -> Result<Address> {
        nd.check_read();
        nd.store().get_rec_ptr(self.slot.at(record)?)
    }

    /// Position of `record` inside its target's list.
    pub fn index(&self, nd: &Nd, record: Address) -> Result<u32> {
        nd.check_read();
        let at = self.slot.at(record)?.offset(INDEX_OFFSET);
        Ok(nd.store().get_int(at)? as u32)
    }

    /// Points `record` at `target`, moving it between the targets' lists.
    pub fn put(&self, nd: &Nd, record: Address, target: Address) -> Result<()> {
        nd.check_write();
        self.link(nd, record, target, true)
    }

    fn paired_list(&self) -> Result<&GrowableArray> {
        self.list
            .get()
            .ok_or_else(|| NdError::definition("many-to-one pointer used before it was paired"))
    }

    fn link(&self, nd: &Nd, record: Address, target: Address, schedule_self: bool) -> Result<()> {
        let store = nd.store();
        let at = self.slot.at(record)?;
        let old = store.get_rec_ptr(at)?;
        if old == target {
            return Ok(());
        }
        if !old.is_null() {
            let list = self.paired_list()?;
            let index = store.get_int(at.offset(INDEX_OFFSET))? as u32;
            if let Some(moved) = list.remove(nd, old, index)? {
                store.put_int(self.slot.at(moved)?.offset(INDEX_OFFSET), index as i32)?;
            }
        }
        let index = if target.is_null() {
            0
        } else {
            self.paired_list()?.add(nd, target, record)?
        };
        store.put_rec_ptr(at, target)?;
        store.put_int(at.offset(INDEX_OFFSET), index as i32)?;

        if !old.is_null() {
            match self.ownership {
                Ownership::OwnsTarget => nd.schedule_deletion(old, DeletionKind::Owned),
                _ => nd.schedule_if_unreferenced(old)?,
            }
            if target.is_null() && schedule_self && self.ownership == Ownership::OwnedByTarget {
                nd.schedule_deletion(record, DeletionKind::Owned);
            }
        }
        Ok(())
    }
}

impl FieldHooks for FieldManyToOne {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        self.link(nd, record, Address::NULL, false)
    }
}

/// Backing list of a many-to-one relationship, stored on the target.
#[derive(Clone)]
pub struct FieldOneToMany {
    array: GrowableArray,
    owns_elements: bool,
    forward: FieldManyToOne,
}

impl FieldOneToMany {
    /// Number of records pointing at `record`.
    pub fn size(&self, nd: &Nd, record: Address) -> Result<u32> {
        nd.check_read();
        self.array.size(nd, record)
    }

    /// Returns true if nothing points at `record`.
    pub fn is_empty(&self, nd: &Nd, record: Address) -> Result<bool> {
        Ok(self.size(nd, record)? == 0)
    }

    /// Element `index` of the list held by `record`.
    pub fn get(&self, nd: &Nd, record: Address, index: u32) -> Result<Address> {
        nd.check_read();
        self.array.get(nd, record, index)
    }

    /// Every source record, in list order.
    pub fn addresses(&self, nd: &Nd, record: Address) -> Result<Vec<Address>> {
        nd.check_read();
        self.array.addresses(nd, record)
    }

    /// Returns true if `source` is in the list held by `record`.
    pub fn contains(&self, nd: &Nd, record: Address, source: Address) -> Result<bool> {
        if source.is_null() {
            return Ok(false);
        }
        Ok(self.forward.get(nd, source)? == record)
    }

    /// Returns true if elements are deleted along with the list's holder.
    pub fn owns_elements(&self) -> bool {
        self.owns_elements
    }
}

impl FieldHooks for FieldOneToMany {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        let store = nd.store();
        let delete_elements =
            self.owns_elements || self.forward.ownership == Ownership::OwnedByTarget;
        for element in self.array.addresses(nd, record)? {
            let at = self.forward.slot.at(element)?;
            store.put_rec_ptr(at, Address::NULL)?;
            store.put_int(at.offset(INDEX_OFFSET), 0)?;
            if delete_elements {
                nd.schedule_deletion(element, DeletionKind::Owned);
            }
        }
        self.array.destruct(nd, record)
    }

    fn is_ref_counted(&self) -> bool {
        true
    }

    fn has_references(&self, nd: &Nd, record: Address) -> Result<bool> {
        Ok(self.array.size(nd, record)? > 0)
    }
}

/// Forward pointer of a one-to-one relationship.
#[derive(Clone)]
pub struct FieldOneToOne {
    slot: FieldSlot,
    ownership: Ownership,
    back: Arc<OnceLock<FieldSlot>>,
}

impl FieldOneToOne {
    /// Bytes the field occupies.
    pub const RECORD_SIZE: u32 = PTR_SIZE;

    /// Ownership flag of this pointer.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Target of `record`, null if unlinked.
    pub fn get(&self, nd: &Nd, record: Address) -> Result<Address> {
        nd.check_read();
        nd.store().get_rec_ptr(self.slot.at(record)?)
    }

    /// Points `record` at `target`. A source previously linked to `target`
    /// loses its link.
    pub fn put(&self, nd: &Nd, record: Address, target: Address) -> Result<()> {
        nd.check_write();
        self.link(nd, record, target, true)
    }

    fn paired_back(&self) -> Result<&FieldSlot> {
        self.back
            .get()
            .ok_or_else(|| NdError::definition("one-to-one pointer used before it was paired"))
    }

    fn link(&self, nd: &Nd, record: Address, target: Address, schedule_self: bool) -> Result<()> {
        let store = nd.store();
        let at = self.slot.at(record)?;
        let old = store.get_rec_ptr(at)?;
        if old == target {
            return Ok(());
        }
        if !old.is_null() {
            store.put_rec_ptr(self.paired_back()?.at(old)?, Address::NULL)?;
        }
        if !target.is_null() {
            let back_at = self.paired_back()?.at(target)?;
            let previous = store.get_rec_ptr(back_at)?;
            if !previous.is_null() && previous != record {
                store.put_rec_ptr(self.slot.at(previous)?, Address::NULL)?;
                if self.ownership == Ownership::OwnedByTarget {
                    nd.schedule_deletion(previous, DeletionKind::Owned);
                }
            }
            store.put_rec_ptr(back_at, record)?;
        }
        store.put_rec_ptr(at, target)?;

        if !old.is_null() {
            match self.ownership {
                Ownership::OwnsTarget => nd.schedule_deletion(old, DeletionKind::Owned),
                _ => nd.schedule_if_unreferenced(old)?,
            }
            if target.is_null() && schedule_self && self.ownership == Ownership::OwnedByTarget {
                nd.schedule_deletion(record, DeletionKind::Owned);
            }
        }
        Ok(())
    }
}

impl FieldHooks for FieldOneToOne {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        self.link(nd, record, Address::NULL, false)
    }
}

/// Target side of a one-to-one relationship.
#[derive(Clone)]
pub struct FieldOneToOneBackpointer {
    slot: FieldSlot,
    forward: FieldOneToOne,
}

impl FieldOneToOneBackpointer {
    /// Bytes the field occupies.
    pub const RECORD_SIZE: u32 = PTR_SIZE;

    /// Source currently pointing at `record`, null if none.
    pub fn get(&self, nd: &Nd, record: Address) -> Result<Address> {
        nd.check_read();
        nd.store().get_rec_ptr(self.slot.at(record)?)
    }
}

impl FieldHooks for FieldOneToOneBackpointer {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        let store = nd.store();
        let at = self.slot.at(record)?;
        let source = store.get_rec_ptr(at)?;
        if source.is_null() {
            return Ok(());
        }
        store.put_rec_ptr(self.forward.slot.at(source)?, Address::NULL)?;
        store.put_rec_ptr(at, Address::NULL)?;
        if self.forward.ownership == Ownership::OwnedByTarget {
            nd.schedule_deletion(source, DeletionKind::Owned);
        }
        Ok(())
    }

    fn is_ref_counted(&self) -> bool {
        true
    }

    fn has_references(&self, nd: &Nd, record: Address) -> Result<bool> {
        Ok(!nd.store().get_rec_ptr(self.slot.at(record)?)?.is_null())
    }
}

impl StructDef {
    /// Appends a many-to-one forward pointer. Pair it with
    /// [`StructDef::add_one_to_many`] on the target schema before use.
    pub fn add_many_to_one(&self, ownership: Ownership) -> Result<FieldManyToOne> {
        let field = FieldManyToOne {
            slot: self.reserve(FieldManyToOne::RECORD_SIZE)?,
            ownership,
            list: Arc::new(OnceLock::new()),
        };
        self.register_hooks(Arc::new(field.clone()))?;
        Ok(field)
    }

    /// Appends the list side of `forward`; elements are not owned.
    pub fn add_one_to_many(&self, forward: &FieldManyToOne) -> Result<FieldOneToMany> {
        self.add_one_to_many_with(forward, false, DEFAULT_INLINE)
    }

    /// Appends the list side of `forward`; elements are deleted with the holder.
    pub fn add_owning_one_to_many(&self, forward: &FieldManyToOne) -> Result<FieldOneToMany> {
        self.add_one_to_many_with(forward, true, DEFAULT_INLINE)
    }

    /// Appends the list side of `forward` with explicit ownership and inline capacity.
    pub fn add_one_to_many_with(
        &self,
        forward: &FieldManyToOne,
        owns_elements: bool,
        inline_capacity: u32,
    ) -> Result<FieldOneToMany> {
        if forward.list.get().is_some() {
            return Err(NdError::definition("many-to-one pointer is already paired"));
        }
        let array = self.add_array(inline_capacity)?;
        forward
            .list
            .set(array.clone())
            .map_err(|_| NdError::definition("many-to-one pointer is already paired"))?;
        let field = FieldOneToMany {
            array,
            owns_elements,
            forward: forward.clone(),
        };
        self.register_hooks(Arc::new(field.clone()))?;
        Ok(field)
    }

    /// Appends a one-to-one forward pointer. Pair it with
    /// [`StructDef::add_one_to_one_backpointer`] on the target schema before use.
    pub fn add_one_to_one(&self, ownership: Ownership) -> Result<FieldOneToOne> {
        let field = FieldOneToOne {
            slot: self.reserve(FieldOneToOne::RECORD_SIZE)?,
            ownership,
            back: Arc::new(OnceLock::new()),
        };
        self.register_hooks(Arc::new(field.clone()))?;
        Ok(field)
    }

    /// Appends the backpointer side of `forward`.
    pub fn add_one_to_one_backpointer(
        &self,
        forward: &FieldOneToOne,
    ) -> Result<FieldOneToOneBackpointer> {
        if forward.back.get().is_some() {
            return Err(NdError::definition("one-to-one pointer is already paired"));
        }
        let slot = self.reserve(FieldOneToOneBackpointer::RECORD_SIZE)?;
        forward
            .back
            .set(slot.clone())
            .map_err(|_| NdError::definition("one-to-one pointer is already paired"))?;
        let field = FieldOneToOneBackpointer {
            slot,
            forward: forward.clone(),
        };
        self.register_hooks(Arc::new(field.clone()))?;
        Ok(field)
    }
}
