//! Growable array of record pointers stored inside a record.
//!
//! Record layout: `[count u32][overflow u64][inline slots]`. Elements past the
//! inline capacity live in a separately allocated overflow block laid out as
//! `[capacity u32][slots]`, which doubles when full and is released once the
//! array fits inline again.

use crate::db::Nd;
use crate::primitives::store::{ChunkStore, PTR_SIZE};
use crate::types::{Address, NdError, Result};

use super::schema::{FieldSlot, StructDef};

const COUNT_OFFSET: u64 = 0;
const OVERFLOW_OFFSET: u64 = 4;
const INLINE_OFFSET: u64 = 12;
const OVERFLOW_HEADER: u64 = 4;
const MIN_OVERFLOW: u32 = 4;

/// Array of record pointers with swap-remove semantics.
#[derive(Clone)]
pub struct GrowableArray {
    slot: FieldSlot,
    inline_capacity: u32,
}

impl GrowableArray {
    pub(crate) fn new(slot: FieldSlot, inline_capacity: u32) -> Self {
        Self {
            slot,
            inline_capacity,
        }
    }

    /// Bytes the array header and inline slots occupy in the record.
    pub const fn record_size(inline_capacity: u32) -> u32 {
        INLINE_OFFSET as u32 + inline_capacity * PTR_SIZE
    }

    /// Number of elements.
    pub fn size(&self, nd: &Nd, record: Address) -> Result<u32> {
        nd.store().get_int(self.slot.at(record)?.offset(COUNT_OFFSET)).map(|n| n as u32)
    }

    /// Returns true if the array holds no elements.
    pub fn is_empty(&self, nd: &Nd, record: Address) -> Result<bool> {
        Ok(self.size(nd, record)? == 0)
    }

    /// Element at `index`.
    pub fn get(&self, nd: &Nd, record: Address, index: u32) -> Result<Address> {
        let base = self.slot.at(record)?;
        let store = nd.store();
        let count = read_count(store, base)?;
        if index >= count {
            return Err(NdError::Invalid("array index out of bounds"));
        }
        store.get_rec_ptr(self.element_at(store, base, index)?)
    }

    /// Every element in index order.
    pub fn addresses(&self, nd: &Nd, record: Address) -> Result<Vec<Address>> {
        let base = self.slot.at(record)?;
        let store = nd.store();
        let count = read_count(store, base)?;
        (0..count)
            .map(|i| store.get_rec_ptr(self.element_at(store, base, i)?))
            .collect()
    }

    /// Appends `value`, returning its index.
    pub fn add(&self, nd: &Nd, record: Address, value: Address) -> Result<u32> {
        let base = self.slot.at(record)?;
        let store = nd.store();
        let count = read_count(store, base)?;
        if count >= self.inline_capacity {
            self.ensure_overflow(store, base, count - self.inline_capacity + 1)?;
        }
        store.put_rec_ptr(self.element_at(store, base, count)?, value)?;
        store.put_int(base.offset(COUNT_OFFSET), (count + 1) as i32)?;
        Ok(count)
    }

    /// Removes the element at `index` by moving the last element into its slot.
    ///
    /// Returns the element that now sits at `index`, or `None` when the removed
    /// element was last.
    pub fn remove(&self, nd: &Nd, record: Address, index: u32) -> Result<Option<Address>> {
        let base = self.slot.at(record)?;
        let store = nd.store();
        let count = read_count(store, base)?;
        if index >= count {
            return Err(NdError::Invalid("array index out of bounds"));
        }
        let last = count - 1;
        let last_at = self.element_at(store, base, last)?;
        let moved = if index != last {
            let value = store.get_rec_ptr(last_at)?;
            store.put_rec_ptr(self.element_at(store, base, index)?, value)?;
            Some(value)
        } else {
            None
        };
        store.put_rec_ptr(last_at, Address::NULL)?;
        store.put_int(base.offset(COUNT_OFFSET), last as i32)?;
        if last <= self.inline_capacity {
            self.release_overflow(store, base)?;
        }
        Ok(moved)
    }

    /// Empties the array and frees its overflow block.
    pub fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        let base = self.slot.at(record)?;
        let store = nd.store();
        self.release_overflow(store, base)?;
        for i in 0..self.inline_capacity {
            store.put_rec_ptr(inline_slot(base, i), Address::NULL)?;
        }
        store.put_int(base.offset(COUNT_OFFSET), 0)
    }

    fn element_at(&self, store: &dyn ChunkStore, base: Address, index: u32) -> Result<Address> {
        if index < self.inline_capacity {
            return Ok(inline_slot(base, index));
        }
        let overflow = store.get_rec_ptr(base.offset(OVERFLOW_OFFSET))?;
        if overflow.is_null() {
            return Err(NdError::corrupt(format!(
                "array at {base} has {index} elements but no overflow block"
            )));
        }
        let slot = u64::from(index - self.inline_capacity);
        Ok(overflow.offset(OVERFLOW_HEADER + slot * u64::from(PTR_SIZE)))
    }

    fn ensure_overflow(&self, store: &dyn ChunkStore, base: Address, needed: u32) -> Result<()> {
        let at = base.offset(OVERFLOW_OFFSET);
        let old = store.get_rec_ptr(at)?;
        let capacity = if old.is_null() {
            0
        } else {
            store.get_int(old)? as u32
        };
        if needed <= capacity {
            return Ok(());
        }
        let new_capacity = needed.max(capacity * 2).max(MIN_OVERFLOW);
        let block = store.malloc(OVERFLOW_HEADER as u32 + new_capacity * PTR_SIZE)?;
        store.put_int(block, new_capacity as i32)?;
        if !old.is_null() {
            let mut slots = vec![0u8; (capacity * PTR_SIZE) as usize];
            store.read(old.offset(OVERFLOW_HEADER), &mut slots)?;
            store.write(block.offset(OVERFLOW_HEADER), &slots)?;
            store.free(old)?;
        }
        store.put_rec_ptr(at, block)
    }

    fn release_overflow(&self, store: &dyn ChunkStore, base: Address) -> Result<()> {
        let at = base.offset(OVERFLOW_OFFSET);
        let block = store.get_rec_ptr(at)?;
        if !block.is_null() {
            store.free(block)?;
            store.put_rec_ptr(at, Address::NULL)?;
        }
        Ok(())
    }
}

fn read_count(store: &dyn ChunkStore, base: Address) -> Result<u32> {
    let count = store.get_int(base.offset(COUNT_OFFSET))?;
    u32::try_from(count)
        .map_err(|_| NdError::corrupt(format!("array at {base} has negative count {count}")))
}

fn inline_slot(base: Address, index: u32) -> Address {
    base.offset(INLINE_OFFSET + u64::from(index) * u64::from(PTR_SIZE))
}

impl StructDef {
    /// Appends a growable pointer array with `inline_capacity` slots kept in the record.
    pub fn add_array(&self, inline_capacity: u32) -> Result<GrowableArray> {
        let slot = self.reserve(GrowableArray::record_size(inline_capacity))?;
        Ok(GrowableArray::new(slot, inline_capacity))
    }
}
