//! Typed field handles over fixed offsets inside a record.
//!
//! Reads assert that a database lock is held and writes assert the write
//! lock, both only when the handle runs with lock debugging enabled.

use std::sync::Arc;

use crate::db::Nd;
use crate::primitives::store::PTR_SIZE;
use crate::types::{Address, Result};

use super::schema::{FieldHooks, FieldSlot, StructDef};

macro_rules! scalar_field {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $width:expr, $get:ident, $put:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            slot: FieldSlot,
        }

        impl $name {
            /// Bytes the field occupies in a record.
            pub const RECORD_SIZE: u32 = $width;

            pub(crate) fn new(slot: FieldSlot) -> Self {
                Self { slot }
            }

            /// Absolute offset inside the record; fails before the schema is frozen.
            pub fn offset(&self) -> Result<u32> {
                self.slot.offset()
            }

            /// Reads the field of the record at `record`.
            pub fn get(&self, nd: &Nd, record: Address) -> Result<$ty> {
                nd.check_read();
                nd.store().$get(self.slot.at(record)?)
            }

            /// Writes the field of the record at `record`.
            pub fn put(&self, nd: &Nd, record: Address, value: $ty) -> Result<()> {
                nd.check_write();
                nd.store().$put(self.slot.at(record)?, value)
            }
        }
    };
}

scalar_field!(
    /// Unsigned 8-bit field.
    FieldByte, u8, 1, get_byte, put_byte
);
scalar_field!(
    /// 16-bit code unit field.
    FieldChar, u16, 2, get_char, put_char
);
scalar_field!(
    /// Signed 16-bit field.
    FieldShort, i16, 2, get_short, put_short
);
scalar_field!(
    /// Signed 32-bit field.
    FieldInt, i32, 4, get_int, put_int
);
scalar_field!(
    /// Signed 64-bit field.
    FieldLong, i64, 8, get_long, put_long
);
scalar_field!(
    /// 32-bit float field.
    FieldFloat, f32, 4, get_float, put_float
);
scalar_field!(
    /// 64-bit float field.
    FieldDouble, f64, 8, get_double, put_double
);
scalar_field!(
    /// Raw record pointer with no relationship bookkeeping.
    FieldPointer, Address, PTR_SIZE, get_rec_ptr, put_rec_ptr
);

/// Pointer to a separately allocated string block, freed with the record.
#[derive(Clone)]
pub struct FieldString {
    slot: FieldSlot,
}

impl FieldString {
    /// Bytes the field occupies in a record.
    pub const RECORD_SIZE: u32 = PTR_SIZE;

    pub(crate) fn new(slot: FieldSlot) -> Self {
        Self { slot }
    }

    /// Absolute offset inside the record.
    pub fn offset(&self) -> Result<u32> {
        self.slot.offset()
    }

    /// Address of the string block, null when the field is empty.
    pub fn block(&self, nd: &Nd, record: Address) -> Result<Address> {
        nd.check_read();
        nd.store().get_rec_ptr(self.slot.at(record)?)
    }

    /// Reads the string; an unset field reads as empty.
    pub fn get(&self, nd: &Nd, record: Address) -> Result<String> {
        let block = self.block(nd, record)?;
        if block.is_null() {
            return Ok(String::new());
        }
        nd.store().get_string(block)
    }

    /// Replaces the string, freeing the previous block.
    pub fn put(&self, nd: &Nd, record: Address, value: &str) -> Result<()> {
        nd.check_write();
        let at = self.slot.at(record)?;
        let store = nd.store();
        let old = store.get_rec_ptr(at)?;
        if !old.is_null() {
            if store.get_string(old)? == value {
                return Ok(());
            }
            store.delete_string(old)?;
        }
        let block = if value.is_empty() {
            Address::NULL
        } else {
            store.new_string(value)?
        };
        store.put_rec_ptr(at, block)
    }
}

impl FieldHooks for FieldString {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        let at = self.slot.at(record)?;
        let store = nd.store();
        let block = store.get_rec_ptr(at)?;
        if !block.is_null() {
            store.delete_string(block)?;
            store.put_rec_ptr(at, Address::NULL)?;
        }
        Ok(())
    }
}

impl StructDef {
    /// Appends an unsigned byte field.
    pub fn add_byte(&self) -> Result<FieldByte> {
        Ok(FieldByte::new(self.reserve(FieldByte::RECORD_SIZE)?))
    }

    /// Appends a 16-bit code unit field.
    pub fn add_char(&self) -> Result<FieldChar> {
        Ok(FieldChar::new(self.reserve(FieldChar::RECORD_SIZE)?))
    }

    /// Appends a signed 16-bit field.
    pub fn add_short(&self) -> Result<FieldShort> {
        Ok(FieldShort::new(self.reserve(FieldShort::RECORD_SIZE)?))
    }

    /// Appends a signed 32-bit field.
    pub fn add_int(&self) -> Result<FieldInt> {
        Ok(FieldInt::new(self.reserve(FieldInt::RECORD_SIZE)?))
    }

    /// Appends a signed 64-bit field.
    pub fn add_long(&self) -> Result<FieldLong> {
        Ok(FieldLong::new(self.reserve(FieldLong::RECORD_SIZE)?))
    }

    /// Appends a 32-bit float field.
    pub fn add_float(&self) -> Result<FieldFloat> {
        Ok(FieldFloat::new(self.reserve(FieldFloat::RECORD_SIZE)?))
    }

    /// Appends a 64-bit float field.
    pub fn add_double(&self) -> Result<FieldDouble> {
        Ok(FieldDouble::new(self.reserve(FieldDouble::RECORD_SIZE)?))
    }

    /// Appends a raw pointer field.
    pub fn add_pointer(&self) -> Result<FieldPointer> {
        Ok(FieldPointer::new(self.reserve(FieldPointer::RECORD_SIZE)?))
    }

    /// Appends a string field; its block is freed when the record is destructed.
    pub fn add_string(&self) -> Result<FieldString> {
        let field = FieldString::new(self.reserve(FieldString::RECORD_SIZE)?);
        self.register_hooks(Arc::new(field.clone()))?;
        Ok(field)
    }
}
