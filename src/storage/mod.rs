//! Schema layer: struct definitions, typed fields and relationship fields.
//!
//! Everything here addresses records by `(Nd, Address)`; no field handle
//! holds on to a record or a buffer.

/// Comparator-driven B-tree over record addresses.
///
/// Backs the search index; usable directly for custom orderings.
pub mod btree;

mod array;
mod field;
mod relation;
mod schema;
mod search;

pub use array::GrowableArray;
pub use field::{
    FieldByte, FieldChar, FieldDouble, FieldFloat, FieldInt, FieldLong, FieldPointer, FieldShort,
    FieldString,
};
pub use relation::{
    FieldManyToOne, FieldOneToMany, FieldOneToOne, FieldOneToOneBackpointer, Ownership,
};
pub use schema::{node_base, Destructor, StructDef};
pub use search::{compare_keys, FieldSearchIndex, FieldSearchKey, SearchCriteria};

pub(crate) use schema::node_type_field;
