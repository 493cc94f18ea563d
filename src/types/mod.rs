#![forbid(unsafe_code)]
//! Identifiers and the crate-wide error type shared by every layer.

use std::fmt;

/// Byte offset of a record inside the chunk store. `Address::NULL` is never a valid record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Address(pub u64);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Returns true for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `delta` bytes past this one.
    pub const fn offset(self, delta: u64) -> Address {
        Address(self.0 + delta)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Type tag written as the first field of every node record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeTag(pub u16);

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u16> for TypeTag {
    fn from(value: u16) -> Self {
        TypeTag(value)
    }
}

impl From<TypeTag> for u16 {
    fn from(value: TypeTag) -> Self {
        value.0
    }
}

/// Errors surfaced by the store, the schema layer and the database handle.
#[derive(thiserror::Error, Debug)]
pub enum NdError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The on-disk structure cannot be trusted; the index must be rebuilt.
    #[error("index corrupt: {0}")]
    IndexCorrupt(String),
    /// A field was added to, or `done` was called on, an already frozen schema.
    #[error("schema `{0}` is frozen")]
    SchemaFrozen(String),
    /// Schema authoring misuse detected while declaring or pairing fields.
    #[error("schema definition: {0}")]
    SchemaDefinition(String),
    /// Cancelled while waiting for the write lock; nothing was mutated.
    #[error("operation cancelled")]
    OperationCancelled,
    /// A typed load found a node whose type is not assignable to the expected one.
    #[error("type mismatch at {address}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Address that was loaded.
        address: Address,
        /// Name of the expected schema.
        expected: String,
        /// Name of the schema actually stored there.
        found: String,
    },
    /// Options file could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// Invalid argument or state.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NdError>;

impl NdError {
    /// Returns true when the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NdError::OperationCancelled)
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        NdError::IndexCorrupt(msg.into())
    }

    pub(crate) fn definition(msg: impl Into<String>) -> Self {
        NdError::SchemaDefinition(msg.into())
    }
}
