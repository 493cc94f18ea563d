use std::fmt;
use std::hash::{Hash, Hasher};

use crate::storage::StructDef;
use crate::types::{Address, Result, TypeTag};

use super::Nd;

/// A node record, identified by its database handle and address.
///
/// Two nodes are equal when they name the same address in the same handle;
/// field contents play no part.
#[derive(Clone)]
pub struct Node {
    nd: Nd,
    address: Address,
    def: StructDef,
}

impl Node {
    pub(crate) fn new(nd: Nd, address: Address, def: StructDef) -> Self {
        Self { nd, address, def }
    }

    /// Handle the node lives in.
    pub fn nd(&self) -> &Nd {
        &self.nd
    }

    /// Record address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Concrete schema of the record.
    pub fn def(&self) -> &StructDef {
        &self.def
    }

    /// Type tag of the concrete schema.
    pub fn tag(&self) -> Option<TypeTag> {
        self.def.tag()
    }

    /// Returns true if the node's schema is `def` or extends it.
    pub fn is_a(&self, def: &StructDef) -> bool {
        self.def.is_assignable_to(def)
    }

    /// Destructs and frees the record.
    pub fn delete(self) -> Result<()> {
        self.nd.delete_record(&self.def, self.address)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.nd.ptr_eq(&other.nd)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("type", &self.def.name())
            .finish()
    }
}
