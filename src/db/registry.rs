use rustc_hash::FxHashMap;

use crate::storage::StructDef;
use crate::types::{Address, NdError, Result, TypeTag};

use super::{Nd, Node};

/// Flat tag-indexed table of concrete node schemas, fixed once built.
#[derive(Clone, Default, Debug)]
pub struct TypeRegistry {
    types: Vec<Option<StructDef>>,
}

/// Collects node schemas before the registry is frozen.
#[derive(Default, Debug)]
pub struct TypeRegistryBuilder {
    types: FxHashMap<u16, StructDef>,
}

impl TypeRegistryBuilder {
    /// Registers a frozen, concrete node schema under its tag.
    pub fn register(&mut self, def: &StructDef) -> Result<&mut Self> {
        let tag = def.tag().ok_or_else(|| {
            NdError::definition(format!("`{}` has no type tag", def.name()))
        })?;
        if !def.is_frozen() {
            return Err(NdError::definition(format!(
                "`{}` registered before done()",
                def.name()
            )));
        }
        if let Some(existing) = self.types.get(&tag.0) {
            return Err(NdError::definition(format!(
                "tag {tag} already registered to `{}`",
                existing.name()
            )));
        }
        self.types.insert(tag.0, def.clone());
        Ok(self)
    }

    /// Freezes the table.
    pub fn build(&self) -> TypeRegistry {
        let len = self.types.keys().max().map_or(0, |max| usize::from(*max) + 1);
        let mut types = vec![None; len];
        for (tag, def) in &self.types {
            types[usize::from(*tag)] = Some(def.clone());
        }
        TypeRegistry { types }
    }
}

impl TypeRegistry {
    /// Starts an empty builder.
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Schema registered under `tag`.
    pub fn get(&self, tag: TypeTag) -> Option<&StructDef> {
        self.types.get(usize::from(tag.0)).and_then(Option::as_ref)
    }

    /// Schema registered under `tag`; an unknown tag means the stored data is not ours.
    pub fn resolve(&self, tag: TypeTag) -> Result<&StructDef> {
        self.get(tag)
            .ok_or_else(|| NdError::corrupt(format!("unknown type tag {tag}")))
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.types.iter().flatten().count()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered schemas in tag order.
    pub fn iter(&self) -> impl Iterator<Item = &StructDef> {
        self.types.iter().flatten()
    }

    /// Record size of the schema registered under `tag`.
    pub fn record_size(&self, tag: TypeTag) -> Result<u32> {
        self.resolve(tag)?.size()
    }

    /// Wraps the record at `address` as a node of the schema under `tag`.
    pub fn construct(&self, nd: &Nd, address: Address, tag: TypeTag) -> Result<Node> {
        Ok(Node::new(nd.clone(), address, self.resolve(tag)?.clone()))
    }

    /// Runs the destructors of the schema under `tag` on `address`.
    pub fn destruct(&self, nd: &Nd, address: Address, tag: TypeTag) -> Result<()> {
        self.resolve(tag)?.destruct(nd, address)
    }

    /// Returns true if deleting a record of this type does more than free it.
    pub fn has_destructor(&self, tag: TypeTag) -> Result<bool> {
        Ok(self.resolve(tag)?.has_destructor())
    }

    /// Returns true if any ref-counted field still points at `address`.
    pub fn has_references(&self, nd: &Nd, address: Address, tag: TypeTag) -> Result<bool> {
        self.resolve(tag)?.has_references(nd, address)
    }
}
