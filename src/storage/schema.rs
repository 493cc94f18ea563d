//! Struct schemas: ordered fields over raw byte offsets, frozen once.
//!
//! A [`StructDef`] hands out field handles while it is open. Offsets are
//! local to the schema until [`StructDef::done`] freezes it; at that point the
//! schema's base offset (the parent's total size) is fixed and every field
//! handle resolves to an absolute offset inside any record of that schema.
//! A subclass whose `done` was called before its parent froze is finalized
//! when the parent freezes.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::db::Nd;
use crate::types::{Address, NdError, Result, TypeTag};

use super::field::FieldChar;

/// User destructor run before the automatic field destructors.
pub type Destructor = Arc<dyn Fn(&Nd, Address) -> Result<()> + Send + Sync>;

/// Per-schema base offset, shared by every field handle of that schema.
pub(crate) struct Layout {
    name: String,
    base: OnceLock<u32>,
}

/// Position of one field inside its schema.
#[derive(Clone)]
pub(crate) struct FieldSlot {
    layout: Arc<Layout>,
    local: u32,
}

impl FieldSlot {
    /// Absolute offset of the field inside a record.
    pub(crate) fn offset(&self) -> Result<u32> {
        self.layout
            .base
            .get()
            .map(|base| base + self.local)
            .ok_or_else(|| {
                NdError::definition(format!(
                    "field of `{}` used before done()",
                    self.layout.name
                ))
            })
    }

    /// Address of the field inside the record at `record`.
    pub(crate) fn at(&self, record: Address) -> Result<Address> {
        Ok(record.offset(u64::from(self.offset()?)))
    }
}

/// Automatic behaviour a field contributes to record destruction and
/// reference counting.
pub(crate) trait FieldHooks: Send + Sync {
    fn destruct(&self, nd: &Nd, record: Address) -> Result<()>;

    fn is_ref_counted(&self) -> bool {
        false
    }

    fn has_references(&self, _nd: &Nd, _record: Address) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Default)]
struct DefState {
    local_size: u32,
    field_count: usize,
    hooks: Vec<Arc<dyn FieldHooks>>,
    sealed: bool,
    total_size: Option<u32>,
    ref_counted: bool,
    destructor: Option<Destructor>,
    subclasses: Vec<Weak<StructInner>>,
}

struct StructInner {
    name: String,
    tag: Option<TypeTag>,
    is_abstract: bool,
    parent: Option<StructDef>,
    layout: Arc<Layout>,
    state: Mutex<DefState>,
}

/// Schema of a record type. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StructDef {
    inner: Arc<StructInner>,
}

struct NodeBase {
    def: StructDef,
    tag_field: FieldChar,
}

static NODE_BASE: OnceLock<NodeBase> = OnceLock::new();

fn node_base_parts() -> &'static NodeBase {
    NODE_BASE.get_or_init(|| {
        let layout = Arc::new(Layout {
            name: "NdNode".to_string(),
            base: OnceLock::new(),
        });
        let _ = layout.base.set(0);
        let state = DefState {
            local_size: FieldChar::RECORD_SIZE,
            field_count: 1,
            sealed: true,
            total_size: Some(FieldChar::RECORD_SIZE),
            ..DefState::default()
        };
        let tag_field = FieldChar::new(FieldSlot {
            layout: Arc::clone(&layout),
            local: 0,
        });
        let def = StructDef {
            inner: Arc::new(StructInner {
                name: "NdNode".to_string(),
                tag: None,
                is_abstract: true,
                parent: None,
                layout,
                state: Mutex::new(state),
            }),
        };
        NodeBase { def, tag_field }
    })
}

/// Root schema of every node type. Holds only the type tag, at offset 0.
pub fn node_base() -> &'static StructDef {
    &node_base_parts().def
}

/// The type tag field shared by every node record.
pub(crate) fn node_type_field() -> &'static FieldChar {
    &node_base_parts().tag_field
}

impl StructDef {
    fn new_inner(
        name: &str,
        tag: Option<TypeTag>,
        is_abstract: bool,
        parent: Option<&StructDef>,
    ) -> StructDef {
        let def = StructDef {
            inner: Arc::new(StructInner {
                name: name.to_string(),
                tag,
                is_abstract,
                parent: parent.cloned(),
                layout: Arc::new(Layout {
                    name: name.to_string(),
                    base: OnceLock::new(),
                }),
                state: Mutex::new(DefState::default()),
            }),
        };
        if let Some(parent) = parent {
            parent
                .inner
                .state
                .lock()
                .subclasses
                .push(Arc::downgrade(&def.inner));
        }
        def
    }

    /// Starts a plain struct schema (no type tag), optionally extending `parent`.
    pub fn create(name: &str, parent: Option<&StructDef>) -> StructDef {
        Self::new_inner(name, None, false, parent)
    }

    /// Starts a concrete node schema identified by `tag`.
    ///
    /// Without a parent the schema extends [`node_base`], so the tag is the
    /// first field of every record.
    pub fn create_node(name: &str, tag: TypeTag, parent: Option<&StructDef>) -> Result<StructDef> {
        if tag.0 == 0 {
            return Err(NdError::definition(format!(
                "`{name}`: type tag 0 is reserved"
            )));
        }
        let parent = Self::node_parent(name, parent)?;
        Ok(Self::new_inner(name, Some(tag), false, Some(parent)))
    }

    /// Starts an abstract node schema: it can be extended but never instantiated.
    pub fn create_abstract(name: &str, parent: Option<&StructDef>) -> Result<StructDef> {
        let parent = Self::node_parent(name, parent)?;
        Ok(Self::new_inner(name, None, true, Some(parent)))
    }

    fn node_parent<'a>(name: &str, parent: Option<&'a StructDef>) -> Result<&'a StructDef> {
        match parent {
            None => Ok(node_base()),
            Some(parent) if parent.is_assignable_to(node_base()) => Ok(parent),
            Some(parent) => Err(NdError::definition(format!(
                "node schema `{name}` cannot extend plain struct `{}`",
                parent.name()
            ))),
        }
    }

    /// Appends `width` bytes to the schema.
    pub(crate) fn reserve(&self, width: u32) -> Result<FieldSlot> {
        let mut state = self.inner.state.lock();
        if state.sealed {
            return Err(NdError::SchemaFrozen(self.inner.name.clone()));
        }
        let local = state.local_size;
        state.local_size = local
            .checked_add(width)
            .ok_or(NdError::Invalid("schema size overflow"))?;
        state.field_count += 1;
        Ok(FieldSlot {
            layout: Arc::clone(&self.inner.layout),
            local,
        })
    }

    /// Registers destruction/ref-count behaviour for a field declared on this schema.
    pub(crate) fn register_hooks(&self, hooks: Arc<dyn FieldHooks>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.sealed {
            return Err(NdError::SchemaFrozen(self.inner.name.clone()));
        }
        state.hooks.push(hooks);
        Ok(())
    }

    /// Records of this schema become deletable once no ref-counted field points at them.
    pub fn use_standard_ref_counting(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.sealed {
            return Err(NdError::SchemaFrozen(self.inner.name.clone()));
        }
        state.ref_counted = true;
        Ok(())
    }

    /// Installs a destructor that runs before the automatic field destructors.
    pub fn set_destructor(
        &self,
        destructor: impl Fn(&Nd, Address) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.sealed {
            return Err(NdError::SchemaFrozen(self.inner.name.clone()));
        }
        state.destructor = Some(Arc::new(destructor));
        Ok(())
    }

    /// Freezes the schema. Offsets are computed now, or as soon as the parent freezes.
    pub fn done(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.sealed {
                return Err(NdError::SchemaFrozen(self.inner.name.clone()));
            }
            state.sealed = true;
        }
        finalize(&self.inner);
        Ok(())
    }

    /// Returns true once offsets are fixed.
    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().total_size.is_some()
    }

    /// Total record size: parent size plus the size of every field declared here.
    pub fn size(&self) -> Result<u32> {
        self.inner.state.lock().total_size.ok_or_else(|| {
            NdError::definition(format!("schema `{}` used before done()", self.inner.name))
        })
    }

    /// Number of fields declared directly on this schema.
    pub fn field_count(&self) -> usize {
        self.inner.state.lock().field_count
    }

    /// Schema name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Type tag of a concrete node schema.
    pub fn tag(&self) -> Option<TypeTag> {
        self.inner.tag
    }

    /// Returns true for schemas that cannot be instantiated.
    pub fn is_abstract(&self) -> bool {
        self.inner.is_abstract
    }

    /// Parent schema, if any.
    pub fn parent(&self) -> Option<&StructDef> {
        self.inner.parent.as_ref()
    }

    /// Returns true if both handles name the same schema.
    pub fn ptr_eq(&self, other: &StructDef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns true if this schema is `other` or extends it.
    pub fn is_assignable_to(&self, other: &StructDef) -> bool {
        self.ancestry().any(|def| def.ptr_eq(other))
    }

    /// Yields this schema followed by each ancestor.
    fn ancestry(&self) -> impl Iterator<Item = &StructDef> {
        std::iter::successors(Some(self), |def| def.parent())
    }

    /// Returns true if this schema or an ancestor opted into reference counting.
    pub fn is_ref_counted(&self) -> bool {
        self.ancestry().any(|def| def.inner.state.lock().ref_counted)
    }

    /// Returns true if destruction has any work beyond freeing the record.
    pub fn has_destructor(&self) -> bool {
        self.ancestry().any(|def| {
            let state = def.inner.state.lock();
            state.destructor.is_some() || !state.hooks.is_empty()
        })
    }

    /// Returns true if any ref-counted field still points at `record`.
    pub fn has_references(&self, nd: &Nd, record: Address) -> Result<bool> {
        for def in self.ancestry() {
            for hook in def.hooks() {
                if hook.is_ref_counted() && hook.has_references(nd, record)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Runs user destructors (most derived first), then the automatic field destructors.
    pub fn destruct(&self, nd: &Nd, record: Address) -> Result<()> {
        for def in self.ancestry() {
            let destructor = def.inner.state.lock().destructor.clone();
            if let Some(destructor) = destructor {
                destructor(nd, record)?;
            }
        }
        for def in self.ancestry() {
            for hook in def.hooks() {
                hook.destruct(nd, record)?;
            }
        }
        Ok(())
    }

    fn hooks(&self) -> Vec<Arc<dyn FieldHooks>> {
        self.inner.state.lock().hooks.clone()
    }
}

fn finalize(inner: &Arc<StructInner>) {
    let base = match &inner.parent {
        None => 0,
        Some(parent) => match parent.inner.state.lock().total_size {
            Some(size) => size,
            None => return,
        },
    };
    let subclasses: Vec<Arc<StructInner>> = {
        let mut state = inner.state.lock();
        if !state.sealed || state.total_size.is_some() {
            return;
        }
        state.total_size = Some(base + state.local_size);
        let _ = inner.layout.base.set(base);
        state.subclasses.retain(|weak| weak.strong_count() > 0);
        state.subclasses.iter().filter_map(Weak::upgrade).collect()
    };
    for sub in &subclasses {
        finalize(sub);
    }
}

impl fmt::Debug for StructDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructDef")
            .field("name", &self.inner.name)
            .field("tag", &self.inner.tag)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
