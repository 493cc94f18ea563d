//! Persistent object storage over a chunk store.
//!
//! Schemas lay typed fields out at frozen byte offsets ([`storage::StructDef`]),
//! relationship fields keep forward and back pointers consistent, and a
//! B-tree search index orders records by a string key. An [`Nd`] handle ties
//! it together: it owns the store, the single-writer/many-reader lock, the
//! result cache and the queue of deferred deletions.
//!
//! ```no_run
//! use pdom::{CancelToken, Nd, NdOptions, StructDef, TypeRegistry, TypeTag};
//!
//! # fn main() -> pdom::Result<()> {
//! let point = StructDef::create_node("Point", TypeTag(1), None)?;
//! let x = point.add_int()?;
//! point.done()?;
//! let registry = TypeRegistry::builder().register(&point)?.build();
//!
//! let nd = Nd::open("points.pdom", registry, NdOptions::default())?;
//! let guard = nd.write(&CancelToken::new())?;
//! let p = nd.create_node(TypeTag(1))?;
//! x.put(&nd, p.address(), 3)?;
//! guard.release()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{DeletionKind, Nd, NdOptions, Node, ReadLockGuard, TypeRegistry, WriteLockGuard};
pub use primitives::concurrency::{CancelToken, LockSnapshot};
pub use primitives::store::{ChunkStore, MemChunkStore};
pub use storage::{Ownership, SearchCriteria, StructDef};
pub use types::{Address, NdError, Result, TypeTag};
