//! Database handle: locks, node registry, result cache and deferred deletion.

mod cache;
mod config;
mod core;
mod node;
mod pending;
mod registry;


pub use cache::ResultKey;
pub use config::NdOptions;
pub use core::{Nd, ReadLockGuard, WriteLockGuard};
pub use node::Node;
pub use pending::DeletionKind;
pub use registry::{TypeRegistry, TypeRegistryBuilder};
