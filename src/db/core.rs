use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, trace, warn};

use crate::primitives::concurrency::{CancelToken, LockSnapshot, NdLock, Transition};
use crate::primitives::store::{ChunkStore, MemChunkStore, StoreStats};
use crate::storage::{node_type_field, StructDef};
use crate::types::{Address, NdError, Result, TypeTag};

use super::cache::{ResultCache, ResultKey};
use super::pending::{DeletionKind, PendingDeletions};
use super::{NdOptions, Node, TypeRegistry};

struct NdInner {
    store: Box<dyn ChunkStore>,
    registry: TypeRegistry,
    lock: NdLock,
    pending: Mutex<PendingDeletions>,
    cache: ResultCache,
    options: NdOptions,
}

/// Handle on one store: lock protocol, node registry, result cache and
/// deferred deletions. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Nd {
    inner: Arc<NdInner>,
}

impl Nd {
    /// Opens (or creates) a file-backed store at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        registry: TypeRegistry,
        options: NdOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let store = MemChunkStore::open(path, options.store_options())?;
        debug!(path = %path.display(), version = store.version(), "nd.open");
        Ok(Self::with_store(Box::new(store), registry, options))
    }

    /// Creates a handle over a fresh in-memory store.
    pub fn in_memory(registry: TypeRegistry, options: NdOptions) -> Result<Self> {
        let store = MemChunkStore::in_memory(options.store_options());
        Ok(Self::with_store(Box::new(store), registry, options))
    }

    /// Creates a handle over any chunk store.
    pub fn with_store(
        store: Box<dyn ChunkStore>,
        registry: TypeRegistry,
        options: NdOptions,
    ) -> Self {
        Self {
            inner: Arc::new(NdInner {
                lock: NdLock::new(options.poll_interval(), options.debug_locks),
                cache: ResultCache::new(options.result_cache_capacity),
                pending: Mutex::new(PendingDeletions::default()),
                store,
                registry,
                options,
            }),
        }
    }

    /// The underlying chunk store.
    pub fn store(&self) -> &dyn ChunkStore {
        self.inner.store.as_ref()
    }

    /// Node schemas known to this handle.
    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    /// Options the handle was opened with.
    pub fn options(&self) -> &NdOptions {
        &self.inner.options
    }

    /// On-disk format version.
    pub fn version(&self) -> u32 {
        self.store().version()
    }

    /// Allocator counters, if the store keeps them.
    pub fn store_stats(&self) -> Option<StoreStats> {
        self.store().stats()
    }

    /// Returns true if both handles share state.
    pub fn ptr_eq(&self, other: &Nd) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- lock protocol ----

    /// Blocks while a writer holds the lock, then takes a read lock.
    pub fn acquire_read_lock(&self) {
        if self.inner.lock.acquire_read() == Transition::BecameLocked {
            self.store().set_locked(true);
        }
    }

    /// Drops one read lock and the result cache.
    pub fn release_read_lock(&self) {
        self.clear_result_cache();
        if self.inner.lock.release_read() == Transition::BecameIdle {
            self.store().set_locked(false);
        }
    }

    /// Takes the write lock, first giving up `give_up_read_locks` read locks
    /// held by the caller. On cancellation those read locks are restored and
    /// [`NdError::OperationCancelled`] is returned.
    pub fn acquire_write_lock(&self, give_up_read_locks: u32, cancel: &CancelToken) -> Result<()> {
        self.inner.lock.acquire_write(give_up_read_locks, cancel)?;
        self.store().set_locked(true);
        self.store().set_exclusive_lock();
        Ok(())
    }

    /// Drains pending deletions, leaves exclusive mode and releases the write
    /// lock, keeping `establish_read_locks` read locks for the caller.
    ///
    /// The lock is released even when draining or flushing fails; the first
    /// such error is returned afterwards. A destructor panic is resumed once
    /// the lock has been released.
    pub fn release_write_lock(&self, establish_read_locks: u32, flush: bool) -> Result<()> {
        let drained = panic::catch_unwind(AssertUnwindSafe(|| self.process_deletions()));
        let flushed = self.unlock_write(establish_read_locks, flush);
        let drained = match drained {
            Ok(drained) => drained,
            Err(payload) => panic::resume_unwind(payload),
        };
        drained?;
        flushed
    }

    /// Leaves exclusive mode and releases the write lock without draining.
    fn unlock_write(&self, establish_read_locks: u32, flush: bool) -> Result<()> {
        let flushed = self
            .store()
            .give_up_exclusive_lock(flush || self.inner.options.flush_on_write_release);
        self.clear_result_cache();
        if self.inner.lock.release_write(establish_read_locks) == Transition::BecameIdle {
            self.store().set_locked(false);
        }
        flushed
    }

    /// Takes a read lock released when the guard drops.
    pub fn read(&self) -> ReadLockGuard<'_> {
        self.acquire_read_lock();
        ReadLockGuard { nd: self }
    }

    /// Takes the write lock, released (and drained) when the guard drops.
    pub fn write(&self, cancel: &CancelToken) -> Result<WriteLockGuard<'_>> {
        self.acquire_write_lock(0, cancel)?;
        Ok(WriteLockGuard::new(self))
    }

    /// Current lock counters.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.inner.lock.snapshot()
    }

    pub(crate) fn check_read(&self) {
        if self.inner.options.debug_locks {
            assert!(self.inner.lock.is_locked(), "read without a database lock");
        }
    }

    pub(crate) fn check_write(&self) {
        if self.inner.options.debug_locks {
            assert!(
                self.inner.lock.is_write_locked(),
                "write without the database write lock"
            );
        }
    }

    // ---- records ----

    /// Allocates a zeroed record of `def`'s size; node schemas get their tag written first.
    pub fn create(&self, def: &StructDef) -> Result<Address> {
        self.check_write();
        if def.is_abstract() {
            return Err(NdError::definition(format!(
                "cannot instantiate abstract schema `{}`",
                def.name()
            )));
        }
        let address = self.store().malloc(def.size()?.max(1))?;
        if let Some(tag) = def.tag() {
            node_type_field().put(self, address, tag.0)?;
        }
        trace!(%address, def = def.name(), "nd.create");
        Ok(address)
    }

    /// Allocates a node of the schema registered under `tag`.
    pub fn create_node(&self, tag: TypeTag) -> Result<Node> {
        let def = self
            .registry()
            .get(tag)
            .ok_or_else(|| NdError::definition(format!("no schema registered for tag {tag}")))?
            .clone();
        let address = self.create(&def)?;
        Ok(Node::new(self.clone(), address, def))
    }

    /// Type tag stored at the start of the node record at `address`.
    pub fn tag_of(&self, address: Address) -> Result<TypeTag> {
        node_type_field().get(self, address).map(TypeTag)
    }

    /// Loads the node at `address`; `None` if the address is null or not a live record.
    pub fn load(&self, address: Address) -> Result<Option<Node>> {
        self.check_read();
        if address.is_null() || !self.store().is_allocated(address)? {
            return Ok(None);
        }
        let tag = self.tag_of(address)?;
        self.registry().construct(self, address, tag).map(Some)
    }

    /// Like [`Nd::load`], failing with [`NdError::TypeMismatch`] unless the
    /// node's schema is assignable to `expected`.
    pub fn load_typed(&self, address: Address, expected: &StructDef) -> Result<Option<Node>> {
        let Some(node) = self.load(address)? else {
            return Ok(None);
        };
        if !node.is_a(expected) {
            return Err(NdError::TypeMismatch {
                address,
                expected: expected.name().to_string(),
                found: node.def().name().to_string(),
            });
        }
        Ok(Some(node))
    }

    /// Returns true if the node at `address` is assignable to the schema registered under `tag`.
    pub fn is_instance_of(&self, address: Address, tag: TypeTag) -> Result<bool> {
        let Some(required) = self.registry().get(tag) else {
            return Ok(false);
        };
        let found = self.registry().resolve(self.tag_of(address)?)?;
        Ok(found.is_assignable_to(required))
    }

    /// Destructs and frees the node at `address`.
    pub fn delete(&self, address: Address) -> Result<()> {
        let def = self.registry().resolve(self.tag_of(address)?)?.clone();
        self.delete_record(&def, address)
    }

    /// Destructs the record at `address` as a `def` and frees it.
    pub fn delete_record(&self, def: &StructDef, address: Address) -> Result<()> {
        self.check_write();
        def.destruct(self, address)?;
        self.inner.pending.lock().remove(address);
        self.store().free(address)?;
        trace!(%address, def = def.name(), "nd.delete");
        Ok(())
    }

    /// Queues `address` for deletion when the write lock is released.
    pub fn schedule_deletion(&self, address: Address, kind: DeletionKind) {
        self.check_write();
        if address.is_null() {
            return;
        }
        trace!(%address, ?kind, "nd.schedule_deletion");
        self.inner.pending.lock().schedule(address, kind);
    }

    /// Queues `address` if it is a ref-counted node with no references left.
    pub fn schedule_if_unreferenced(&self, address: Address) -> Result<()> {
        self.check_write();
        if address.is_null() || !self.store().is_allocated(address)? {
            return Ok(());
        }
        let Some(def) = self.registry().get(self.tag_of(address)?) else {
            return Ok(());
        };
        if def.is_ref_counted() && !def.has_references(self, address)? {
            self.schedule_deletion(address, DeletionKind::Unreferenced);
        }
        Ok(())
    }

    /// Number of addresses awaiting deletion.
    pub fn pending_deletions(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Deletes every queued record, including those queued by the deletions
    /// themselves. Each address is freed at most once. Unreferenced entries
    /// that regained a reference are skipped.
    ///
    /// An entry whose deletion fails or panics stays queued, so the next
    /// drain retries it.
    pub fn process_deletions(&self) -> Result<usize> {
        let mut freed = FxHashSet::default();
        let mut skipped = 0usize;
        loop {
            let next = self.inner.pending.lock().pop();
            let Some((address, kind)) = next else {
                break;
            };
            let mut entry = Requeue {
                nd: self,
                entry: Some((address, kind)),
            };
            if freed.contains(&address) || !self.store().is_allocated(address)? {
                entry.done();
                continue;
            }
            let def = self.registry().resolve(self.tag_of(address)?)?.clone();
            if kind == DeletionKind::Unreferenced
                && (!def.is_ref_counted() || def.has_references(self, address)?)
            {
                entry.done();
                skipped += 1;
                continue;
            }
            self.delete_record(&def, address)?;
            entry.done();
            freed.insert(address);
        }
        if !freed.is_empty() || skipped > 0 {
            debug!(freed = freed.len(), skipped, "nd.process_deletions");
            self.clear_result_cache();
        }
        Ok(freed.len())
    }

    // ---- roots ----

    /// Reads root pointer `slot`.
    pub fn root(&self, slot: usize) -> Result<Address> {
        self.store().root(slot)
    }

    /// Writes root pointer `slot`.
    pub fn set_root(&self, slot: usize, address: Address) -> Result<()> {
        self.check_write();
        self.store().set_root(slot, address)
    }

    // ---- result cache ----

    /// Cached result under `key`, if present with type `T`.
    pub fn cached_result<T: Any + Send + Sync>(&self, key: &ResultKey) -> Option<Arc<T>> {
        self.inner.cache.get(key)
    }

    /// Caches `value` under `key` until the next lock release.
    pub fn cache_result<T: Any + Send + Sync>(&self, key: ResultKey, value: Arc<T>) {
        self.inner.cache.put(key, value);
    }

    /// Drops every cached result.
    pub fn clear_result_cache(&self) {
        self.inner.cache.clear();
    }

    /// Number of cached results.
    pub fn cached_results(&self) -> usize {
        self.inner.cache.len()
    }

    /// `(hits, misses)` of the result cache.
    pub fn cache_counters(&self) -> (u64, u64) {
        self.inner.cache.counters()
    }

    /// Drains pending deletions, drops caches and persists the store. Fails if
    /// a lock is still held.
    pub fn close(self) -> Result<()> {
        if self.inner.lock.is_locked() {
            return Err(NdError::Invalid("close while a database lock is held"));
        }
        let pending = self.pending_deletions();
        if pending > 0 {
            debug!(pending, "nd.close draining deletions");
            self.acquire_write_lock(0, &CancelToken::new())?;
            if let Err(err) = self.release_write_lock(0, false) {
                warn!(%err, left = self.pending_deletions(), "nd.close drain failed");
                return Err(err);
            }
        }
        self.clear_result_cache();
        self.store().flush()?;
        info!(version = self.version(), "nd.close");
        Ok(())
    }
}

/// Puts a popped deletion back in the queue unless it completed.
struct Requeue<'a> {
    nd: &'a Nd,
    entry: Option<(Address, DeletionKind)>,
}

impl Requeue<'_> {
    fn done(&mut self) {
        self.entry = None;
    }
}

impl Drop for Requeue<'_> {
    fn drop(&mut self) {
        if let Some((address, kind)) = self.entry.take() {
            self.nd.inner.pending.lock().schedule(address, kind);
        }
    }
}

impl fmt::Debug for Nd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nd")
            .field("version", &self.version())
            .field("types", &self.inner.registry.len())
            .field("lock", &self.lock_snapshot())
            .finish()
    }
}

/// Scoped read lock.
#[must_use = "the read lock is released when the guard is dropped"]
pub struct ReadLockGuard<'a> {
    nd: &'a Nd,
}

impl<'a> ReadLockGuard<'a> {
    /// Trades this read lock for the write lock. On failure the read lock is
    /// kept and handed back with the error.
    pub fn upgrade(
        self,
        cancel: &CancelToken,
    ) -> std::result::Result<WriteLockGuard<'a>, (ReadLockGuard<'a>, NdError)> {
        let nd = self.nd;
        match nd.acquire_write_lock(1, cancel) {
            Ok(()) => {
                std::mem::forget(self);
                Ok(WriteLockGuard::new(nd))
            }
            Err(err) => Err((self, err)),
        }
    }
}

impl Drop for ReadLockGuard<'_> {
    fn drop(&mut self) {
        self.nd.release_read_lock();
    }
}

/// Scoped write lock. Dropping it drains pending deletions and releases the lock.
#[must_use = "the write lock is released when the guard is dropped"]
pub struct WriteLockGuard<'a> {
    nd: &'a Nd,
    flush: bool,
    released: bool,
}

impl<'a> WriteLockGuard<'a> {
    fn new(nd: &'a Nd) -> Self {
        Self {
            nd,
            flush: false,
            released: false,
        }
    }

    /// Persists the store on release.
    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush;
    }

    /// Releases the write lock, reporting drain or flush failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.nd.release_write_lock(0, self.flush)
    }

    /// Converts the write lock into a read lock with no writer admitted in between.
    pub fn downgrade(mut self) -> Result<ReadLockGuard<'a>> {
        self.released = true;
        let read = ReadLockGuard { nd: self.nd };
        self.nd.release_write_lock(1, self.flush).map(|()| read)
    }
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if std::thread::panicking() {
            // Destructors are not run while unwinding; the queue drains on
            // the next write release.
            if let Err(err) = self.nd.unlock_write(0, self.flush) {
                error!(%err, "nd.write_guard release during unwind failed");
            }
            return;
        }
        if let Err(err) = self.nd.release_write_lock(0, self.flush) {
            error!(%err, "nd.write_guard release failed");
        }
    }
}
