use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use super::{ChunkStore, MAX_MALLOC_SIZE, ROOT_SLOTS};
use crate::primitives::bytes::le;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{Address, NdError, Result};

/// Magic bytes at the start of every store file.
pub const FILE_MAGIC: [u8; 4] = *b"PDOM";
/// Length of the file header that precedes the data area.
pub const FILE_HEADER_LEN: usize = 24;

const DATA_START: u64 = (ROOT_SLOTS * 8) as u64;
const BLOCK_HDR_LEN: u64 = 4;
const FREE_BIT: u32 = 1 << 31;
const BLOCK_ALIGN: u32 = 8;

mod header {
    //! Byte offsets of the fixed file header fields.
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const DATA_LEN: usize = 8;
    pub const CRC32: usize = 16;
}

/// Version window accepted when opening a file-backed store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreOptions {
    /// Version stamped on newly created stores.
    pub current_version: u32,
    /// Oldest on-disk version still readable.
    pub min_version: u32,
    /// Newest on-disk version still readable.
    pub max_version: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            current_version: 1,
            min_version: 1,
            max_version: 1,
        }
    }
}

/// Decoded store file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// Format version of the data.
    pub version: u32,
    /// Length of the persisted data area.
    pub data_len: u64,
    /// CRC32 of the persisted data area.
    pub crc32: u32,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[header::MAGIC..header::MAGIC + 4].copy_from_slice(&FILE_MAGIC);
        le::put_u32(&mut buf, header::VERSION, self.version);
        le::put_u64(&mut buf, header::DATA_LEN, self.data_len);
        le::put_u32(&mut buf, header::CRC32, self.crc32);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_LEN || buf[header::MAGIC..header::MAGIC + 4] != FILE_MAGIC {
            return Err(NdError::corrupt("store file magic mismatch"));
        }
        Ok(Self {
            version: le::get_u32(buf, header::VERSION),
            data_len: le::get_u64(buf, header::DATA_LEN),
            crc32: le::get_u32(buf, header::CRC32),
        })
    }
}

/// Allocation counters for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct StoreStats {
    /// Bytes in the data area, including root slots and block headers.
    pub data_len: u64,
    /// Number of live allocations.
    pub live_blocks: u64,
    /// Number of freed blocks awaiting reuse.
    pub free_blocks: u64,
    /// Total `malloc` calls since open.
    pub mallocs: u64,
    /// Total `free` calls since open.
    pub frees: u64,
}

struct Arena {
    data: Vec<u8>,
    free: FxHashMap<u32, Vec<u64>>,
    live: FxHashSet<u64>,
}

impl Arena {
    fn new() -> Self {
        Self {
            data: vec![0u8; DATA_START as usize],
            free: FxHashMap::default(),
            live: FxHashSet::default(),
        }
    }

    /// Rebuilds allocator state by walking every block header.
    fn from_image(data: Vec<u8>) -> Result<Self> {
        if (data.len() as u64) < DATA_START {
            return Err(NdError::corrupt("data area shorter than root slots"));
        }
        let mut arena = Self {
            data,
            free: FxHashMap::default(),
            live: FxHashSet::default(),
        };
        let end = arena.data.len() as u64;
        let mut cursor = DATA_START;
        while cursor < end {
            if cursor + BLOCK_HDR_LEN > end {
                return Err(NdError::corrupt("truncated block header"));
            }
            let raw = le::get_u32(&arena.data, cursor as usize);
            let size = raw & !FREE_BIT;
            if size == 0 || size % BLOCK_ALIGN != 0 || cursor + BLOCK_HDR_LEN + size as u64 > end {
                return Err(NdError::corrupt(format!("malformed block at {cursor}")));
            }
            let payload = cursor + BLOCK_HDR_LEN;
            if raw & FREE_BIT != 0 {
                arena.free.entry(size).or_default().push(payload);
            } else {
                arena.live.insert(payload);
            }
            cursor = payload + size as u64;
        }
        Ok(arena)
    }

    fn span(&self, address: Address, len: usize) -> Result<std::ops::Range<usize>> {
        let start = address.0 as usize;
        let end = start
            .checked_add(len)
            .ok_or(NdError::Invalid("address overflow"))?;
        if address.is_null() || end > self.data.len() {
            return Err(NdError::corrupt(format!(
                "access of {len} bytes at {address} outside data area"
            )));
        }
        Ok(start..end)
    }

    fn block_size(&self, payload: u64) -> u32 {
        le::get_u32(&self.data, (payload - BLOCK_HDR_LEN) as usize) & !FREE_BIT
    }
}

/// In-memory chunk store with optional single-file persistence.
pub struct MemChunkStore {
    arena: RwLock<Arena>,
    file: Option<Box<dyn FileIo>>,
    path: Option<PathBuf>,
    version: u32,
    locked: AtomicBool,
    exclusive: AtomicBool,
    mallocs: AtomicU64,
    frees: AtomicU64,
}

impl MemChunkStore {
    /// Creates an empty store that lives only in memory.
    pub fn in_memory(options: StoreOptions) -> Self {
        Self::from_parts(Arena::new(), None, None, options.current_version)
    }

    /// Opens the store at `path`, creating it when missing.
    ///
    /// A file whose version falls outside `[min_version, max_version]` is
    /// deleted and recreated empty.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let existing_len = std::fs::metadata(path)?.len();
            if existing_len > 0 {
                let (hdr, image) = read_image(path)?;
                if hdr.version < options.min_version || hdr.version > options.max_version {
                    warn!(
                        path = %path.display(),
                        version = hdr.version,
                        min = options.min_version,
                        max = options.max_version,
                        "unsupported store version; recreating"
                    );
                    std::fs::remove_file(path)?;
                    return Self::create(path, options);
                }
                let arena = Arena::from_image(image)?;
                info!(
                    path = %path.display(),
                    version = hdr.version,
                    data_len = hdr.data_len,
                    live = arena.live.len(),
                    "store.open"
                );
                let file = StdFileIo::open(path)?;
                return Ok(Self::from_parts(
                    arena,
                    Some(Box::new(file)),
                    Some(path.to_path_buf()),
                    hdr.version,
                ));
            }
        }
        Self::create(path, options)
    }

    fn create(path: &Path, options: StoreOptions) -> Result<Self> {
        let file = StdFileIo::open(path)?;
        let store = Self::from_parts(
            Arena::new(),
            Some(Box::new(file)),
            Some(path.to_path_buf()),
            options.current_version,
        );
        store.flush()?;
        info!(path = %path.display(), version = options.current_version, "store.create");
        Ok(store)
    }

    fn from_parts(
        arena: Arena,
        file: Option<Box<dyn FileIo>>,
        path: Option<PathBuf>,
        version: u32,
    ) -> Self {
        Self {
            arena: RwLock::new(arena),
            file,
            path,
            version,
            locked: AtomicBool::new(false),
            exclusive: AtomicBool::new(false),
            mallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    /// Reads the header and verifies the checksum of a store file without opening it.
    pub fn inspect(path: impl AsRef<Path>) -> Result<(FileHeader, StoreStats, Vec<Address>)> {
        let (hdr, image) = read_image(path.as_ref())?;
        let arena = Arena::from_image(image)?;
        let roots = (0..ROOT_SLOTS)
            .map(|slot| Address(le::get_u64(&arena.data, slot * 8)))
            .collect();
        let stats = StoreStats {
            data_len: arena.data.len() as u64,
            live_blocks: arena.live.len() as u64,
            free_blocks: arena.free.values().map(|v| v.len() as u64).sum(),
            mallocs: 0,
            frees: 0,
        };
        Ok((hdr, stats, roots))
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true while a database lock is held against this store.
    pub fn is_locked(&self) -> bool {
        self.locked.load(AtomicOrdering::Acquire)
    }

    /// Returns true while the store is in exclusive mode.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(AtomicOrdering::Acquire)
    }

    /// Snapshot of allocator counters.
    pub fn snapshot(&self) -> StoreStats {
        let arena = self.arena.read();
        StoreStats {
            data_len: arena.data.len() as u64,
            live_blocks: arena.live.len() as u64,
            free_blocks: arena.free.values().map(|v| v.len() as u64).sum(),
            mallocs: self.mallocs.load(AtomicOrdering::Relaxed),
            frees: self.frees.load(AtomicOrdering::Relaxed),
        }
    }
}

fn read_image(path: &Path) -> Result<(FileHeader, Vec<u8>)> {
    let file = StdFileIo::open_read_only(path)?;
    let len = file.len()?;
    if len < FILE_HEADER_LEN as u64 {
        return Err(NdError::corrupt("store file shorter than header"));
    }
    let mut hdr_buf = [0u8; FILE_HEADER_LEN];
    file.read_at(0, &mut hdr_buf)?;
    let hdr = FileHeader::decode(&hdr_buf)?;
    if hdr.data_len != len - FILE_HEADER_LEN as u64 {
        return Err(NdError::corrupt(format!(
            "header records {} data bytes, file holds {}",
            hdr.data_len,
            len - FILE_HEADER_LEN as u64
        )));
    }
    let mut image = vec![0u8; hdr.data_len as usize];
    file.read_at(FILE_HEADER_LEN as u64, &mut image)?;
    if crc32fast::hash(&image) != hdr.crc32 {
        return Err(NdError::corrupt("store data checksum mismatch"));
    }
    Ok((hdr, image))
}

fn round_up(size: u32) -> u32 {
    size.div_ceil(BLOCK_ALIGN).max(1) * BLOCK_ALIGN
}

impl ChunkStore for MemChunkStore {
    fn malloc(&self, size: u32) -> Result<Address> {
        if size == 0 || size > MAX_MALLOC_SIZE {
            return Err(NdError::Invalid("malloc size out of range"));
        }
        let rounded = round_up(size);
        let mut arena = self.arena.write();
        let reused = arena.free.get_mut(&rounded).and_then(Vec::pop);
        let payload = match reused {
            Some(payload) => {
                le::put_u32(&mut arena.data, (payload - BLOCK_HDR_LEN) as usize, rounded);
                payload
            }
            None => {
                let block = arena.data.len() as u64;
                let new_len = block as usize + (BLOCK_HDR_LEN as usize) + rounded as usize;
                arena.data.resize(new_len, 0);
                le::put_u32(&mut arena.data, block as usize, rounded);
                block + BLOCK_HDR_LEN
            }
        };
        arena.live.insert(payload);
        self.mallocs.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Address(payload))
    }

    fn free(&self, address: Address) -> Result<()> {
        let mut arena = self.arena.write();
        if !arena.live.remove(&address.0) {
            return Err(NdError::corrupt(format!(
                "free of {address} which is not a live allocation"
            )));
        }
        let size = arena.block_size(address.0);
        let start = address.0 as usize;
        arena.data[start..start + size as usize].fill(0);
        le::put_u32(
            &mut arena.data,
            (address.0 - BLOCK_HDR_LEN) as usize,
            size | FREE_BIT,
        );
        arena.free.entry(size).or_default().push(address.0);
        self.frees.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn is_allocated(&self, address: Address) -> Result<bool> {
        Ok(self.arena.read().live.contains(&address.0))
    }

    fn read(&self, address: Address, dst: &mut [u8]) -> Result<()> {
        let arena = self.arena.read();
        let span = arena.span(address, dst.len())?;
        dst.copy_from_slice(&arena.data[span]);
        Ok(())
    }

    fn write(&self, address: Address, src: &[u8]) -> Result<()> {
        let mut arena = self.arena.write();
        let span = arena.span(address, src.len())?;
        if span.start < DATA_START as usize {
            return Err(NdError::Invalid("record write into root slots"));
        }
        arena.data[span].copy_from_slice(src);
        Ok(())
    }

    fn root(&self, slot: usize) -> Result<Address> {
        if slot >= ROOT_SLOTS {
            return Err(NdError::Invalid("root slot out of range"));
        }
        let arena = self.arena.read();
        Ok(Address(le::get_u64(&arena.data, slot * 8)))
    }

    fn set_root(&self, slot: usize, value: Address) -> Result<()> {
        if slot >= ROOT_SLOTS {
            return Err(NdError::Invalid("root slot out of range"));
        }
        let mut arena = self.arena.write();
        le::put_u64(&mut arena.data, slot * 8, value.0);
        Ok(())
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn set_locked(&self, locked: bool) {
        self.locked.store(locked, AtomicOrdering::Release);
    }

    fn set_exclusive_lock(&self) {
        self.exclusive.store(true, AtomicOrdering::Release);
        self.locked.store(true, AtomicOrdering::Release);
    }

    fn give_up_exclusive_lock(&self, flush: bool) -> Result<()> {
        self.exclusive.store(false, AtomicOrdering::Release);
        if flush {
            self.flush()?;
        }
        Ok(())
    }

    fn stats(&self) -> Option<StoreStats> {
        Some(self.snapshot())
    }

    fn flush(&self) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let arena = self.arena.read();
        let hdr = FileHeader {
            version: self.version,
            data_len: arena.data.len() as u64,
            crc32: crc32fast::hash(&arena.data),
        };
        file.write_at(0, &hdr.encode())?;
        file.write_at(FILE_HEADER_LEN as u64, &arena.data)?;
        file.truncate(FILE_HEADER_LEN as u64 + hdr.data_len)?;
        file.sync_all()?;
        debug!(data_len = hdr.data_len, "store.flush");
        Ok(())
    }
}
