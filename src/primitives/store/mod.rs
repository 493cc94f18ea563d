#![forbid(unsafe_code)]
//! Chunk store: byte/word/pointer access at arbitrary offsets plus malloc/free.
//!
//! [`ChunkStore`] is the seam between the schema layer and whatever owns the
//! bytes. [`MemChunkStore`] keeps the whole data area in memory and persists
//! it to a single file when the exclusive lock is given up with `flush`.

mod mem;

pub use mem::{FileHeader, MemChunkStore, StoreOptions, StoreStats, FILE_HEADER_LEN, FILE_MAGIC};

use crate::types::{Address, NdError, Result};

/// Number of root pointer words reserved at the start of the data area.
pub const ROOT_SLOTS: usize = 16;

/// Width in bytes of a record pointer.
pub const PTR_SIZE: u32 = 8;

/// Largest single allocation the store hands out.
pub const MAX_MALLOC_SIZE: u32 = 1 << 24;

/// Byte-addressed storage with an allocator and the locking hooks the
/// database handle drives.
pub trait ChunkStore: Send + Sync + 'static {
    /// Allocates a zero-filled block of at least `size` bytes.
    fn malloc(&self, size: u32) -> Result<Address>;
    /// Releases a block previously returned by [`ChunkStore::malloc`].
    fn free(&self, address: Address) -> Result<()>;
    /// Returns true if `address` is the start of a live allocation.
    fn is_allocated(&self, address: Address) -> Result<bool>;

    /// Reads `dst.len()` bytes at `address`.
    fn read(&self, address: Address, dst: &mut [u8]) -> Result<()>;
    /// Writes `src` at `address`.
    fn write(&self, address: Address, src: &[u8]) -> Result<()>;

    /// Reads a byte.
    fn get_byte(&self, address: Address) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(address, &mut buf)?;
        Ok(buf[0])
    }
    /// Writes a byte.
    fn put_byte(&self, address: Address, value: u8) -> Result<()> {
        self.write(address, &[value])
    }
    /// Reads a UTF-16 code unit.
    fn get_char(&self, address: Address) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }
    /// Writes a UTF-16 code unit.
    fn put_char(&self, address: Address, value: u16) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
    /// Reads a signed 16-bit value.
    fn get_short(&self, address: Address) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read(address, &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }
    /// Writes a signed 16-bit value.
    fn put_short(&self, address: Address, value: i16) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
    /// Reads a signed 32-bit value.
    fn get_int(&self, address: Address) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
    /// Writes a signed 32-bit value.
    fn put_int(&self, address: Address, value: i32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
    /// Reads a signed 64-bit value.
    fn get_long(&self, address: Address) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }
    /// Writes a signed 64-bit value.
    fn put_long(&self, address: Address, value: i64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
    /// Reads a 32-bit float.
    fn get_float(&self, address: Address) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
    /// Writes a 32-bit float.
    fn put_float(&self, address: Address, value: f32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
    /// Reads a 64-bit float.
    fn get_double(&self, address: Address) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
    /// Writes a 64-bit float.
    fn put_double(&self, address: Address, value: f64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }
    /// Reads a record pointer.
    fn get_rec_ptr(&self, address: Address) -> Result<Address> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(Address(u64::from_le_bytes(buf)))
    }
    /// Writes a record pointer.
    fn put_rec_ptr(&self, address: Address, value: Address) -> Result<()> {
        self.write(address, &value.0.to_le_bytes())
    }

    /// Allocates a length-prefixed UTF-8 block holding `chars`.
    fn new_string(&self, chars: &str) -> Result<Address> {
        let len = u32::try_from(chars.len()).map_err(|_| NdError::Invalid("string too long"))?;
        let block = self.malloc(4 + len)?;
        self.write(block, &len.to_le_bytes())?;
        self.write(block.offset(4), chars.as_bytes())?;
        Ok(block)
    }
    /// Decodes the string block at `address`.
    fn get_string(&self, address: Address) -> Result<String> {
        let mut len = [0u8; 4];
        self.read(address, &mut len)?;
        let len = u32::from_le_bytes(len);
        if len > MAX_MALLOC_SIZE {
            return Err(NdError::corrupt(format!(
                "string block at {address} claims {len} bytes"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        self.read(address.offset(4), &mut bytes)?;
        String::from_utf8(bytes).map_err(|_| {
            NdError::corrupt(format!("string block at {address} is not UTF-8"))
        })
    }
    /// Releases a string block.
    fn delete_string(&self, address: Address) -> Result<()> {
        self.free(address)
    }

    /// Reads root pointer `slot` from the data-area header.
    fn root(&self, slot: usize) -> Result<Address>;
    /// Writes root pointer `slot` in the data-area header.
    fn set_root(&self, slot: usize, value: Address) -> Result<()>;

    /// On-disk format version of the data.
    fn version(&self) -> u32;

    /// Marks whether any database lock (read or write) is currently held.
    fn set_locked(&self, locked: bool);
    /// Enters exclusive (write) mode.
    fn set_exclusive_lock(&self);
    /// Leaves exclusive mode, persisting the data when `flush` is set.
    fn give_up_exclusive_lock(&self, flush: bool) -> Result<()>;
    /// Persists the data if the store is file-backed.
    fn flush(&self) -> Result<()>;

    /// Allocator counters, when the store keeps them.
    fn stats(&self) -> Option<StoreStats> {
        None
    }
}
