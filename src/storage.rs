//! Block storage backends
//!
//! The target consumes storage through the [`BlockStore`] capability: random
//! access byte I/O over a fixed-size region with a fixed 512-byte virtual
//! block size. Implement it to plug in a custom backend; [`FileBlockStore`]
//! (a raw backing file, no header) is what the shipped binary uses and
//! [`MemBlockStore`] backs the test suite.

use crate::error::{IscsiError, ScsiResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The virtual block size reported to initiators, in bytes
pub const VIRTUAL_BLOCK_SIZE: u32 = 512;

/// Result of [`BlockStore::check_bounds`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsCheck {
    /// No boundaries are violated
    Ok,
    /// The logical block address lies outside the medium
    LbaOutOfRange,
    /// The transfer extends past the end of the medium
    LengthOutOfRange,
}

/// Random-access block storage capability.
///
/// Offsets and lengths in `read`/`write` are bytes; `check_bounds` works in
/// blocks, matching the units carried in CDBs. Implementations must allow
/// concurrent reads; writes are serialized by the implementation's own
/// discipline.
pub trait BlockStore: Send + Sync {
    /// Fill `dst` with data starting at byte `offset`
    fn read(&self, dst: &mut [u8], offset: u64) -> ScsiResult<()>;

    /// Write `src` at byte `offset`
    fn write(&self, src: &[u8], offset: u64) -> ScsiResult<()>;

    /// Flush pending writes to stable storage
    fn flush(&self) -> ScsiResult<()> {
        Ok(())
    }

    /// Total size of the medium in bytes
    fn size_in_bytes(&self) -> u64;

    /// Virtual block size in bytes (fixed at 512)
    fn block_size(&self) -> u32 {
        VIRTUAL_BLOCK_SIZE
    }

    /// Size of the medium in whole blocks (rounded down)
    fn size_in_blocks(&self) -> u64 {
        self.size_in_bytes() / self.block_size() as u64
    }

    /// Check whether a transfer of `len_blocks` blocks starting at `lba`
    /// stays inside the medium. Must be called before every read or write
    /// sequence so boundary violations are answered with sense data instead
    /// of an I/O error.
    fn check_bounds(&self, lba: u64, len_blocks: u32) -> BoundsCheck {
        let size = self.size_in_blocks();
        if lba >= size {
            return BoundsCheck::LbaOutOfRange;
        }
        if lba + len_blocks as u64 > size {
            return BoundsCheck::LengthOutOfRange;
        }
        BoundsCheck::Ok
    }
}

/// File-backed block store over a raw image file.
///
/// The file length defines the medium size; there is no header. Reads and
/// writes share one seekable handle guarded by a mutex, which also provides
/// the write serialization the [`BlockStore`] contract asks for.
pub struct FileBlockStore {
    file: Mutex<File>,
    path: PathBuf,
    size_in_bytes: u64,
}

impl FileBlockStore {
    /// Open an existing image file for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> ScsiResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size_in_bytes = file.metadata()?.len();
        Ok(FileBlockStore {
            file: Mutex::new(file),
            path,
            size_in_bytes,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    fn read(&self, dst: &mut [u8], offset: u64) -> ScsiResult<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| IscsiError::Scsi("storage lock poisoned".to_string()))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)?;
        Ok(())
    }

    fn write(&self, src: &[u8], offset: u64) -> ScsiResult<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| IscsiError::Scsi("storage lock poisoned".to_string()))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(src)?;
        Ok(())
    }

    fn flush(&self) -> ScsiResult<()> {
        let file = self
            .file
            .lock()
            .map_err(|_| IscsiError::Scsi("storage lock poisoned".to_string()))?;
        file.sync_data()?;
        Ok(())
    }

    fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }
}

/// In-memory block store, used by tests and embedders
pub struct MemBlockStore {
    data: Mutex<Vec<u8>>,
}

impl MemBlockStore {
    /// Create a zero-filled store of the given byte size
    pub fn new(size_in_bytes: usize) -> Self {
        MemBlockStore {
            data: Mutex::new(vec![0u8; size_in_bytes]),
        }
    }
}

impl BlockStore for MemBlockStore {
    fn read(&self, dst: &mut [u8], offset: u64) -> ScsiResult<()> {
        let data = self
            .data
            .lock()
            .map_err(|_| IscsiError::Scsi("storage lock poisoned".to_string()))?;
        let start = offset as usize;
        let end = start + dst.len();
        if end > data.len() {
            return Err(IscsiError::Scsi(format!(
                "read past end of medium: {} + {} > {}",
                start,
                dst.len(),
                data.len()
            )));
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, src: &[u8], offset: u64) -> ScsiResult<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| IscsiError::Scsi("storage lock poisoned".to_string()))?;
        let start = offset as usize;
        let end = start + src.len();
        if end > data.len() {
            return Err(IscsiError::Scsi(format!(
                "write past end of medium: {} + {} > {}",
                start,
                src.len(),
                data.len()
            )));
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn size_in_bytes(&self) -> u64 {
        self.data.lock().map(|d| d.len() as u64).unwrap_or(0)
    }
}

/// Render a byte count in the `N bytes (XGiB YMiB ...)` form used by the
/// startup banner, noting trailing bytes that do not fill a whole block.
pub fn human_friendly_size(size_in_bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut out = format!("{size_in_bytes} bytes (");

    if size_in_bytes == 0 {
        out.push_str("nothing)");
        return out;
    }

    let mut values = [0u64; UNITS.len()];
    let mut size = size_in_bytes;
    for v in values.iter_mut().take(UNITS.len() - 1) {
        *v = size % 1024;
        size /= 1024;
    }
    values[UNITS.len() - 1] = size;

    let mut first = true;
    for i in (0..UNITS.len()).rev() {
        if values[i] > 0 {
            if !first {
                out.push(' ');
            }
            out.push_str(&format!("{}{}", values[i], UNITS[i]));
            first = false;
        }
    }
    out.push(')');

    let unused = size_in_bytes % VIRTUAL_BLOCK_SIZE as u64;
    if unused == 1 {
        out.push_str(", 1 byte is not used");
    } else if unused > 1 {
        out.push_str(&format!(", {unused} bytes are not used"));
    }
    out
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_store_roundtrip() {
        let store = MemBlockStore::new(4096);
        store.write(&[0xAA; 512], 512).unwrap();

        let mut buf = [0u8; 512];
        store.read(&mut buf, 512).unwrap();
        assert_eq!(buf, [0xAA; 512]);

        store.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [0u8; 512]);
    }

    #[test]
    fn test_mem_store_out_of_range() {
        let store = MemBlockStore::new(1024);
        let mut buf = [0u8; 512];
        assert!(store.read(&mut buf, 1024).is_err());
        assert!(store.write(&buf, 513).is_err());
    }

    #[test]
    fn test_check_bounds() {
        let store = MemBlockStore::new(2048 * 512); // 2048 blocks
        assert_eq!(store.check_bounds(0, 1), BoundsCheck::Ok);
        assert_eq!(store.check_bounds(2047, 1), BoundsCheck::Ok);
        assert_eq!(store.check_bounds(0, 2048), BoundsCheck::Ok);
        assert_eq!(store.check_bounds(2048, 1), BoundsCheck::LbaOutOfRange);
        assert_eq!(store.check_bounds(9999, 1), BoundsCheck::LbaOutOfRange);
        assert_eq!(store.check_bounds(2047, 2), BoundsCheck::LengthOutOfRange);
        assert_eq!(store.check_bounds(1, 2048), BoundsCheck::LengthOutOfRange);
    }

    #[test]
    fn test_size_in_blocks_rounds_down() {
        let store = MemBlockStore::new(1024 + 100);
        assert_eq!(store.size_in_blocks(), 2);
    }

    #[test]
    fn test_file_store() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1024 * 1024).unwrap();

        let store = FileBlockStore::open(tmp.path()).unwrap();
        assert_eq!(store.size_in_bytes(), 1024 * 1024);
        assert_eq!(store.size_in_blocks(), 2048);
        assert_eq!(store.block_size(), 512);

        let pattern: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        store.write(&pattern, 512 * 7).unwrap();
        store.flush().unwrap();

        let mut buf = vec![0u8; 512];
        store.read(&mut buf, 512 * 7).unwrap();
        assert_eq!(buf, pattern);
    }

    #[test]
    fn test_human_friendly_size() {
        assert_eq!(human_friendly_size(0), "0 bytes (nothing)");
        assert_eq!(human_friendly_size(1024), "1024 bytes (1KiB)");
        assert_eq!(
            human_friendly_size(1024 * 1024 + 1024),
            "1049600 bytes (1MiB 1KiB)"
        );
        assert_eq!(human_friendly_size(513), "513 bytes (513B), 1 byte is not used");
    }
}
