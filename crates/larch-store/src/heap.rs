//! Heap file: a single file of fixed-size page slots.
//!
//! Slot 0 holds the header; slots are handed out monotonically and never
//! reclaimed. All header integers are native-endian, matching the raw-copy
//! data model of the rest of the file.

use bytes::{Buf, BufMut};
use larch_common::page::PageId;
use larch_common::{LarchError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number identifying a heap store file.
const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

/// Header layout: magic (4) | page_size (8) | file_size_pages (4).
const HEADER_LEN: usize = 16;

/// A heap store backed by a single file.
///
/// Allocation extends the file by one page slot and rewrites the header;
/// reads and writes transfer exactly one page at its slot offset. Open-file
/// state is guarded by one mutex, so callers may share a `HeapFile` freely.
pub struct HeapFile {
    path: PathBuf,
    page_size: usize,
    inner: Mutex<HeapFileInner>,
}

struct HeapFileInner {
    file: File,
    /// Allocated pages including the header page. Always at least 1.
    file_size_pages: u32,
}

impl HeapFile {
    /// Opens a heap file, creating it when `create` is set and the file does
    /// not exist yet.
    ///
    /// On open of an existing file the header is read back and its recorded
    /// page size wins over the `page_size` argument; a magic mismatch is a
    /// format error.
    pub fn open(path: impl AsRef<Path>, create: bool, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if create && !path.exists() {
            return Self::create(path, page_size);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let (page_size, file_size_pages) = read_header(&mut file)?;
        tracing::debug!(
            path = %path.display(),
            page_size,
            pages = file_size_pages,
            "opened heap file"
        );

        Ok(Self {
            path,
            page_size,
            inner: Mutex::new(HeapFileInner {
                file,
                file_size_pages,
            }),
        })
    }

    fn create(path: PathBuf, page_size: usize) -> Result<Self> {
        if page_size < HEADER_LEN {
            return Err(LarchError::InvalidConfig(format!(
                "page size {page_size} smaller than header"
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(page_size as u64)?;
        write_header(&mut file, page_size, 1)?;
        tracing::debug!(path = %path.display(), page_size, "created heap file");

        Ok(Self {
            path,
            page_size,
            inner: Mutex::new(HeapFileInner {
                file,
                file_size_pages: 1,
            }),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of allocated pages, including the header page.
    pub fn page_count(&self) -> u32 {
        self.inner.lock().file_size_pages
    }

    /// Allocates a new page slot and returns its id.
    ///
    /// The file is extended to cover the new slot and the header is rewritten
    /// before the id is handed out.
    pub fn new_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let pid = PageId(inner.file_size_pages);
        let new_len = (inner.file_size_pages as u64 + 1) * self.page_size as u64;
        inner.file.set_len(new_len)?;
        inner.file_size_pages += 1;

        let pages = inner.file_size_pages;
        write_header(&mut inner.file, self.page_size, pages)?;

        Ok(pid)
    }

    /// Reads the page at `pid` into `buf`. `buf` must be one page long.
    pub fn read_page(&self, pid: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut inner = self.inner.lock();
        check_bounds(pid, inner.file_size_pages)?;

        inner.file.seek(SeekFrom::Start(pid.offset(self.page_size)))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes `buf` to the page at `pid`. `buf` must be one page long.
    pub fn write_page(&self, pid: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut inner = self.inner.lock();
        check_bounds(pid, inner.file_size_pages)?;

        inner.file.seek(SeekFrom::Start(pid.offset(self.page_size)))?;
        inner.file.write_all(buf)?;
        Ok(())
    }

    /// Forces everything written so far down to the device.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

fn check_bounds(pid: PageId, pages: u32) -> Result<()> {
    if !pid.is_valid() {
        return Err(LarchError::InvalidPageId(pid));
    }
    if pid.0 >= pages {
        return Err(LarchError::PageOutOfBounds { pid, pages });
    }
    Ok(())
}

fn write_header(file: &mut File, page_size: usize, file_size_pages: u32) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    {
        let mut cur = &mut buf[..];
        cur.put_u32_ne(HEAP_MAGIC);
        cur.put_u64_ne(page_size as u64);
        cur.put_u32_ne(file_size_pages);
    }
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<(usize, u32)> {
    let mut buf = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;

    let mut cur = &buf[..];
    let magic = cur.get_u32_ne();
    if magic != HEAP_MAGIC {
        return Err(LarchError::BadMagic {
            what: "heap file",
            expected: HEAP_MAGIC,
            found: magic,
        });
    }
    let page_size = cur.get_u64_ne() as usize;
    let file_size_pages = cur.get_u32_ne();
    Ok((page_size, file_size_pages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 512;

    fn heap_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("test.heap")
    }

    #[test]
    fn test_create_fresh_file() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();

        assert_eq!(heap.page_size(), PAGE_SIZE);
        assert_eq!(heap.page_count(), 1);
        assert_eq!(
            std::fs::metadata(heap.path()).unwrap().len(),
            PAGE_SIZE as u64
        );
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempdir().unwrap();
        let result = HeapFile::open(heap_path(&dir), false, PAGE_SIZE);
        assert!(matches!(result, Err(LarchError::Io(_))));
    }

    #[test]
    fn test_new_page_ids_monotonic() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();

        assert_eq!(heap.new_page().unwrap(), PageId(1));
        assert_eq!(heap.new_page().unwrap(), PageId(2));
        assert_eq!(heap.new_page().unwrap(), PageId(3));
        assert_eq!(heap.page_count(), 4);
    }

    #[test]
    fn test_new_page_extends_file() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();

        let pid = heap.new_page().unwrap();
        let len = std::fs::metadata(heap.path()).unwrap().len();
        // The new slot must be fully covered by the file.
        assert_eq!(len, (pid.0 as u64 + 1) * PAGE_SIZE as u64);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();

        let pid = heap.new_page().unwrap();
        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xEF;
        heap.write_page(pid, &data).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        heap.read_page(pid, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_invalid_page_id_rejected() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();
        heap.new_page().unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            heap.read_page(PageId::INVALID, &mut buf),
            Err(LarchError::InvalidPageId(_))
        ));
        assert!(matches!(
            heap.write_page(PageId::INVALID, &buf),
            Err(LarchError::InvalidPageId(_))
        ));
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();
        heap.new_page().unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            heap.read_page(PageId(9), &mut buf),
            Err(LarchError::PageOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_reopen_reads_header() {
        let dir = tempdir().unwrap();
        let path = heap_path(&dir);

        {
            let heap = HeapFile::open(&path, true, PAGE_SIZE).unwrap();
            heap.new_page().unwrap();
            heap.new_page().unwrap();
            heap.sync().unwrap();
        }

        // Page size argument is ignored for an existing file: the header wins.
        let heap = HeapFile::open(&path, false, 8192).unwrap();
        assert_eq!(heap.page_size(), PAGE_SIZE);
        assert_eq!(heap.page_count(), 3);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = heap_path(&dir);
        let pid;

        {
            let heap = HeapFile::open(&path, true, PAGE_SIZE).unwrap();
            pid = heap.new_page().unwrap();
            let data = vec![0x5Au8; PAGE_SIZE];
            heap.write_page(pid, &data).unwrap();
            heap.sync().unwrap();
        }

        let heap = HeapFile::open(&path, true, PAGE_SIZE).unwrap();
        let mut out = vec![0u8; PAGE_SIZE];
        heap.read_page(pid, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = heap_path(&dir);
        std::fs::write(&path, vec![0u8; PAGE_SIZE]).unwrap();

        let result = HeapFile::open(&path, true, PAGE_SIZE);
        assert!(matches!(result, Err(LarchError::BadMagic { .. })));
    }

    #[test]
    fn test_fresh_slot_reads_zeroed() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(heap_path(&dir), true, PAGE_SIZE).unwrap();

        let pid = heap.new_page().unwrap();
        let mut buf = vec![0xFFu8; PAGE_SIZE];
        heap.read_page(pid, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
