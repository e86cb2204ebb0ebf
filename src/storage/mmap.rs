//! # Memory-Mapped Page Store Files
//!
//! `MmapStorage` is the low-level building block behind every partition,
//! mapping, and index file: a file of fixed-size pages mapped into the
//! process address space for zero-copy access.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when the file is grown and
//! remapped. Instead of runtime guards, the borrow checker enforces that
//! no page reference survives a `grow()`:
//!
//! ```text
//! page(&self) -> &[u8]              // immutable borrow of self
//! page_mut(&mut self) -> &mut [u8]  // exclusive borrow of self
//! grow(&mut self)                   // exclusive borrow of self
//! ```
//!
//! ## File Format
//!
//! A store file is a bare concatenation of pages; the file size is always
//! a multiple of `PAGE_SIZE`. What page 0 means is up to the layer above
//! (partition meta, link-map meta, index meta).
//!
//! ## Durability
//!
//! `sync()` issues `msync` on the whole mapping and blocks until the OS
//! confirms the pages hit the file. Checkpointing decides *when* to call
//! it; this type only provides the primitive.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: std::fs::File,
    mmap: MmapMut,
    page_count: u32,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page store '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty page store '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "page store '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = (file_size / PAGE_SIZE as u64) as u32;

        // SAFETY: mapping a file mutably is unsound if another process
        // mutates it concurrently. Store files are owned exclusively by
        // this node, the mapping's lifetime is tied to MmapStorage, and
        // all access is bounds-checked through page()/page_mut().
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page store '{}'", path.display()))?;

        let file_size = initial_page_count as u64 * PAGE_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), file_size))?;

        // SAFETY: see open().
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        let offset = page_no as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        ensure!(
            new_page_count > self.page_count,
            "grow target {} must exceed current page count {}",
            new_page_count,
            self.page_count
        );

        let new_size = new_page_count as u64 * PAGE_SIZE as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to grow page store to {} bytes", new_size))?;

        // SAFETY: the old mapping is dropped before the new one is taken;
        // &mut self guarantees no page reference is alive across the remap.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap grown page store")?
        };
        self.page_count = new_page_count;

        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("msync of page store failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_write_reopen_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part-0.bin");

        {
            let mut storage = MmapStorage::create(&path, 2).unwrap();
            storage.page_mut(1).unwrap()[0..4].copy_from_slice(b"defr");
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 2);
        assert_eq!(&storage.page(1).unwrap()[0..4], b"defr");
    }

    #[test]
    fn grow_extends_with_zeroed_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part-1.bin");

        let mut storage = MmapStorage::create(&path, 1).unwrap();
        storage.grow(3).unwrap();

        assert_eq!(storage.page_count(), 3);
        assert!(storage.page(2).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_bounds_page_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part-2.bin");

        let storage = MmapStorage::create(&path, 1).unwrap();
        assert!(storage.page(1).is_err());
    }
}
