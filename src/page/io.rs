//! Paged file I/O (spec §4.1): validates the header, serves whole-page reads
//! and writes, and holds the process-local advisory file lock.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use fs2::FileExt;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::page::header::{Header, HEADER_SIZE};

pub struct PagedFile {
    file: File,
    writable: bool,
    locked: bool,
    pub(crate) header: Header,
}

impl PagedFile {
    pub fn open(path: &std::path::Path, writable: bool) -> Result<Self> {
        let file = FsOpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;

        let locked = Self::try_lock(&file, writable)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        let mut reader = &file;
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut header_bytes)?;
        let header = Header::parse(&header_bytes)?;

        debug!(
            "opened database, page_size={}, database_size={}",
            header.page_size(),
            header.database_size()
        );

        Ok(Self {
            file,
            writable,
            locked,
            header,
        })
    }

    /// Creates a new database file with `raw_page1` (already at the full
    /// on-disk `page_size`, encrypted if the caller wants encryption) as its
    /// first page. The caller builds `raw_page1` so this layer doesn't need
    /// to know about the crypto transform (spec §4.9).
    pub fn create(path: &std::path::Path, header: Header, raw_page1: &[u8]) -> Result<Self> {
        let mut file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let locked = Self::try_lock(&file, true)?;

        debug_assert_eq!(raw_page1.len(), header.page_size() as usize);
        file.write_all(raw_page1)?;
        file.flush()?;
        file.sync_all()?;

        Ok(Self {
            file,
            writable: true,
            locked,
            header,
        })
    }

    fn try_lock(file: &File, writable: bool) -> Result<bool> {
        let result = if writable {
            file.try_lock_exclusive()
        } else {
            file.try_lock_shared()
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("database is locked by another process");
                Err(Error::Busy)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Reads page `page_number` (1-based) at its full on-disk page size,
    /// including any reserved bytes.
    pub fn read_page(&mut self, page_number: u32) -> Result<Box<[u8]>> {
        let page_size = self.header.page_size() as u64;
        let mut buf = vec![0u8; page_size as usize].into_boxed_slice();
        self.file
            .seek(SeekFrom::Start((page_number as u64 - 1) * page_size))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&mut self, page_number: u32, data: &[u8]) -> Result<()> {
        let page_size = self.header.page_size() as u64;
        debug_assert_eq!(data.len() as u64, page_size);
        self.file
            .seek(SeekFrom::Start((page_number as u64 - 1) * page_size))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn set_len(&mut self, page_count: u32) -> Result<()> {
        let page_size = self.header.page_size() as u64;
        self.file.set_len(page_count as u64 * page_size)?;
        Ok(())
    }

    pub fn file_len_pages(&self) -> Result<u32> {
        let len = self.file.metadata()?.len();
        Ok((len / self.header.page_size() as u64) as u32)
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}
