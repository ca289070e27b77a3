//! Rollback journal and transactions (C7, spec §4.7): pre-image capture on
//! first write, commit/rollback, crash recovery, and single-level
//! savepoints.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};

use crate::btree::PageSource;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::btree::writer::PageStore;
use crate::page::freelist::{self, FreelistStore};

const JOURNAL_MAGIC: u64 = 0xd9d505f920a163d7;
const JOURNAL_HEADER_SIZE: usize = 28;

fn journal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("-journal");
    db_path.with_file_name(name)
}

/// Appends pre-image records for an in-progress transaction and can replay
/// them back, both for `rollback()`/`rollback_to()` within the same
/// process and for crash recovery on the next `open()`.
struct JournalWriter {
    file: File,
    path: PathBuf,
    page_size: u32,
    record_count: u32,
}

impl JournalWriter {
    fn create(path: PathBuf, page_size: u32, initial_pages: u32, nonce: u32) -> Result<Self> {
        let mut file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        header[0..8].copy_from_slice(&JOURNAL_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&0u32.to_be_bytes());
        header[12..16].copy_from_slice(&nonce.to_be_bytes());
        header[16..20].copy_from_slice(&initial_pages.to_be_bytes());
        header[20..24].copy_from_slice(&page_size.to_be_bytes());
        header[24..28].copy_from_slice(&page_size.to_be_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(Self {
            file,
            path,
            page_size,
            record_count: 0,
        })
    }

    fn record_size(&self) -> u64 {
        4 + self.page_size as u64 + 4
    }

    /// Appends one `{page_number, page_image, checksum}` record, then
    /// updates the header's record count -- in that order, so a crash
    /// between the two leaves the count describing only complete records
    /// (spec §4.7, "the journal replay on recovery is idempotent").
    fn append_record(&mut self, page_number: u32, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), self.page_size as usize);
        let checksum = crc32fast::hash(image);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&page_number.to_be_bytes())?;
        self.file.write_all(image)?;
        self.file.write_all(&checksum.to_be_bytes())?;
        self.file.sync_all()?;

        self.record_count += 1;
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&self.record_count.to_be_bytes())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Reads back records `[start_index, record_count)`, in append order.
    fn read_records_from(&mut self, start_index: u32) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut out = Vec::new();
        for index in start_index..self.record_count {
            let offset = JOURNAL_HEADER_SIZE as u64 + index as u64 * self.record_size();
            self.file.seek(SeekFrom::Start(offset))?;
            let mut page_number_bytes = [0u8; 4];
            self.file.read_exact(&mut page_number_bytes)?;
            let mut image = vec![0u8; self.page_size as usize];
            self.file.read_exact(&mut image)?;
            out.push((u32::from_be_bytes(page_number_bytes), image));
        }
        Ok(out)
    }

    /// Deletes the journal file -- the atomic commit point (spec §4.7).
    fn remove(self) -> Result<()> {
        let path = self.path;
        drop(self.file);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

/// Replays a crash-left journal (if any) against `db_path`, then deletes
/// it. Called on `open()`/`create()` before anything else touches the
/// file (spec §4.7 "Recovery").
pub(crate) fn recover_if_needed(db_path: &Path) -> Result<()> {
    let journal = journal_path(db_path);
    if !journal.exists() {
        return Ok(());
    }

    let mut file = FsOpenOptions::new().read(true).write(true).open(&journal)?;
    let mut header = [0u8; JOURNAL_HEADER_SIZE];
    if file.read_exact(&mut header).is_err() {
        warn!("stale journal at {} is too short to be valid, discarding", journal.display());
        drop(file);
        std::fs::remove_file(&journal)?;
        return Ok(());
    }

    let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
    if magic != JOURNAL_MAGIC {
        warn!("stale journal at {} has a bad magic, discarding", journal.display());
        drop(file);
        std::fs::remove_file(&journal)?;
        return Ok(());
    }

    let record_count = u32::from_be_bytes(header[8..12].try_into().unwrap());
    let initial_pages = u32::from_be_bytes(header[16..20].try_into().unwrap());
    let page_size = u32::from_be_bytes(header[24..28].try_into().unwrap());
    let record_size = 4u64 + page_size as u64 + 4;

    debug!("replaying journal at {}: {record_count} record(s)", journal.display());

    let mut db_file = FsOpenOptions::new().read(true).write(true).open(db_path)?;
    let mut applied = 0u32;
    for index in 0..record_count {
        let offset = JOURNAL_HEADER_SIZE as u64 + index as u64 * record_size;
        if file.seek(SeekFrom::Start(offset)).is_err() {
            break;
        }
        let mut page_number_bytes = [0u8; 4];
        let mut image = vec![0u8; page_size as usize];
        let mut checksum_bytes = [0u8; 4];
        if file.read_exact(&mut page_number_bytes).is_err()
            || file.read_exact(&mut image).is_err()
            || file.read_exact(&mut checksum_bytes).is_err()
        {
            // Partial final record (crash mid-append) -- stop here, not an
            // error: everything applied so far is a valid prefix.
            break;
        }
        if crc32fast::hash(&image) != u32::from_be_bytes(checksum_bytes) {
            warn!("journal record {index} fails checksum, stopping replay");
            break;
        }
        let page_number = u32::from_be_bytes(page_number_bytes);
        db_file.seek(SeekFrom::Start((page_number as u64 - 1) * page_size as u64))?;
        db_file.write_all(&image)?;
        applied += 1;
    }

    db_file.set_len(initial_pages as u64 * page_size as u64)?;
    db_file.sync_all()?;
    debug!("journal recovery applied {applied} record(s), database restored to {initial_pages} page(s)");

    drop(file);
    std::fs::remove_file(&journal)?;
    Ok(())
}

struct SavepointMark {
    journal_offset: u32,
    database_size: u32,
    freelist_head: u32,
    freelist_count: u32,
}

/// The single active writer (spec §5 "exactly one writer across the
/// process"): owns an in-memory dirty-page overlay, journals each page's
/// pre-image on first touch, and flushes everything to the file only on
/// `commit()`.
pub struct Transaction<'db> {
    db: &'db mut Database,
    dirty: HashMap<u32, Box<[u8]>>,
    journaled: HashSet<u32>,
    journal: Option<JournalWriter>,
    initial_database_size: u32,
    database_size: u32,
    freelist_head: u32,
    freelist_count: u32,
    schema_touched: bool,
    savepoint: Option<SavepointMark>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(db: &'db mut Database) -> Result<Self> {
        let header = db.header();
        let journal = JournalWriter::create(
            journal_path(db.path()),
            header.page_size(),
            header.database_size(),
            header.file_change_counter(),
        )?;

        Ok(Self {
            initial_database_size: header.database_size(),
            database_size: header.database_size(),
            freelist_head: header.freelist_head(),
            freelist_count: header.freelist_count(),
            journal: Some(journal),
            dirty: HashMap::new(),
            journaled: HashSet::new(),
            schema_touched: false,
            savepoint: None,
            db,
        })
    }

    /// Marks the `sqlite_schema` table as touched so `commit()` bumps the
    /// schema cookie (spec §9 "Schema cookie").
    pub fn mark_schema_touched(&mut self) {
        self.schema_touched = true;
    }

    fn ensure_journaled(&mut self, page_number: u32) -> Result<()> {
        if self.journaled.contains(&page_number) {
            return Ok(());
        }
        self.journaled.insert(page_number);
        if page_number > self.initial_database_size {
            // Brand new page this transaction allocated by growing the
            // file -- nothing existed here before, nothing to capture.
            return Ok(());
        }
        let pre_image = self.db.read_raw_page(page_number)?;
        if let Some(journal) = self.journal.as_mut() {
            journal.append_record(page_number, &pre_image)?;
        }
        Ok(())
    }

    /// Commits: patches the header into page 1, flushes every dirty page,
    /// syncs, then deletes the journal -- the atomic commit point (spec
    /// §4.7).
    pub fn commit(mut self) -> Result<()> {
        let mut header = self.db.header();
        header.set_database_size(self.database_size);
        header.set_freelist_head(self.freelist_head);
        header.set_freelist_count(self.freelist_count);
        header.bump_file_change_counter();
        if self.schema_touched {
            header.bump_schema_cookie();
        }
        let counter = header.file_change_counter();

        let mut page1 = match self.dirty.remove(&1) {
            Some(p) => p,
            None => self.db.get_page(1)?.to_vec().into_boxed_slice(),
        };
        page1[0..crate::page::header::HEADER_SIZE].copy_from_slice(&header.to_bytes());
        self.dirty.insert(1, page1);

        if self.database_size > self.db.file_len_pages()? {
            self.db.extend_file(self.database_size)?;
        }

        for (page_number, data) in self.dirty.drain() {
            self.db.flush_page(page_number, &data, counter)?;
        }
        self.db.set_header(header);
        self.db.sync()?;

        if let Some(journal) = self.journal.take() {
            journal.remove()?;
        }
        self.db.bump_generation();
        Ok(())
    }

    /// Flushes dirty pages to the file but leaves the journal in place --
    /// used only to test crash recovery (spec §8 S5): a real crash between
    /// the flush and the journal truncation leaves exactly this state.
    #[cfg(test)]
    pub(crate) fn flush_without_committing_for_test(&mut self) -> Result<u32> {
        let mut header = self.db.header();
        header.set_database_size(self.database_size);
        header.set_freelist_head(self.freelist_head);
        header.set_freelist_count(self.freelist_count);
        header.bump_file_change_counter();
        let counter = header.file_change_counter();

        let mut page1 = match self.dirty.remove(&1) {
            Some(p) => p,
            None => self.db.get_page(1)?.to_vec().into_boxed_slice(),
        };
        page1[0..crate::page::header::HEADER_SIZE].copy_from_slice(&header.to_bytes());
        self.dirty.insert(1, page1);

        if self.database_size > self.db.file_len_pages()? {
            self.db.extend_file(self.database_size)?;
        }
        for (page_number, data) in self.dirty.drain() {
            self.db.flush_page(page_number, &data, counter)?;
        }
        self.db.sync()?;
        Ok(self.initial_database_size)
    }

    /// Discards every uncommitted mutation. Since dirty pages live only in
    /// this transaction's overlay until `commit()`, nothing on disk needs
    /// undoing in the common case; the journal (if created) is simply
    /// deleted. (A journal left behind by a *prior* crashed process is
    /// handled separately by `recover_if_needed` on the next `open()`.)
    pub fn rollback(mut self) -> Result<()> {
        if let Some(journal) = self.journal.take() {
            journal.remove()?;
        }
        self.dirty.clear();
        Ok(())
    }

    /// Records a single-level savepoint (spec §4.7 "Savepoints"). Only one
    /// level is supported; a nested `begin_nested` replaces the mark.
    pub fn begin_nested(&mut self) -> Result<()> {
        let journal_offset = self.journal.as_ref().map(|j| j.record_count).unwrap_or(0);
        self.savepoint = Some(SavepointMark {
            journal_offset,
            database_size: self.database_size,
            freelist_head: self.freelist_head,
            freelist_count: self.freelist_count,
        });
        // Pages touched again after this point need a fresh pre-image
        // relative to *here*, not to the start of the whole transaction.
        self.journaled.clear();
        Ok(())
    }

    /// Undoes every mutation made since the last `begin_nested()`, without
    /// truncating the journal (spec §4.7).
    pub fn rollback_to(&mut self) -> Result<()> {
        let mark = self.savepoint.take().ok_or_else(|| {
            Error::TransactionAborted("rollback_to with no active savepoint".into())
        })?;
        if let Some(journal) = self.journal.as_mut() {
            for (page_number, image) in journal.read_records_from(mark.journal_offset)? {
                self.dirty.insert(page_number, image.into_boxed_slice());
            }
        }
        self.database_size = mark.database_size;
        self.freelist_head = mark.freelist_head;
        self.freelist_count = mark.freelist_count;
        self.journaled.clear();
        Ok(())
    }
}

impl<'db> PageSource for Transaction<'db> {
    fn get_page(&self, page_number: u32) -> Result<Rc<[u8]>> {
        if let Some(data) = self.dirty.get(&page_number) {
            return Ok(Rc::from(data.as_ref()));
        }
        self.db.get_page(page_number)
    }

    fn usable_size(&self) -> usize {
        self.db.usable_size()
    }

    fn generation(&self) -> u64 {
        self.db.generation()
    }
}

impl<'db> PageStore for Transaction<'db> {
    fn read(&mut self, page_number: u32) -> Result<Rc<[u8]>> {
        PageSource::get_page(self, page_number)
    }

    fn write(&mut self, page_number: u32, data: Box<[u8]>) -> Result<()> {
        self.ensure_journaled(page_number)?;
        self.dirty.insert(page_number, data);
        Ok(())
    }

    fn allocate(&mut self) -> Result<u32> {
        if let Some((page, new_head, new_count)) =
            freelist::pop_page(self, self.freelist_head, self.freelist_count)?
        {
            self.freelist_head = new_head;
            self.freelist_count = new_count;
            Ok(page)
        } else {
            self.database_size += 1;
            let page_number = self.database_size;
            let usable = self.db.usable_size();
            self.dirty.insert(page_number, vec![0u8; usable].into_boxed_slice());
            Ok(page_number)
        }
    }

    fn free(&mut self, page_number: u32) -> Result<()> {
        let (new_head, new_count) =
            freelist::push_page(self, page_number, self.freelist_head, self.freelist_count)?;
        self.freelist_head = new_head;
        self.freelist_count = new_count;
        Ok(())
    }

    fn usable_size(&self) -> usize {
        self.db.usable_size()
    }
}

impl<'db> FreelistStore for Transaction<'db> {
    fn read_raw(&mut self, page: u32) -> Result<Box<[u8]>> {
        Ok(PageStore::read(self, page)?.to_vec().into_boxed_slice())
    }

    fn write_raw(&mut self, page: u32, data: &[u8]) -> Result<()> {
        PageStore::write(self, page, data.to_vec().into_boxed_slice())
    }

    fn usable_size(&self) -> usize {
        PageStore::usable_size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::{BTreePageHeader, BTreePageType};
    use crate::btree::writer;
    use crate::record::{encode_record, OwnedValue, Row};
    use crate::options::{CreateOptions, OpenOptions};

    /// Allocates one empty leaf-table page and registers it in
    /// `sqlite_schema` as `name`, all within `tx`.
    fn bootstrap_table(tx: &mut Transaction, name: &str, sql: &str) -> Result<u32> {
        let usable = tx.usable_size();
        let root_page = tx.allocate()?;
        let mut body = vec![0u8; usable];
        BTreePageHeader::empty(BTreePageType::LeafTable, usable as u32).write_into(&mut body);
        tx.write(root_page, body.into_boxed_slice())?;

        let row = encode_record(&[
            OwnedValue::Text("table".into()),
            OwnedValue::Text(name.into()),
            OwnedValue::Text(name.into()),
            OwnedValue::Integer(root_page as i64),
            OwnedValue::Text(sql.into()),
        ]);
        writer::insert_table(tx, 1, 1, &row)?;
        tx.mark_schema_touched();
        Ok(root_page)
    }

    /// S5 -- crash recovery: a transaction flushes its dirty pages but
    /// the journal is never truncated (simulating a crash between the
    /// two), so the next `open()` must replay it and end up exactly at
    /// the pre-begin state.
    #[test]
    fn crash_recovery_restores_pre_transaction_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.db");

        let mut db = Database::create(&path, CreateOptions::new()).unwrap();
        let root_page = {
            let mut tx = db.begin().unwrap();
            let root = bootstrap_table(
                &mut tx,
                "users",
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)",
            )
            .unwrap();
            tx.commit().unwrap();
            root
        };

        {
            let mut tx = db.begin().unwrap();
            let payload = encode_record(&[
                OwnedValue::Null,
                OwnedValue::Text("X".into()),
                OwnedValue::Text("x@x".into()),
            ]);
            writer::insert_table(&mut tx, root_page, 7, &payload).unwrap();
            // Flush to disk but leave the journal in place -- the state a
            // real crash between "flush" and "truncate journal" leaves.
            // Dropping `tx` here without commit()/rollback() never touches
            // the journal, matching a process that crashed right after.
            tx.flush_without_committing_for_test().unwrap();
        }

        assert!(journal_path(&path).exists());

        let reopened = Database::open(&path, OpenOptions::new().writable(true)).unwrap();
        assert!(!journal_path(&path).exists(), "recovery should delete the journal");

        let mut cursor = reopened.cursor("users", None).unwrap();
        let found = cursor.seek_rowid(7).unwrap();
        assert!(!found, "the crashed insert must not be visible after recovery");

        cursor.first().unwrap();
        assert!(!cursor.valid(), "pre-transaction state had no rows");
    }

    #[test]
    fn commit_then_rollback_of_next_transaction_is_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit_rollback.db");

        let mut db = Database::create(&path, CreateOptions::new()).unwrap();
        let root_page = {
            let mut tx = db.begin().unwrap();
            let root = bootstrap_table(
                &mut tx,
                "t",
                "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)",
            )
            .unwrap();
            let payload = encode_record(&[OwnedValue::Null, OwnedValue::Text("one".into())]);
            writer::insert_table(&mut tx, root, 1, &payload).unwrap();
            tx.commit().unwrap();
            root
        };

        {
            let mut tx = db.begin().unwrap();
            let payload = encode_record(&[OwnedValue::Null, OwnedValue::Text("two".into())]);
            writer::insert_table(&mut tx, root_page, 2, &payload).unwrap();
            tx.rollback().unwrap();
        }

        let mut cursor = db.cursor("t", None).unwrap();
        cursor.first().unwrap();
        let mut scratch = Vec::new();
        let mut rows: Vec<i64> = Vec::new();
        while cursor.valid() {
            let row: Row = cursor.current(&mut scratch).unwrap();
            rows.push(row.rowid().unwrap());
            cursor.next().unwrap();
        }
        assert_eq!(rows, vec![1]);
    }
}
