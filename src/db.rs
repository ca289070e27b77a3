//! The public database handle (C10, spec §4.10, §6): bundles file I/O, the
//! page cache, an optional crypto transform, and the schema, and is the
//! entry point for cursors, writers, and transactions.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;

use crate::btree::cursor::Cursor;
use crate::btree::writer;
use crate::btree::PageSource;
use crate::crypto::PageCipher;
use crate::error::{Error, Result};
use crate::options::{CreateOptions, OpenOptions};
use crate::page::cache::PageCache;
use crate::page::header::{Header, KdfParams, HEADER_SIZE};
use crate::page::io::PagedFile;
use crate::record::{encode_record, OwnedValue, Row};
use crate::schema::TableDescriptor;
use crate::transaction::{self, Transaction};

/// A single open database file. Not re-entrant across threads (spec §5
/// "Scheduling"); open one handle per thread that needs one.
pub struct Database {
    path: PathBuf,
    file: RefCell<PagedFile>,
    cache: Rc<RefCell<PageCache>>,
    crypto: Option<PageCipher>,
    schema: RefCell<Option<Vec<TableDescriptor>>>,
}

impl Database {
    /// Opens an existing database file, replaying a crash-left journal
    /// first if one is present (spec §4.7 "Recovery").
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        transaction::recover_if_needed(&path)?;

        let file = PagedFile::open(&path, options.writable)?;
        let header = file.header.clone();

        let crypto = match &options.password {
            Some(password) => {
                let header_bytes = header.to_bytes();
                let kdf = match options.kdf_override {
                    Some(k) => k,
                    None => KdfParams::read_from(&header_bytes)?,
                };
                Some(PageCipher::derive(password, kdf)?)
            }
            None => None,
        };

        let cache_pages = options.page_cache_pages.unwrap_or(2000) as usize;
        info!("opened {} (writable={})", path.display(), options.writable);

        Ok(Self {
            path,
            file: RefCell::new(file),
            cache: Rc::new(RefCell::new(PageCache::new(cache_pages))),
            crypto,
            schema: RefCell::new(None),
        })
    }

    /// Creates a brand new, empty database file with a single empty
    /// `sqlite_schema` leaf as page 1.
    pub fn create(path: impl AsRef<Path>, options: CreateOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let reserved_space = if options.password.is_some() {
            crate::crypto::CRYPTO_OVERHEAD as u8
        } else {
            0
        };
        let mut header = Header::new(options.page_size, reserved_space);

        let crypto = match &options.password {
            Some(password) => {
                let kdf = options.kdf_override.unwrap_or_default();
                let mut bytes = header.to_bytes();
                kdf.write_to(&mut bytes);
                header = Header::parse(&bytes)?;
                Some(PageCipher::derive(password, kdf)?)
            }
            None => None,
        };

        let page_size = header.page_size() as usize;
        let usable = header.usable_page_size() as usize;
        let mut plaintext_page1 = vec![0u8; usable];
        plaintext_page1[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        crate::page::init_empty_table_leaf(&mut plaintext_page1[HEADER_SIZE..]);

        let raw_page1 = match &crypto {
            Some(cipher) => {
                cipher.encrypt_full_page(1, header.file_change_counter(), &plaintext_page1, page_size)?
            }
            None => {
                let mut v = plaintext_page1;
                v.resize(page_size, 0);
                v
            }
        };

        let file = PagedFile::create(&path, header, &raw_page1)?;
        let cache_pages = options.page_cache_pages.unwrap_or(2000) as usize;
        info!("created {} (page_size={page_size})", path.display());

        Ok(Self {
            path,
            file: RefCell::new(file),
            cache: Rc::new(RefCell::new(PageCache::new(cache_pages))),
            crypto,
            schema: RefCell::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn header(&self) -> Header {
        self.file.borrow().header.clone()
    }

    pub(crate) fn set_header(&self, header: Header) {
        self.file.borrow_mut().header = header;
    }

    pub(crate) fn usable_size(&self) -> usize {
        self.header().usable_page_size() as usize
    }

    fn page_size(&self) -> usize {
        self.header().page_size() as usize
    }

    pub(crate) fn file_len_pages(&self) -> Result<u32> {
        self.file.borrow().file_len_pages()
    }

    pub(crate) fn extend_file(&self, page_count: u32) -> Result<()> {
        self.file.borrow_mut().set_len(page_count)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.borrow_mut().sync()
    }

    pub(crate) fn bump_generation(&self) {
        self.cache.borrow_mut().generation += 1;
    }

    /// Reads a page's raw, on-disk bytes (full `page_size`, undecrypted) --
    /// used only for journal pre-image capture, which must restore the
    /// exact bytes that were on disk, not a re-encryption of them.
    pub(crate) fn read_raw_page(&self, page_number: u32) -> Result<Box<[u8]>> {
        self.file.borrow_mut().read_page(page_number)
    }

    /// Reads a page's decrypted, usable-size-trimmed bytes, going through
    /// the cache.
    pub(crate) fn get_page(&self, page_number: u32) -> Result<Rc<[u8]>> {
        let usable = self.usable_size();
        let crypto = &self.crypto;
        let file = &self.file;
        self.cache.borrow_mut().get(page_number, |pn| {
            let raw = file.borrow_mut().read_page(pn)?;
            match crypto {
                Some(cipher) => {
                    let (plain, _counter) = cipher.decrypt_full_page(pn, &raw, usable)?;
                    Ok(plain.into_boxed_slice())
                }
                None => Ok(raw[..usable].to_vec().into_boxed_slice()),
            }
        })
    }

    /// Encrypts (if enabled) and writes one page's plaintext to the file,
    /// then updates the cache with the plaintext so later reads in this
    /// process see it without re-reading and re-decrypting. `counter` is
    /// the nonce counter for every page flushed in one commit: since the
    /// nonce is `(page_number, counter)`, reusing one transaction-wide
    /// counter (the post-bump `file_change_counter`, durable across
    /// reopens) is safe and avoids tracking a per-page counter in memory.
    pub(crate) fn flush_page(&self, page_number: u32, plaintext: &[u8], counter: u32) -> Result<()> {
        let page_size = self.page_size();
        let raw = match &self.crypto {
            Some(cipher) => cipher.encrypt_full_page(page_number, counter, plaintext, page_size)?,
            None => {
                let mut v = plaintext.to_vec();
                v.resize(page_size, 0);
                v
            }
        };
        self.file.borrow_mut().write_page(page_number, &raw)?;
        self.cache
            .borrow_mut()
            .replace(page_number, plaintext.to_vec().into_boxed_slice());
        Ok(())
    }

    pub(crate) fn generation(&self) -> u64 {
        self.cache.borrow().generation
    }

    /// The loaded schema, scanning `sqlite_schema` on first access or after
    /// the schema cookie changes (spec §4.8).
    pub fn schema(&self) -> Result<Vec<TableDescriptor>> {
        if let Some(cached) = self.schema.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let tables = crate::schema::load(self, self.generation())?;
        *self.schema.borrow_mut() = Some(tables.clone());
        Ok(tables)
    }

    fn table_descriptor(&self, table: &str) -> Result<TableDescriptor> {
        self.schema()?
            .into_iter()
            .find(|t| t.name == table)
            .ok_or(Error::NotFound)
    }

    /// Opens a read-only cursor over `table`, positioned before the first
    /// row. `projection` is currently advisory only -- callers can already
    /// read a subset of columns off `Row` directly; a future column-pruning
    /// fast path could use it to skip overflow assembly for dropped
    /// columns, but isn't required for correctness.
    pub fn cursor(&self, table: &str, _projection: Option<&[usize]>) -> Result<Cursor<'_>> {
        let descriptor = self.table_descriptor(table)?;
        Cursor::new(self, descriptor.root_page, true, self.generation())
    }

    /// Begins an explicit, multi-statement transaction (spec §4.10,
    /// §6 `begin`).
    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        let on_disk_counter = {
            let mut header_bytes = [0u8; HEADER_SIZE];
            let mut f = std::fs::File::open(&self.path)?;
            use std::io::Read;
            f.read_exact(&mut header_bytes)?;
            u32::from_be_bytes(header_bytes[24..28].try_into().unwrap())
        };
        if on_disk_counter != self.header().file_change_counter() {
            // Another process committed since we last looked; nothing
            // cached can be trusted (spec §4.2 "file-change-counter
            // re-read... the cache is fully invalidated").
            let file = PagedFile::open(&self.path, true)?;
            let header = file.header.clone();
            *self.file.borrow_mut() = file;
            self.set_header(header);
            self.cache.borrow_mut().invalidate_all();
        }
        Transaction::begin(self)
    }

    /// Convenience single-table writer: begins its own transaction scoped
    /// to `table` and commits or rolls back as a unit (spec §4.10, §6
    /// `writer`). For multi-table or multi-statement transactions, use
    /// `begin()` and `Transaction`'s row-mutation methods directly.
    pub fn writer(&mut self, table: &str) -> Result<Writer<'_>> {
        let descriptor = self.table_descriptor(table)?;
        let tx = self.begin()?;
        Ok(Writer { tx, descriptor })
    }
}

impl PageSource for Database {
    fn get_page(&self, page_number: u32) -> Result<Rc<[u8]>> {
        Database::get_page(self, page_number)
    }

    fn usable_size(&self) -> usize {
        Database::usable_size(self)
    }

    fn generation(&self) -> u64 {
        Database::generation(self)
    }
}

/// A single-table writer (spec §6): `insert`/`update`/`delete` by rowid,
/// committed or rolled back as one transaction.
pub struct Writer<'db> {
    tx: Transaction<'db>,
    descriptor: TableDescriptor,
}

impl<'db> Writer<'db> {
    /// Inserts a new row at `rowid`. `values` must list every column in
    /// schema order; the rowid-alias column (if any) is re-derived from
    /// `rowid` and stored as `NULL` in the record body, per the on-disk
    /// convention this format shares with SQLite.
    pub fn insert(&mut self, rowid: i64, values: &[OwnedValue]) -> Result<()> {
        let payload = encode_row(&self.descriptor, rowid, values);
        writer::insert_table(&mut self.tx, self.descriptor.root_page, rowid, &payload)?;
        if self.descriptor.name == "sqlite_schema" {
            self.tx.mark_schema_touched();
        }
        Ok(())
    }

    /// Replaces the row at `rowid` (delete then insert; simpler than an
    /// in-place patch and no less correct, since both paths journal the
    /// same leaf page exactly once per transaction).
    pub fn update(&mut self, rowid: i64, values: &[OwnedValue]) -> Result<()> {
        writer::delete_table(&mut self.tx, self.descriptor.root_page, rowid)?;
        let payload = encode_row(&self.descriptor, rowid, values);
        writer::insert_table(&mut self.tx, self.descriptor.root_page, rowid, &payload)?;
        Ok(())
    }

    pub fn delete(&mut self, rowid: i64) -> Result<()> {
        writer::delete_table(&mut self.tx, self.descriptor.root_page, rowid)?;
        Ok(())
    }

    /// Reads `rowid`'s current row, for callers building a read-modify-
    /// write `update`.
    pub fn get(&self, rowid: i64, scratch: &mut Vec<u8>) -> Result<Row<'_>> {
        let mut cursor = Cursor::new(&self.tx, self.descriptor.root_page, true, self.tx.generation())?;
        if !cursor.seek_rowid(rowid)? {
            return Err(Error::NotFound);
        }
        cursor.current(scratch)
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()
    }
}

fn encode_row(descriptor: &TableDescriptor, rowid: i64, values: &[OwnedValue]) -> Vec<u8> {
    let rowid_alias = descriptor.rowid_alias();
    let stored: Vec<OwnedValue> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if Some(i) == rowid_alias {
                OwnedValue::Null
            } else {
                v.clone()
            }
        })
        .collect();
    let _ = rowid;
    encode_record(&stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page::{BTreePageHeader, BTreePageType};
    use crate::btree::writer::{self, PageStore};

    /// Allocates one empty leaf-table page and records it in
    /// `sqlite_schema`, within `tx`.
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

    #[test]
    fn writer_insert_update_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("writer.db");

        let mut db = Database::create(&path, CreateOptions::new()).unwrap();
        {
            let mut tx = db.begin().unwrap();
            bootstrap_table(
                &mut tx,
                "people",
                "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)",
            )
            .unwrap();
            tx.commit().unwrap();
        }

        {
            let mut writer = db.writer("people").unwrap();
            writer
                .insert(1, &[OwnedValue::Integer(1), OwnedValue::Text("Ann".into()), OwnedValue::Integer(30)])
                .unwrap();
            writer
                .insert(2, &[OwnedValue::Integer(2), OwnedValue::Text("Bo".into()), OwnedValue::Integer(40)])
                .unwrap();
            writer.commit().unwrap();
        }

        {
            let mut writer = db.writer("people").unwrap();
            writer
                .update(1, &[OwnedValue::Integer(1), OwnedValue::Text("Annette".into()), OwnedValue::Integer(31)])
                .unwrap();
            writer.delete(2).unwrap();
            writer.commit().unwrap();
        }

        let mut scratch = Vec::new();
        let mut cursor = db.cursor("people", None).unwrap();
        cursor.first().unwrap();
        let row = cursor.current(&mut scratch).unwrap();
        assert_eq!(row.rowid(), Some(1));
        assert_eq!(row.read_text(1), Some("Annette"));
        assert_eq!(row.read_int(2), Some(31));
        cursor.next().unwrap();
        assert!(!cursor.valid(), "row 2 was deleted");
    }

    #[test]
    fn schema_cache_invalidates_after_new_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema_cache.db");

        let mut db = Database::create(&path, CreateOptions::new()).unwrap();
        assert!(db.schema().unwrap().is_empty());

        {
            let mut tx = db.begin().unwrap();
            bootstrap_table(&mut tx, "t", "CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
            tx.commit().unwrap();
        }

        let tables = db.schema().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "t");
    }
}
