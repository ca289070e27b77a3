//! Shared fixture helpers for the integration tests.
//!
//! `pagevault` has no DDL: a `CREATE TABLE` statement is only ever
//! *read* by the schema loader, never executed. Building a table from
//! these tests therefore means doing directly what a DDL layer sitting
//! above this engine would do -- allocate a root page and insert the
//! describing row into `sqlite_schema` ourselves, using the same
//! low-level `btree::writer`/`record` functions the engine's own
//! higher-level `Writer` is built on.

use pagevault::btree::page::{BTreePageHeader, BTreePageType};
use pagevault::btree::writer::{self, PageStore};
use pagevault::record::{encode_record, OwnedValue};
use pagevault::{Database, Result, Transaction};

/// Allocates a fresh, empty leaf-table page and records it in
/// `sqlite_schema` as `name`, within `tx`. Returns the new root page.
pub fn bootstrap_table(
    tx: &mut Transaction,
    schema_rowid: i64,
    name: &str,
    create_sql: &str,
) -> Result<u32> {
    let usable = tx.usable_size();
    let root_page = tx.allocate()?;
    let mut body = vec![0u8; usable];
    BTreePageHeader::empty(BTreePageType::LeafTable, usable as u32).write_into(&mut body);
    tx.write(root_page, body.into_boxed_slice())?;

    let schema_row = encode_record(&[
        OwnedValue::Text("table".to_string()),
        OwnedValue::Text(name.to_string()),
        OwnedValue::Text(name.to_string()),
        OwnedValue::Integer(root_page as i64),
        OwnedValue::Text(create_sql.to_string()),
    ]);
    writer::insert_table(tx, 1, schema_rowid, &schema_row)?;
    tx.mark_schema_touched();
    Ok(root_page)
}

/// Inserts one `users`-shaped row `(id, name, email)` directly at the
/// B-tree layer, storing `NULL` for the rowid-alias column the way the
/// high-level `Writer` does.
pub fn insert_user_row(
    tx: &mut Transaction,
    root_page: u32,
    id: i64,
    name: &str,
    email: &str,
) -> Result<()> {
    let payload = encode_record(&[
        OwnedValue::Null,
        OwnedValue::Text(name.to_string()),
        OwnedValue::Text(email.to_string()),
    ]);
    writer::insert_table(tx, root_page, id, &payload)?;
    Ok(())
}

/// Creates a fresh database at `path` with one table,
/// `users(id INTEGER PRIMARY KEY, name TEXT, email TEXT)`, committed
/// empty (no rows). Returns the opened, writable handle and the new
/// table's root page.
pub fn create_users_db(path: &std::path::Path) -> Result<(Database, u32)> {
    let mut db = Database::create(path, pagevault::CreateOptions::new())?;
    let root_page = {
        let mut tx = db.begin()?;
        let root = bootstrap_table(
            &mut tx,
            1,
            "users",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)",
        )?;
        tx.commit()?;
        root
    };
    Ok((db, root_page))
}
