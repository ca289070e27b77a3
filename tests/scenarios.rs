//! End-to-end scenarios, built against databases created in-process
//! with `Database::create` -- no prebuilt fixture files.

mod common;

use common::{bootstrap_table, create_users_db, insert_user_row};
use pagevault::record::Value;
use pagevault::{CreateOptions, Database, Error, OpenOptions};

fn value_text<'a>(v: &'a Value<'a>) -> &'a str {
    match v {
        Value::Text(s) => s,
        other => panic!("expected text, got {other:?}"),
    }
}

/// S1 -- open and point lookup.
#[test]
fn point_lookup_finds_row_by_rowid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.db");

    let (mut db, root_page) = create_users_db(&path).unwrap();
    {
        let mut tx = db.begin().unwrap();
        insert_user_row(&mut tx, root_page, 1, "Alice", "a@x").unwrap();
        insert_user_row(&mut tx, root_page, 2, "Bob", "b@x").unwrap();
        insert_user_row(&mut tx, root_page, 42, "Carol", "c@x").unwrap();
        tx.commit().unwrap();
    }

    let mut cursor = db.cursor("users", Some(&[1, 2])).unwrap();
    let found = cursor.seek_rowid(42).unwrap();
    assert!(found);
    let mut scratch = Vec::new();
    let row = cursor.current(&mut scratch).unwrap();
    assert_eq!(value_text(&row.value(1)), "Carol");
    assert_eq!(value_text(&row.value(2)), "c@x");
}

/// S2 -- range scan.
#[test]
fn range_scan_yields_rows_in_ascending_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.db");

    let (mut db, root_page) = create_users_db(&path).unwrap();
    {
        let mut tx = db.begin().unwrap();
        insert_user_row(&mut tx, root_page, 1, "Alice", "a@x").unwrap();
        insert_user_row(&mut tx, root_page, 2, "Bob", "b@x").unwrap();
        insert_user_row(&mut tx, root_page, 42, "Carol", "c@x").unwrap();
        tx.commit().unwrap();
    }

    let mut cursor = db.cursor("users", None).unwrap();
    assert!(cursor.seek_rowid(2).unwrap());

    let mut scratch = Vec::new();
    let row = cursor.current(&mut scratch).unwrap();
    assert_eq!(row.rowid(), Some(2));
    assert_eq!(value_text(&row.value(1)), "Bob");

    cursor.next().unwrap();
    assert!(cursor.valid());
    let row = cursor.current(&mut scratch).unwrap();
    assert_eq!(row.rowid(), Some(42));
    assert_eq!(value_text(&row.value(1)), "Carol");

    cursor.next().unwrap();
    assert!(!cursor.valid());
}

/// S3 -- split. 100 rows with a 500-byte text payload each into a
/// 4096-byte-page table force at least one leaf split.
#[test]
fn bulk_insert_forces_split_and_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s3.db");

    let mut db = Database::create(&path, CreateOptions::new().page_size(4096)).unwrap();
    let root_page = {
        let mut tx = db.begin().unwrap();
        let root = bootstrap_table(
            &mut tx,
            1,
            "items",
            "CREATE TABLE items (id INTEGER PRIMARY KEY, payload TEXT)",
        )
        .unwrap();
        tx.commit().unwrap();
        root
    };

    {
        let mut tx = db.begin().unwrap();
        let payload_text = "x".repeat(500);
        for i in 1..=100i64 {
            let payload = pagevault::record::encode_record(&[
                pagevault::record::OwnedValue::Null,
                pagevault::record::OwnedValue::Text(payload_text.clone()),
            ]);
            pagevault::btree::writer::insert_table(&mut tx, root_page, i, &payload).unwrap();
        }
        tx.commit().unwrap();
    }

    let mut cursor = db.cursor("items", None).unwrap();
    cursor.first().unwrap();
    let mut scratch = Vec::new();
    let mut seen = Vec::new();
    while cursor.valid() {
        let row = cursor.current(&mut scratch).unwrap();
        seen.push(row.rowid().unwrap());
        cursor.next().unwrap();
    }
    assert_eq!(seen.len(), 100);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.first(), Some(&1));
    assert_eq!(seen.last(), Some(&100));
}

/// S4 -- rollback.
#[test]
fn rollback_discards_uncommitted_insert() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s4.db");

    let (mut db, root_page) = create_users_db(&path).unwrap();
    {
        let mut tx = db.begin().unwrap();
        insert_user_row(&mut tx, root_page, 1, "Alice", "a@x").unwrap();
        tx.commit().unwrap();
    }

    {
        let mut tx = db.begin().unwrap();
        insert_user_row(&mut tx, root_page, 1000, "tmp", "t@x").unwrap();
        tx.rollback().unwrap();
    }

    let mut cursor = db.cursor("users", None).unwrap();
    let found = cursor.seek_rowid(1000).unwrap();
    assert!(!found);

    cursor.first().unwrap();
    let mut scratch = Vec::new();
    let row = cursor.current(&mut scratch).unwrap();
    assert_eq!(row.rowid(), Some(1));
    cursor.next().unwrap();
    assert!(!cursor.valid());
}

/// S6 -- encrypted round-trip.
#[test]
fn encrypted_database_round_trips_with_correct_password() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s6.db");

    {
        let mut db = Database::create(&path, CreateOptions::new().password("pw")).unwrap();
        let mut tx = db.begin().unwrap();
        let root = bootstrap_table(
            &mut tx,
            1,
            "secrets",
            "CREATE TABLE secrets (id INTEGER PRIMARY KEY, note TEXT, email TEXT)",
        )
        .unwrap();
        insert_user_row(&mut tx, root, 1, "secret", "s@x").unwrap();
        tx.commit().unwrap();
    }

    let db = Database::open(&path, OpenOptions::new().password("pw")).unwrap();
    let mut cursor = db.cursor("secrets", None).unwrap();
    assert!(cursor.seek_rowid(1).unwrap());
    let mut scratch = Vec::new();
    let row = cursor.current(&mut scratch).unwrap();
    assert_eq!(value_text(&row.value(1)), "secret");

    let wrong = Database::open(&path, OpenOptions::new().password("wrong"));
    match wrong {
        Ok(db) => {
            // The header itself stays plaintext, so open() succeeds; the
            // wrong key only fails once a page past the header is read.
            let err = db.cursor("secrets", None).unwrap_err();
            assert!(matches!(err, Error::CryptoError { .. }));
        }
        Err(Error::CryptoError { .. }) => {}
        Err(other) => panic!("expected CryptoError, got {other:?}"),
    }
}
