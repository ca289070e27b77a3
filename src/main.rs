//! A small inspection CLI over the storage engine: opens a database
//! read-only, lists its schema, and dumps the first few rows of a table.
//!
//! `pagevault <path> [table] [limit]`

use std::env;
use std::process::ExitCode;

use pagevault::record::Value;
use pagevault::{Database, OpenOptions};

fn print_value(v: &Value) {
    match v {
        Value::Null => print!("NULL"),
        Value::Integer(i) => print!("{i}"),
        Value::Float(f) => print!("{f}"),
        Value::Text(s) => print!("{s:?}"),
        Value::Blob(b) => print!("<{} byte blob>", b.len()),
    }
}

fn run() -> pagevault::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("usage: pagevault <path> [table] [limit]");
            return Ok(());
        }
    };
    let table_filter = args.next();
    let limit: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    let db = Database::open(&path, OpenOptions::new())?;
    let schema = db.schema()?;

    if schema.is_empty() {
        println!("(no tables)");
        return Ok(());
    }

    for table in &schema {
        if let Some(want) = &table_filter {
            if &table.name != want {
                continue;
            }
        }
        println!(
            "{} (root page {}, {} column(s))",
            table.name,
            table.root_page,
            table.columns.len()
        );
        for col in &table.columns {
            println!("  - {} : {:?}", col.name, col.affinity);
        }

        let mut cursor = db.cursor(&table.name, None)?;
        cursor.first()?;
        let mut scratch = Vec::new();
        let mut shown = 0;
        while cursor.valid() && shown < limit {
            let row = cursor.current(&mut scratch)?;
            print!("  row {:?}: (", row.rowid());
            for i in 0..row.field_count() {
                if i > 0 {
                    print!(", ");
                }
                print_value(&row.value(i));
            }
            println!(")");
            cursor.next()?;
            shown += 1;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
