//! The schema loader (C8, spec §4.8): scans `sqlite_schema` (page 1's
//! table root) and tokenizes each `CREATE TABLE` statement's column list
//! into a typed descriptor, without a general SQL parser.

use crate::btree::cursor::Cursor;
use crate::btree::PageSource;
use crate::error::Result;

/// A table's column affinity, per spec §4.8's mapping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    fn from_type_name(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    pub affinity: Affinity,
    /// `Some(0)` for a single-column `INTEGER PRIMARY KEY` (the rowid
    /// alias) or any column named in a table-level `PRIMARY KEY (...)`.
    pub pk_ordinal: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub root_page: u32,
    pub columns: Vec<ColumnDescriptor>,
    pub without_rowid: bool,
}

impl TableDescriptor {
    /// The column that aliases the rowid, if this table declares
    /// `INTEGER PRIMARY KEY` on exactly one column (spec §4.8).
    pub fn rowid_alias(&self) -> Option<usize> {
        if self.without_rowid {
            return None;
        }
        self.columns
            .iter()
            .position(|c| c.pk_ordinal == Some(0) && c.affinity == Affinity::Integer)
    }
}

/// Scans `sqlite_schema` (always rooted at page 1) and builds one
/// `TableDescriptor` per `type = 'table'` row, skipping indexes, triggers,
/// and views (the latter two are out of scope -- spec §1).
pub fn load(source: &impl PageSource, generation: u64) -> Result<Vec<TableDescriptor>> {
    let mut tables = Vec::new();
    let mut cursor = Cursor::new(source, 1, true, generation)?;
    cursor.first()?;
    let mut scratch = Vec::new();

    while cursor.valid() {
        let row = cursor.current(&mut scratch)?;
        let kind = row.read_text(0).unwrap_or("");
        let name = row.read_text(1).unwrap_or("").to_string();
        let root_page = row.read_int(3).unwrap_or(0) as u32;
        let sql = row.read_text(4).unwrap_or("").to_string();

        if kind == "table" && root_page != 0 {
            tables.push(parse_create_table(&name, root_page, &sql));
        }
        cursor.next()?;
    }

    Ok(tables)
}

/// Tokenizes a `CREATE TABLE name (col1 type1 constraint, ...)` statement
/// into a descriptor. Falls back to a single untyped "hidden rowid" shape
/// if the statement doesn't parse as expected (a corrupt or unsupported
/// `sql` column should not abort the whole schema load).
fn parse_create_table(name: &str, root_page: u32, sql: &str) -> TableDescriptor {
    let body = match balanced_parens_body(sql) {
        Some(body) => body,
        None => {
            return TableDescriptor {
                name: name.to_string(),
                root_page,
                columns: Vec::new(),
                without_rowid: false,
            }
        }
    };

    let without_rowid = sql.to_ascii_uppercase().trim_end().ends_with("WITHOUT ROWID");
    let mut columns = Vec::new();
    let mut table_level_pk: Vec<String> = Vec::new();

    for segment in split_top_level(&body, ',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let first_word = segment.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
        if matches!(
            first_word.as_str(),
            "PRIMARY" | "FOREIGN" | "UNIQUE" | "CHECK" | "CONSTRAINT"
        ) {
            if first_word == "PRIMARY" || segment.to_ascii_uppercase().contains("PRIMARY KEY") {
                table_level_pk.extend(extract_paren_identifiers(segment));
            }
            continue;
        }

        let mut tokens = tokenize(segment).into_iter();
        let col_name = match tokens.next() {
            Some(t) => unquote(&t),
            None => continue,
        };
        let rest: Vec<String> = tokens.collect();
        let is_pk = rest
            .windows(2)
            .any(|w| w[0].eq_ignore_ascii_case("PRIMARY") && w[1].eq_ignore_ascii_case("KEY"));
        let type_name = type_name_from_tokens(&rest);
        let affinity = Affinity::from_type_name(&type_name);

        columns.push(ColumnDescriptor {
            name: col_name,
            affinity,
            pk_ordinal: if is_pk { Some(0) } else { None },
        });
    }

    for pk_name in &table_level_pk {
        if let Some(col) = columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(pk_name)) {
            if col.pk_ordinal.is_none() {
                col.pk_ordinal = Some(0);
            }
        }
    }

    TableDescriptor {
        name: name.to_string(),
        root_page,
        columns,
        without_rowid,
    }
}

/// Collects the type-name tokens preceding the first recognized
/// column-constraint keyword (everything after is a constraint, not type).
fn type_name_from_tokens(tokens: &[String]) -> String {
    const CONSTRAINT_KEYWORDS: &[&str] = &[
        "PRIMARY", "NOT", "NULL", "UNIQUE", "DEFAULT", "CHECK", "REFERENCES", "COLLATE",
        "GENERATED", "AS",
    ];
    let mut out = String::new();
    for t in tokens {
        if CONSTRAINT_KEYWORDS.iter().any(|k| t.eq_ignore_ascii_case(k)) {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(t);
    }
    out
}

/// Splits `sql` at the outermost parenthesized group's contents, e.g.
/// `"CREATE TABLE t (a, b)"` -> `Some("a, b")`.
fn balanced_parens_body(sql: &str) -> Option<String> {
    let start = sql.find('(')?;
    let bytes = sql.as_bytes();
    let mut depth = 0i32;
    let mut in_quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(q) = in_quote {
            if b == q {
                in_quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => in_quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(sql[start + 1..i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits `body` on `sep` at depth 0, ignoring separators inside nested
/// parens or quotes (so `CHECK (a > 0)` doesn't get split in half).
fn split_top_level(body: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;

    for c in body.chars() {
        if let Some(q) = in_quote {
            current.push(c);
            if c == q {
                in_quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                in_quote = Some(c);
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Pulls identifier tokens out of the first parenthesized group in
/// `segment`, e.g. `"PRIMARY KEY (a, b)"` -> `["a", "b"]`.
fn extract_paren_identifiers(segment: &str) -> Vec<String> {
    match balanced_parens_body(segment) {
        Some(body) => split_top_level(&body, ',')
            .into_iter()
            .map(|s| unquote(s.trim()))
            .filter(|s| !s.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

/// Splits `segment` into whitespace-separated tokens, keeping quoted
/// identifiers and parenthesized groups (e.g. `VARCHAR(255)`) intact.
fn tokenize(segment: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;

    for c in segment.chars() {
        if let Some(q) = in_quote {
            current.push(c);
            if c == q {
                in_quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                in_quote = Some(c);
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(token: &str) -> String {
    let trimmed = token.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'`' && last == b'`') {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
        if first == b'[' && last == b']' {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_primary_key_is_rowid_alias() {
        let t = parse_create_table(
            "users",
            2,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INT)",
        );
        assert_eq!(t.columns.len(), 3);
        assert_eq!(t.rowid_alias(), Some(0));
        assert_eq!(t.columns[1].affinity, Affinity::Text);
        assert_eq!(t.columns[2].affinity, Affinity::Integer);
    }

    #[test]
    fn test_table_level_primary_key() {
        let t = parse_create_table(
            "pairs",
            3,
            "CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b))",
        );
        assert_eq!(t.columns[0].pk_ordinal, Some(0));
        assert_eq!(t.columns[1].pk_ordinal, Some(0));
        // Composite key isn't a single-column INTEGER PRIMARY KEY rowid alias.
        assert_eq!(t.rowid_alias(), None);
    }

    #[test]
    fn test_blob_is_default_affinity() {
        let t = parse_create_table("blobs", 4, "CREATE TABLE blobs (data, note TEXT)");
        assert_eq!(t.columns[0].affinity, Affinity::Blob);
    }

    #[test]
    fn test_without_rowid_suppresses_alias() {
        let t = parse_create_table(
            "kv",
            5,
            "CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB) WITHOUT ROWID",
        );
        assert!(t.without_rowid);
        assert_eq!(t.rowid_alias(), None);
    }

    #[test]
    fn test_real_and_numeric_affinity() {
        let t = parse_create_table(
            "measures",
            6,
            "CREATE TABLE measures (amount DOUBLE, ratio DECIMAL(10,2))",
        );
        assert_eq!(t.columns[0].affinity, Affinity::Real);
        assert_eq!(t.columns[1].affinity, Affinity::Numeric);
    }
}
