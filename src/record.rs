//! Serial-type codec (spec §4.3) and the borrowed row cursor over a decoded
//! record payload (spec §4.4).

use crate::varint;

/// The per-column serial type tag, decoded from a header varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialType {
    Null,
    I8,
    I16,
    I24,
    I32,
    I48,
    I64,
    F64,
    Zero,
    One,
    Blob(usize),
    Text(usize),
}

impl SerialType {
    /// Decodes a serial-type tag from its on-disk varint value.
    pub fn from_code(code: i64) -> Option<Self> {
        let code = code as u64;
        Some(match code {
            0 => SerialType::Null,
            1 => SerialType::I8,
            2 => SerialType::I16,
            3 => SerialType::I24,
            4 => SerialType::I32,
            5 => SerialType::I48,
            6 => SerialType::I64,
            7 => SerialType::F64,
            8 => SerialType::Zero,
            9 => SerialType::One,
            10 | 11 => return None, // reserved for internal use
            n if n % 2 == 0 => SerialType::Blob(((n - 12) / 2) as usize),
            n => SerialType::Text(((n - 13) / 2) as usize),
        })
    }

    /// The number of body bytes this serial type occupies.
    pub fn size(self) -> usize {
        match self {
            SerialType::Null | SerialType::Zero | SerialType::One => 0,
            SerialType::I8 => 1,
            SerialType::I16 => 2,
            SerialType::I24 => 3,
            SerialType::I32 => 4,
            SerialType::I48 => 6,
            SerialType::I64 | SerialType::F64 => 8,
            SerialType::Blob(n) | SerialType::Text(n) => n,
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, SerialType::Null)
    }
}

/// A decoded column value, owning only what it must (TEXT/BLOB stay borrowed
/// elsewhere via [`Row`]; this is used where an owned value is convenient,
/// e.g. index-key comparison).
#[derive(Debug, Clone, PartialEq)]
pub enum Value<'a> {
    Null,
    Integer(i64),
    Float(f64),
    Blob(&'a [u8]),
    Text(&'a str),
}

/// Storage-class ordering for index-key comparison (spec §4.5 "index
/// B-trees compare by record-lexicographic order"): NULL < numeric < TEXT <
/// BLOB, matching SQLite's type-affinity ordering closely enough for the
/// single-affinity-per-column indexes this engine builds.
fn storage_class(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Integer(_) | Value::Float(_) => 1,
        Value::Text(_) => 2,
        Value::Blob(_) => 3,
    }
}

/// Compares two decoded index keys column-by-column, per spec §4.5. Callers
/// append the rowid as a final `Value::Integer` column to get the
/// "ties broken by the appended rowid" behavior for free.
pub fn compare_values(a: &[Value], b: &[Value]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x, y) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
            (Value::Float(x), Value::Float(y)) => {
                x.partial_cmp(y).unwrap_or(Ordering::Equal)
            }
            (Value::Integer(x), Value::Float(y)) => {
                (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal)
            }
            (Value::Float(x), Value::Integer(y)) => {
                x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal)
            }
            (Value::Text(x), Value::Text(y)) => x.cmp(y),
            (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
            _ => storage_class(x).cmp(&storage_class(y)),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// A decoded view over one record's column headers, addressed by ordinal.
/// Building this walks the varint header once; it does not touch the body.
pub(crate) struct RecordHeader {
    types: Vec<SerialType>,
    /// Byte offset of each column's value within the record body (i.e.
    /// relative to the end of the header, which is where `body` starts).
    offsets: Vec<usize>,
}

impl RecordHeader {
    pub(crate) fn parse(payload: &[u8]) -> Result<(Self, usize), &'static str> {
        let (header_size, hs_len) = varint::read(payload);
        if header_size < hs_len as i64 {
            return Err("record header size shorter than its own length prefix");
        }
        let header_size = header_size as usize;
        if header_size > payload.len() {
            return Err("record header size exceeds payload length");
        }

        let mut pos = hs_len;
        let mut types = Vec::new();
        let mut offsets = Vec::new();
        let mut body_offset = 0usize;

        while pos < header_size {
            let (code, len) = varint::read(&payload[pos..]);
            let ty = SerialType::from_code(code).ok_or("reserved serial type code")?;
            pos += len;
            offsets.push(body_offset);
            body_offset += ty.size();
            types.push(ty);
        }

        Ok((Self { types, offsets }, header_size))
    }

    pub(crate) fn field_count(&self) -> usize {
        self.types.len()
    }

    pub(crate) fn serial_type(&self, i: usize) -> SerialType {
        self.types[i]
    }

    pub(crate) fn offset(&self, i: usize) -> usize {
        self.offsets[i]
    }
}

/// Borrowed accessor over a single row's (or index entry's) decoded columns.
///
/// Built from a payload slice that is either a direct borrow into a page
/// buffer, or bytes assembled from an overflow chain into a caller-supplied
/// scratch buffer — either way, the accessors below borrow from whatever
/// slice backs `payload` for the lifetime of `Row`.
pub struct Row<'a> {
    header: RecordHeader,
    body: &'a [u8],
    rowid: Option<i64>,
}

impl<'a> Row<'a> {
    /// Decodes a record payload. `payload` must be fully inlined (no
    /// overflow) or already assembled by the caller (spec §4.4: overflow
    /// assembly is the caller's responsibility via a scratch buffer).
    pub fn decode(payload: &'a [u8], rowid: Option<i64>) -> crate::error::Result<Self> {
        let (header, header_size) = RecordHeader::parse(payload)
            .map_err(|reason| crate::error::Error::corrupt(0, reason))?;
        let body = &payload[header_size..];
        Ok(Row { header, body, rowid })
    }

    pub fn field_count(&self) -> usize {
        self.header.field_count()
    }

    pub fn rowid(&self) -> Option<i64> {
        self.rowid
    }

    pub fn serial_type(&self, i: usize) -> SerialType {
        self.header.serial_type(i)
    }

    pub fn is_null(&self, i: usize) -> bool {
        self.header.serial_type(i).is_null()
    }

    fn field_bytes(&self, i: usize) -> &'a [u8] {
        let start = self.header.offset(i);
        let len = self.header.serial_type(i).size();
        &self.body[start..start + len]
    }

    /// Reads column `i` as a 64-bit signed integer, per the integer serial
    /// types (1/2/3/4/6/8-byte big-endian, `Zero`/`One` shorthand, `Null` as
    /// 0). Returns `None` for TEXT/BLOB/FLOAT columns.
    pub fn read_int(&self, i: usize) -> Option<i64> {
        let bytes = self.field_bytes(i);
        Some(match self.header.serial_type(i) {
            SerialType::Null => 0,
            SerialType::Zero => 0,
            SerialType::One => 1,
            SerialType::I8 => bytes[0] as i8 as i64,
            SerialType::I16 => i16::from_be_bytes(bytes.try_into().unwrap()) as i64,
            SerialType::I24 => sign_extend(bytes, 3),
            SerialType::I32 => i32::from_be_bytes(bytes.try_into().unwrap()) as i64,
            SerialType::I48 => sign_extend(bytes, 6),
            SerialType::I64 => i64::from_be_bytes(bytes.try_into().unwrap()),
            SerialType::F64 | SerialType::Blob(_) | SerialType::Text(_) => return None,
        })
    }

    /// Reads column `i` as an IEEE-754 double. Returns `None` for non-float
    /// columns (callers that need integer affinity coercion should call
    /// `read_int` and convert).
    pub fn read_float(&self, i: usize) -> Option<f64> {
        match self.header.serial_type(i) {
            SerialType::F64 => {
                let bytes = self.field_bytes(i);
                Some(f64::from_be_bytes(bytes.try_into().unwrap()))
            }
            _ => None,
        }
    }

    /// Borrows column `i`'s raw bytes, for BLOB (or TEXT, as raw bytes)
    /// columns. Zero-copy into whatever buffer backs this `Row`.
    pub fn read_bytes(&self, i: usize) -> Option<&'a [u8]> {
        match self.header.serial_type(i) {
            SerialType::Blob(_) | SerialType::Text(_) => Some(self.field_bytes(i)),
            _ => None,
        }
    }

    /// Borrows column `i` as UTF-8 text. The engine only requires UTF-8
    /// support (spec §3 header "text encoding"); databases declaring
    /// UTF-16 are rejected at open time (`UnsupportedFeature`).
    pub fn read_text(&self, i: usize) -> Option<&'a str> {
        match self.header.serial_type(i) {
            SerialType::Text(_) => std::str::from_utf8(self.field_bytes(i)).ok(),
            _ => None,
        }
    }

    pub fn value(&self, i: usize) -> Value<'a> {
        match self.header.serial_type(i) {
            SerialType::Null => Value::Null,
            SerialType::F64 => Value::Float(self.read_float(i).unwrap()),
            SerialType::Blob(_) => Value::Blob(self.read_bytes(i).unwrap()),
            SerialType::Text(_) => Value::Text(self.read_text(i).unwrap()),
            _ => Value::Integer(self.read_int(i).unwrap()),
        }
    }

    /// All of this row's column values, in order. Used by index-key
    /// comparison and by the writer when rebuilding a record it has
    /// already decoded (e.g. to append a rowid tie-breaker).
    pub fn values(&self) -> Vec<Value<'a>> {
        (0..self.field_count()).map(|i| self.value(i)).collect()
    }
}

fn sign_extend(bytes: &[u8], width: usize) -> i64 {
    let mut buf = [0u8; 8];
    let negative = bytes[0] & 0x80 != 0;
    if negative {
        buf = [0xff; 8];
    }
    buf[8 - width..].copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

/// Encodes a record from owned column values, used by the writer.
pub fn encode_record(values: &[OwnedValue]) -> Vec<u8> {
    let mut header = Vec::new();
    let mut body = Vec::new();

    for v in values {
        let (code, bytes) = v.encode();
        let mut code_buf = [0u8; 9];
        let len = varint::write(code, &mut code_buf);
        header.extend_from_slice(&code_buf[..len]);
        body.extend_from_slice(&bytes);
    }

    // header_size varint includes its own length; try one byte then check.
    let mut header_size = header.len() + 1;
    loop {
        let mut buf = [0u8; 9];
        let len = varint::write(header_size as i64, &mut buf);
        if len + header.len() == header_size {
            let mut out = Vec::with_capacity(header_size + body.len());
            out.extend_from_slice(&buf[..len]);
            out.extend_from_slice(&header);
            out.extend_from_slice(&body);
            return out;
        }
        header_size += 1;
    }
}

/// Owned column value, used when constructing records to write.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedValue {
    Null,
    Integer(i64),
    Float(f64),
    Blob(Vec<u8>),
    Text(String),
}

impl From<&Value<'_>> for OwnedValue {
    fn from(v: &Value<'_>) -> Self {
        match v {
            Value::Null => OwnedValue::Null,
            Value::Integer(i) => OwnedValue::Integer(*i),
            Value::Float(f) => OwnedValue::Float(*f),
            Value::Blob(b) => OwnedValue::Blob(b.to_vec()),
            Value::Text(s) => OwnedValue::Text(s.to_string()),
        }
    }
}

impl OwnedValue {
    pub fn as_value(&self) -> Value<'_> {
        match self {
            OwnedValue::Null => Value::Null,
            OwnedValue::Integer(i) => Value::Integer(*i),
            OwnedValue::Float(f) => Value::Float(*f),
            OwnedValue::Blob(b) => Value::Blob(b),
            OwnedValue::Text(s) => Value::Text(s),
        }
    }

    fn encode(&self) -> (i64, Vec<u8>) {
        match self {
            OwnedValue::Null => (0, Vec::new()),
            OwnedValue::Integer(0) => (8, Vec::new()),
            OwnedValue::Integer(1) => (9, Vec::new()),
            OwnedValue::Integer(v) => {
                let v = *v;
                if let Ok(v) = i8::try_from(v) {
                    (1, vec![v as u8])
                } else if let Ok(v) = i16::try_from(v) {
                    (2, v.to_be_bytes().to_vec())
                } else if v >= -(1 << 23) && v < (1 << 23) {
                    (3, v.to_be_bytes()[5..8].to_vec())
                } else if let Ok(v) = i32::try_from(v) {
                    (4, v.to_be_bytes().to_vec())
                } else if v >= -(1i64 << 47) && v < (1i64 << 47) {
                    (5, v.to_be_bytes()[2..8].to_vec())
                } else {
                    (6, v.to_be_bytes().to_vec())
                }
            }
            OwnedValue::Float(v) => (7, v.to_be_bytes().to_vec()),
            OwnedValue::Blob(b) => ((b.len() * 2 + 12) as i64, b.clone()),
            OwnedValue::Text(s) => ((s.len() * 2 + 13) as i64, s.as_bytes().to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_type_from_code() {
        assert_eq!(SerialType::from_code(0), Some(SerialType::Null));
        assert_eq!(SerialType::from_code(1).unwrap().size(), 1);
        assert_eq!(SerialType::from_code(12), Some(SerialType::Blob(0)));
        assert_eq!(SerialType::from_code(13), Some(SerialType::Text(0)));
        assert_eq!(SerialType::from_code(19), Some(SerialType::Text(3)));
        assert_eq!(SerialType::from_code(10), None);
    }

    #[test]
    fn test_record_roundtrip_mixed_columns() {
        let values = vec![
            OwnedValue::Integer(42),
            OwnedValue::Text("hello".to_owned()),
            OwnedValue::Null,
            OwnedValue::Float(1.5),
            OwnedValue::Blob(vec![1, 2, 3]),
            OwnedValue::Integer(0),
            OwnedValue::Integer(1),
            OwnedValue::Integer(-70000),
        ];
        let encoded = encode_record(&values);
        let row = Row::decode(&encoded, Some(7)).unwrap();

        assert_eq!(row.field_count(), 8);
        assert_eq!(row.read_int(0), Some(42));
        assert_eq!(row.read_text(1), Some("hello"));
        assert!(row.is_null(2));
        assert_eq!(row.read_float(3), Some(1.5));
        assert_eq!(row.read_bytes(4), Some(&[1u8, 2, 3][..]));
        assert_eq!(row.read_int(5), Some(0));
        assert_eq!(row.read_int(6), Some(1));
        assert_eq!(row.read_int(7), Some(-70000));
        assert_eq!(row.rowid(), Some(7));
    }

    #[test]
    fn test_record_projection_skips_without_materializing() {
        // Column 1 is a large text column; only column 0 is read, and
        // read_bytes/read_text on it never get called -- this just confirms
        // decode() doesn't eagerly copy body bytes anywhere.
        let values = vec![
            OwnedValue::Integer(9),
            OwnedValue::Text("x".repeat(10_000)),
        ];
        let encoded = encode_record(&values);
        let row = Row::decode(&encoded, None).unwrap();
        assert_eq!(row.read_int(0), Some(9));
    }
}
