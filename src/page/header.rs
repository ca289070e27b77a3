//! The 100-byte database header (spec §3 "Header").

use zerocopy::{
    big_endian::{I32, U16, U32},
    FromBytes,
};

use crate::error::{Error, Result};

pub const HEADER_STRING: [u8; 16] = *b"SQLite format 3\0";
pub const HEADER_SIZE: usize = 100;
const SUPPORTED_PAGE_SIZES: [u32; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// The KDF parameter slot lives in the last 16 bytes of the header's 20-byte
/// "reserved for expansion" field (spec §4.9, Open Question (i) resolved in
/// SPEC_FULL §4.9): offset 76..92 of the 100-byte header.
pub const KDF_SLOT_OFFSET: usize = 76;
pub const KDF_SLOT_SIZE: usize = 16;
pub const KDF_LAYOUT_VERSION: u8 = 1;

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    zerocopy::FromZeroes,
    zerocopy::FromBytes,
    zerocopy::AsBytes,
    zerocopy::Unaligned,
)]
#[repr(C)]
pub struct Header {
    header_string: [u8; 16],
    page_size: U16,
    write_version: u8,
    read_version: u8,
    reserved_space: u8,
    max_payload_fraction: u8,
    min_payload_fraction: u8,
    leaf_payload_fraction: u8,
    file_change_counter: U32,
    database_size: U32,
    freelist_head: U32,
    freelist_count: U32,
    schema_cookie: U32,
    schema_format: U32,
    page_cache_size: I32,
    largest_root_btree_page_number: U32,
    database_text_encoding: U32,
    user_version: U32,
    incremental_vacuum_mode: U32,
    application_id: U32,
    reserved: [u8; 20],
    version_valid_for: U32,
    sqlite_version_number: U32,
}

impl Header {
    pub fn new(page_size: u32, reserved_space: u8) -> Self {
        Self {
            header_string: HEADER_STRING,
            page_size: page_size_code(page_size).into(),
            write_version: 1,
            read_version: 1,
            reserved_space,
            max_payload_fraction: 64,
            min_payload_fraction: 32,
            leaf_payload_fraction: 32,
            file_change_counter: 1.into(),
            database_size: 1.into(),
            freelist_head: 0.into(),
            freelist_count: 0.into(),
            schema_cookie: 0.into(),
            schema_format: 4.into(),
            page_cache_size: 0.into(),
            largest_root_btree_page_number: 0.into(),
            database_text_encoding: 1.into(),
            user_version: 0.into(),
            incremental_vacuum_mode: 0.into(),
            application_id: 0.into(),
            reserved: [0; 20],
            version_valid_for: 0.into(),
            sqlite_version_number: 3_045_000.into(),
        }
    }

    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let header = Self::read_from(bytes.as_slice())
            .expect("HEADER_SIZE matches the struct's on-disk size");
        header.validate()?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.write_to(&mut buf[..]).unwrap();
        buf
    }

    fn validate(&self) -> Result<()> {
        if self.header_string != HEADER_STRING {
            return Err(Error::InvalidFile("bad magic header string".into()));
        }

        let page_size = self.page_size();
        if !SUPPORTED_PAGE_SIZES.contains(&page_size) {
            return Err(Error::InvalidFile(format!(
                "unsupported page size {page_size}"
            )));
        }

        if self.write_version > 2 || self.read_version > 2 {
            return Err(Error::UnsupportedFeature(
                "journal mode other than legacy rollback or WAL".into(),
            ));
        }
        if self.read_version == 2 {
            return Err(Error::UnsupportedFeature("WAL mode".into()));
        }

        if (self.reserved_space as u32) >= page_size.saturating_sub(480) {
            return Err(Error::InvalidFile("reserved space too large".into()));
        }

        let encoding = self.database_text_encoding.get();
        if encoding != 0 && encoding != 1 {
            return Err(Error::UnsupportedFeature(
                "text encoding other than UTF-8".into(),
            ));
        }

        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        let code = self.page_size.get();
        if code == 1 {
            65536
        } else {
            code as u32 * 256
        }
    }

    pub fn usable_page_size(&self) -> u32 {
        self.page_size() - self.reserved_space as u32
    }

    pub fn reserved_space(&self) -> u8 {
        self.reserved_space
    }

    pub fn set_reserved_space(&mut self, reserved: u8) {
        self.reserved_space = reserved;
    }

    pub fn file_change_counter(&self) -> u32 {
        self.file_change_counter.get()
    }

    pub fn bump_file_change_counter(&mut self) {
        self.file_change_counter.set(self.file_change_counter.get().wrapping_add(1));
    }

    pub fn database_size(&self) -> u32 {
        self.database_size.get()
    }

    pub fn set_database_size(&mut self, size: u32) {
        self.database_size.set(size);
    }

    pub fn freelist_head(&self) -> u32 {
        self.freelist_head.get()
    }

    pub fn set_freelist_head(&mut self, page: u32) {
        self.freelist_head.set(page);
    }

    pub fn freelist_count(&self) -> u32 {
        self.freelist_count.get()
    }

    pub fn set_freelist_count(&mut self, count: u32) {
        self.freelist_count.set(count);
    }

    pub fn schema_cookie(&self) -> u32 {
        self.schema_cookie.get()
    }

    pub fn bump_schema_cookie(&mut self) {
        self.schema_cookie.set(self.schema_cookie.get().wrapping_add(1));
    }

    pub fn application_id(&self) -> u32 {
        self.application_id.get()
    }

    pub fn user_version(&self) -> u32 {
        self.user_version.get()
    }
}

fn page_size_code(page_size: u32) -> u16 {
    if page_size == 65536 {
        1
    } else {
        (page_size / 256) as u16
    }
}

/// KDF parameters stored in the header's reserved-bytes slot (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u8,
}

impl Default for KdfParams {
    fn default() -> Self {
        // argon2id defaults in line with the OWASP-recommended floor.
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn write_to(&self, header_bytes: &mut [u8; HEADER_SIZE]) {
        let slot = &mut header_bytes[KDF_SLOT_OFFSET..KDF_SLOT_OFFSET + KDF_SLOT_SIZE];
        slot[0] = KDF_LAYOUT_VERSION;
        slot[1] = self.parallelism;
        slot[2] = 0;
        slot[3] = 0;
        slot[4..8].copy_from_slice(&self.memory_kib.to_le_bytes());
        slot[8..12].copy_from_slice(&self.iterations.to_le_bytes());
        slot[12..16].copy_from_slice(&[0; 4]);
    }

    pub fn read_from(header_bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let slot = &header_bytes[KDF_SLOT_OFFSET..KDF_SLOT_OFFSET + KDF_SLOT_SIZE];
        if slot[0] != KDF_LAYOUT_VERSION {
            return Err(Error::CryptoError {
                page: 1,
                reason: format!("unknown KDF parameter layout version {}", slot[0]),
            });
        }
        Ok(Self {
            parallelism: slot[1],
            memory_kib: u32::from_le_bytes(slot[4..8].try_into().unwrap()),
            iterations: u32::from_le_bytes(slot[8..12].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_header_round_trips() {
        let header = Header::new(4096, 0);
        let bytes = header.to_bytes();
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.page_size(), 4096);
    }

    #[test]
    fn test_page_size_65536_encodes_as_one() {
        let header = Header::new(65536, 0);
        let bytes = header.to_bytes();
        assert_eq!(u16::from_be_bytes([bytes[16], bytes[17]]), 1);
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(parsed.page_size(), 65536);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = Header::new(4096, 0).to_bytes();
        bytes[0] = b'X';
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn test_rejects_unsupported_page_size() {
        let mut header = Header::new(4096, 0);
        header.page_size = 3u16.into(); // 768 bytes, not a supported size
        let bytes = header.to_bytes();
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn test_kdf_params_round_trip() {
        let mut bytes = Header::new(4096, 32).to_bytes();
        let params = KdfParams {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        };
        params.write_to(&mut bytes);
        let parsed = KdfParams::read_from(&bytes).unwrap();
        assert_eq!(parsed, params);
    }
}
