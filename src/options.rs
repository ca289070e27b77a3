//! Builders for opening and creating databases (spec §2, §4.9, §6).

use crate::page::header::KdfParams;

/// Options for `Database::open` on an existing file.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub(crate) writable: bool,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) kdf_override: Option<KdfParams>,
    pub(crate) page_cache_pages: Option<u32>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the database for reading and writing. Defaults to read-only.
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Supplies the passphrase for an encrypted database. Omitting this on
    /// an encrypted file surfaces as `Error::CryptoError` on the first page
    /// read past the header.
    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Overrides the KDF parameters read from the header -- normally left
    /// unset, since the parameters an encrypted file was created with are
    /// stored in the header itself (spec §4.9).
    pub fn kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_override = Some(params);
        self
    }

    /// Caps the number of pages the in-memory cache holds (spec §4.2).
    /// Defaults to 2000 pages if unset.
    pub fn page_cache_pages(mut self, pages: u32) -> Self {
        self.page_cache_pages = Some(pages);
        self
    }
}

/// Options for `Database::create`, which builds a brand new file.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub(crate) page_size: u32,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) kdf_override: Option<KdfParams>,
    pub(crate) page_cache_pages: Option<u32>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            password: None,
            kdf_override: None,
            page_cache_pages: None,
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size. Must be a power of two between 512 and 65536
    /// (spec §3 "Header"); invalid values surface as `Error::InvalidFile`
    /// when `Database::create` is called.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Enables transparent per-page encryption with `password` (spec §4.9).
    /// Leaving this unset creates a plain, unencrypted database.
    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Overrides the default Argon2id parameters (`KdfParams::default`)
    /// used to derive the page key. Only meaningful alongside `password`.
    pub fn kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_override = Some(params);
        self
    }

    pub fn page_cache_pages(mut self, pages: u32) -> Self {
        self.page_cache_pages = Some(pages);
        self
    }
}
