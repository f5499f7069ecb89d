//! Filesystem-backed [`BlobStore`].
//!
//! Each key is one file inside a single directory:
//! ```text
//! <dir>/
//!     000000000001        -- value bytes for key "000000000001"
//!     000000000002
//!     .000000000003.Ab3xQz.tmp   -- in-flight write, never listed
//! ```
//! Writes are atomic via a temp-rename pattern so readers never observe a
//! partially written value.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::blob::{BlobStore, Keys, ListOptions};

/// A [`BlobStore`] that keeps one file per key in a directory.
///
/// `FsBlobStore` is cheap to clone (it wraps a single `PathBuf`). Keys must
/// be valid file names: non-empty, no path separators or NUL bytes, and not
/// starting with `.` (reserved for temp files).
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory holding one file per key.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Returns the directory this store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Map a key to its file path after validating it.
    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("key {key:?} is not a valid file name"),
            ));
        }
        Ok(self.dir.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> io::Result<()> {
        let path = self.path_for(key)?;
        // Unique temp name per write so concurrent puts of one key never
        // share a file.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{key}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(value)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self, opts: &ListOptions) -> io::Result<Keys<'_>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(e),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Non UTF-8 names cannot have been written through this store.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !opts.matches(&name) {
                continue;
            }
            keys.push(name);
        }

        // `read_dir` order is unspecified; sort by byte order.
        keys.sort_unstable();
        if opts.reverse {
            keys.reverse();
        }
        Ok(Box::new(keys.into_iter().map(Ok)))
    }
}
