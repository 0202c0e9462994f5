//! Loose object storage
//!
//! Objects land here as individual files before being aggregated into an
//! archive. Each write gets a fresh storage id, so overwriting an object
//! never touches the file of the previous version.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tapeio_common::checksum::HashingWriter;
use tapeio_common::{DigestWithSize, Error, Result, ensure_safe_path_segment, new_storage_id};
use tracing::{debug, warn};

/// A freshly stored loose file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub storage_id: String,
    pub digest: DigestWithSize,
}

/// Store of loose object files, addressed by container and storage id
pub trait LooseObjectStore: Send + Sync {
    /// Store exactly `size` bytes from `reader` under a new storage id
    fn write(&self, container: &str, object_name: &str, reader: &mut dyn Read, size: u64) -> Result<StoredFile>;

    /// Open a stored file; `None` if it does not exist
    fn read(&self, container: &str, storage_id: &str) -> Result<Option<File>>;

    /// Delete a stored file. Returns `false` if it did not exist.
    fn delete(&self, container: &str, storage_id: &str) -> Result<bool>;

    /// Storage ids present for a container
    fn list_ids(&self, container: &str) -> Result<Vec<String>>;
}

/// Loose objects as files under `{root}/{container}/{storageId}`
pub struct FsLooseObjectStore {
    root: PathBuf,
}

impl FsLooseObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, container: &str, storage_id: &str) -> Result<PathBuf> {
        ensure_safe_path_segment(container)?;
        ensure_safe_path_segment(storage_id)?;
        Ok(self.root.join(container).join(storage_id))
    }
}

impl LooseObjectStore for FsLooseObjectStore {
    fn write(&self, container: &str, object_name: &str, reader: &mut dyn Read, size: u64) -> Result<StoredFile> {
        let storage_id = new_storage_id(object_name);
        let path = self.path_of(container, &storage_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut out = HashingWriter::new(BufWriter::new(file));

        let written = io::copy(&mut reader.take(size), &mut out)
            .and_then(|n| out.flush().map(|()| n))
            .map_err(Error::from);
        let complete = match written {
            Ok(n) if n == size => Ok(()),
            Ok(n) => Err(Error::bad_request(format!(
                "object {container}/{object_name}: stream ended after {n} of {size} bytes"
            ))),
            Err(e) => Err(e),
        };
        let (writer, digest) = out.into_parts();
        let synced = complete.and_then(|()| {
            let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
            file.sync_all()?;
            Ok(())
        });
        if let Err(e) = synced {
            if let Err(rm) = fs::remove_file(&path) {
                warn!("Failed to remove partial file {}: {rm}", path.display());
            }
            return Err(e);
        }
        debug!("Stored {container}/{object_name} as {storage_id} ({size} bytes)");
        Ok(StoredFile { storage_id, digest })
    }

    fn read(&self, container: &str, storage_id: &str) -> Result<Option<File>> {
        match File::open(self.path_of(container, storage_id)?) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, container: &str, storage_id: &str) -> Result<bool> {
        match fs::remove_file(self.path_of(container, storage_id)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_ids(&self, container: &str) -> Result<Vec<String>> {
        ensure_safe_path_segment(container)?;
        let dir = self.root.join(container);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tapeio_common::checksum::digest_bytes;
    use tapeio_common::object_name_of_storage_id;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let store = FsLooseObjectStore::new(dir.path()).unwrap();

        let stored = store.write("c", "o1", &mut Cursor::new(b"hello world"), 11).unwrap();
        assert_eq!(object_name_of_storage_id(&stored.storage_id).unwrap(), "o1");
        assert_eq!(stored.digest.size, 11);
        assert_eq!(stored.digest.digest, digest_bytes(b"hello world"));

        let mut data = String::new();
        store
            .read("c", &stored.storage_id)
            .unwrap()
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "hello world");
        assert_eq!(store.list_ids("c").unwrap(), vec![stored.storage_id.clone()]);

        assert!(store.delete("c", &stored.storage_id).unwrap());
        assert!(!store.delete("c", &stored.storage_id).unwrap());
        assert!(store.read("c", &stored.storage_id).unwrap().is_none());
    }

    #[test]
    fn test_short_stream_leaves_nothing() {
        let dir = tempdir().unwrap();
        let store = FsLooseObjectStore::new(dir.path()).unwrap();
        let err = store.write("c", "o1", &mut Cursor::new(b"abc"), 10).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(store.list_ids("c").unwrap().is_empty());
    }

    #[test]
    fn test_unsafe_names_and_missing_container() {
        let dir = tempdir().unwrap();
        let store = FsLooseObjectStore::new(dir.path()).unwrap();
        assert!(store.write("..", "o1", &mut Cursor::new(b"a"), 1).is_err());
        assert!(store.read("c", "../../etc").is_err());
        assert!(store.list_ids("unknown").unwrap().is_empty());
    }
}
