//! Object store backed by a local directory, one file per object.
//!
//! Useful for running the daemon without a cloud account and for exercising
//! the transfer engine against real files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::warn;

use super::{BackendConnection, BackendError, ObjectBackend, ObjectId, StatusCode};

/// Directory-backed object store.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    /// Use `root` as the object directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The object directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ObjectBackend for DirectoryBackend {
    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        if !self.root.is_dir() {
            return Err(BackendError::Unreachable(format!(
                "object directory {} is missing",
                self.root.display()
            )));
        }
        Ok(Box::new(DirectoryConnection {
            root: self.root.clone(),
        }))
    }
}

struct DirectoryConnection {
    root: PathBuf,
}

impl DirectoryConnection {
    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn store(&self, id: &ObjectId, data: &[u8]) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_data()?;
        tmp.persist(self.object_path(id)).map_err(|e| e.error)?;
        Ok(())
    }
}

fn io_status(id: &ObjectId, op: &str, err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => {
            warn!(object = %id, op, error = %err, "Object directory I/O failed");
            StatusCode::INTERNAL_ERROR
        }
    }
}

impl BackendConnection for DirectoryConnection {
    fn put_object(&mut self, id: &ObjectId, data: &[u8]) -> StatusCode {
        match self.store(id, data) {
            Ok(()) => StatusCode::CREATED,
            Err(e) => io_status(id, "put", &e),
        }
    }

    fn get_object(&mut self, id: &ObjectId) -> Result<Bytes, StatusCode> {
        fs::read(self.object_path(id))
            .map(Bytes::from)
            .map_err(|e| io_status(id, "get", &e))
    }

    fn delete_object(&mut self, id: &ObjectId) -> StatusCode {
        match fs::remove_file(self.object_path(id)) {
            Ok(()) => StatusCode::NO_CONTENT,
            Err(e) => io_status(id, "delete", &e),
        }
    }

    fn reauthenticate(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}
