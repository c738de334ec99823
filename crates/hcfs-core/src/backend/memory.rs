//! In-process object store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{BackendConnection, BackendError, ObjectBackend, ObjectId, StatusCode};

/// Request counters of a [`MemoryBackend`].
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// PUT requests served.
    pub puts: AtomicU64,
    /// GET requests served.
    pub gets: AtomicU64,
    /// DELETE requests served.
    pub deletes: AtomicU64,
    /// Connections opened.
    pub connects: AtomicU64,
}

#[derive(Debug, Default)]
struct Shared {
    objects: Mutex<HashMap<String, Bytes>>,
    stats: MemoryStats,
}

/// Object store kept in a hash map. Every connection sees the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of the named object, if present.
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.shared.objects.lock().get(name).cloned()
    }

    /// Whether the named object exists.
    pub fn contains(&self, name: &str) -> bool {
        self.shared.objects.lock().contains_key(name)
    }

    /// Sorted names of all stored objects.
    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.objects.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.shared.objects.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an object directly, bypassing the connection API.
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.shared.objects.lock().insert(name.into(), data.into());
    }

    /// Request counters.
    pub fn stats(&self) -> &MemoryStats {
        &self.shared.stats
    }
}

impl ObjectBackend for MemoryBackend {
    fn connect(&self) -> Result<Box<dyn BackendConnection>, BackendError> {
        self.shared.stats.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

impl BackendConnection for MemoryConnection {
    fn put_object(&mut self, id: &ObjectId, data: &[u8]) -> StatusCode {
        self.shared.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.shared
            .objects
            .lock()
            .insert(id.to_string(), Bytes::copy_from_slice(data));
        StatusCode::CREATED
    }

    fn get_object(&mut self, id: &ObjectId) -> Result<Bytes, StatusCode> {
        self.shared.stats.gets.fetch_add(1, Ordering::Relaxed);
        self.shared
            .objects
            .lock()
            .get(&id.to_string())
            .cloned()
            .ok_or(StatusCode::NOT_FOUND)
    }

    fn delete_object(&mut self, id: &ObjectId) -> StatusCode {
        self.shared.stats.deletes.fetch_add(1, Ordering::Relaxed);
        match self.shared.objects.lock().remove(&id.to_string()) {
            Some(_) => StatusCode::NO_CONTENT,
            None => StatusCode::NOT_FOUND,
        }
    }

    fn reauthenticate(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}
