//! Shared-memory attachment contract.
//!
//! URIs take the form `shm://<namespace>/<name>#<offset>,<size>` with
//! decimal byte counts. The backing store is a collaborator behind
//! [`SharedMemoryStore`]; the in-process [`MemoryShmStore`] exists for
//! tests and single-process pipelines.
//!
//! Lifetime rule: the sender owns a published region until the frame that
//! referenced it is ACKed; the receiver must copy out before ACKing if it
//! needs the bytes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Result, XcpError};

/// Parsed `shm://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmUri {
    pub namespace: String,
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

impl ShmUri {
    /// Parse `shm://<namespace>/<name>#<offset>,<size>`.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("shm://")
            .ok_or_else(|| XcpError::Attachment(format!("not an shm uri: {uri:?}")))?;
        let (path, fragment) = rest
            .split_once('#')
            .ok_or_else(|| XcpError::Attachment(format!("shm uri missing fragment: {uri:?}")))?;
        let (namespace, name) = path
            .split_once('/')
            .ok_or_else(|| XcpError::Attachment(format!("shm uri missing name: {uri:?}")))?;
        if namespace.is_empty() || name.is_empty() {
            return Err(XcpError::Attachment(format!(
                "shm uri has empty namespace or name: {uri:?}"
            )));
        }
        let (offset, size) = fragment
            .split_once(',')
            .ok_or_else(|| XcpError::Attachment(format!("shm fragment not offset,size: {uri:?}")))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|_| XcpError::Attachment(format!("bad shm offset: {uri:?}")))?;
        let size = size
            .parse::<u64>()
            .map_err(|_| XcpError::Attachment(format!("bad shm size: {uri:?}")))?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            offset,
            size,
        })
    }
}

impl fmt::Display for ShmUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shm://{}/{}#{},{}",
            self.namespace, self.name, self.offset, self.size
        )
    }
}

/// Collaborator contract for the shared-memory backing store.
pub trait SharedMemoryStore: Send + Sync {
    /// Publish bytes; returns the URI a peer can fetch them under.
    fn publish(&self, bytes: Bytes, ttl: Duration) -> Result<String>;
    /// Map a URI and read `size` bytes at `offset`.
    fn fetch(&self, uri: &str) -> Result<Bytes>;
    /// Release a published region.
    fn release(&self, uri: &str);
}

/// In-process store backed by a plain map. Good for tests and for
/// same-process producer/consumer pairs; TTLs are accepted but regions
/// only expire on release.
pub struct MemoryShmStore {
    namespace: String,
    regions: Mutex<HashMap<String, Bytes>>,
    next_block: AtomicU64,
}

impl MemoryShmStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            regions: Mutex::new(HashMap::new()),
            next_block: AtomicU64::new(1),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().expect("store lock poisoned").len()
    }
}

impl SharedMemoryStore for MemoryShmStore {
    fn publish(&self, bytes: Bytes, _ttl: Duration) -> Result<String> {
        let block = self.next_block.fetch_add(1, Ordering::Relaxed);
        let name = format!("blk-{block}");
        let uri = ShmUri {
            namespace: self.namespace.clone(),
            name: name.clone(),
            offset: 0,
            size: bytes.len() as u64,
        };
        self.regions
            .lock()
            .expect("store lock poisoned")
            .insert(name, bytes);
        Ok(uri.to_string())
    }

    fn fetch(&self, uri: &str) -> Result<Bytes> {
        let parsed = ShmUri::parse(uri)?;
        if parsed.namespace != self.namespace {
            return Err(XcpError::Attachment(format!(
                "uri namespace {:?} is not served here",
                parsed.namespace
            )));
        }
        let regions = self.regions.lock().expect("store lock poisoned");
        let region = regions
            .get(&parsed.name)
            .ok_or_else(|| XcpError::Attachment(format!("unknown shm region {:?}", parsed.name)))?;
        let end = parsed
            .offset
            .checked_add(parsed.size)
            .filter(|&e| e <= region.len() as u64)
            .ok_or_else(|| {
                XcpError::Attachment(format!("shm range out of bounds for {:?}", parsed.name))
            })?;
        Ok(region.slice(parsed.offset as usize..end as usize))
    }

    fn release(&self, uri: &str) {
        if let Ok(parsed) = ShmUri::parse(uri) {
            self.regions
                .lock()
                .expect("store lock poisoned")
                .remove(&parsed.name);
        }
    }
}
