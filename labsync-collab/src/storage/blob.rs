//! Object storage for voice-note audio and annotation geometry.
//!
//! Only the returned URL is broadcast; payload bytes never travel through a
//! hub's channels.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use labsync_core::CollabError;

#[derive(Debug, Clone, PartialEq)]
pub enum BlobError {
    /// Key is empty or escapes the store root
    InvalidKey(String),
    /// Payload exceeds the configured upload limit
    TooLarge { size: usize, limit: usize },
    /// Backend switched off or unreachable
    Unavailable(String),
    IoError(String),
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::InvalidKey(k) => write!(f, "Invalid blob key: {k}"),
            BlobError::TooLarge { size, limit } => {
                write!(f, "Blob of {size} bytes exceeds limit of {limit}")
            }
            BlobError::Unavailable(e) => write!(f, "Blob store unavailable: {e}"),
            BlobError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::IoError(e.to_string())
    }
}

impl From<BlobError> for CollabError {
    fn from(e: BlobError) -> Self {
        log::error!("Blob store failure: {e}");
        CollabError::TransportUnavailable(e.to_string())
    }
}

pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key` and return a URL clients can fetch it from.
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError>;

    /// Fetch bytes back by URL previously returned from `put`.
    fn get(&self, url: &str) -> Result<Option<Vec<u8>>, BlobError>;
}

/// Reject keys that are empty, absolute or climb out of the store root.
fn check_key(key: &str) -> Result<(), BlobError> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

// ─── In-memory ────────────────────────────────────────────────────────

/// Blob store that keeps payloads in a map; URLs are `mem://<key>`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_type(&self, url: &str) -> Option<String> {
        let key = url.strip_prefix("mem://")?;
        self.blobs.read().ok()?.get(key).map(|(ct, _)| ct.clone())
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("memory blob store switched off".into()));
        }
        check_key(key)?;
        self.blobs
            .write()
            .map_err(|_| BlobError::Unavailable("blob map lock poisoned".into()))?
            .insert(key.to_string(), (content_type.to_string(), bytes.to_vec()));
        Ok(format!("mem://{key}"))
    }

    fn get(&self, url: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let Some(key) = url.strip_prefix("mem://") else {
            return Ok(None);
        };
        let blobs = self
            .blobs
            .read()
            .map_err(|_| BlobError::Unavailable("blob map lock poisoned".into()))?;
        Ok(blobs.get(key).map(|(_, bytes)| bytes.clone()))
    }
}

// ─── Directory ────────────────────────────────────────────────────────

/// Blob store rooted at a local directory; URLs are `file://<abs path>`.
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String, BlobError> {
        check_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        log::trace!("Stored blob {} ({} bytes)", path.display(), bytes.len());
        Ok(format!("file://{}", path.display()))
    }

    fn get(&self, url: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let Some(path) = url.strip_prefix("file://").map(PathBuf::from) else {
            return Ok(None);
        };
        if !path.starts_with(&self.root) {
            return Ok(None);
        }
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_put_get() {
        let store = MemoryBlobStore::new();
        let url = store.put("s1/voice/a.webm", b"RIFF", "audio/webm").unwrap();
        assert_eq!(url, "mem://s1/voice/a.webm");
        assert_eq!(store.get(&url).unwrap(), Some(b"RIFF".to_vec()));
        assert_eq!(store.content_type(&url).as_deref(), Some("audio/webm"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_failure_switch() {
        let store = MemoryBlobStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.put("k", b"x", "text/plain"),
            Err(BlobError::Unavailable(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let store = MemoryBlobStore::new();
        for key in ["", "../etc/passwd", "/abs/path", "a/../../b"] {
            assert!(
                matches!(store.put(key, b"x", "text/plain"), Err(BlobError::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_dir_store_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::open(dir.path().join("blobs")).unwrap();
        let url = store.put("s1/annotations/g.json", br#"{"points":[]}"#, "application/json").unwrap();
        assert!(url.starts_with("file://"));
        assert_eq!(store.get(&url).unwrap(), Some(br#"{"points":[]}"#.to_vec()));
        assert!(store.root().join("s1/annotations/g.json").exists());
        assert_eq!(store.get("file:///definitely/not/here").unwrap(), None);
    }

    #[test]
    fn test_blob_error_maps_to_transport_unavailable() {
        let err: CollabError = BlobError::Unavailable("offline".into()).into();
        assert!(matches!(err, CollabError::TransportUnavailable(_)));
    }
}
