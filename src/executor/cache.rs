//! Cache of execution responses, keyed by request content.
//!
//! Requests are pure functions of their content: the same executable,
//! arguments, input digests, requested outputs and limits produce the same
//! classified outcome (up to measurement noise), so responses can be
//! replayed. The dispatch server consults it before scheduling, so a hit
//! never occupies a worker. A hit is only valid while every artifact the
//! response references (and does not carry inline) is still present in
//! the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::proto::{ExecutionRequest, ExitStatus, Response};
use crate::store::{self, Digest, FileStore};

const CACHE_FILE: &str = "cache.json";

pub struct ExecutionCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, Response>>,
}

impl ExecutionCache {
    /// Opens the cache persisted under the store root, starting empty when
    /// no usable file is there.
    pub fn open(store: &FileStore) -> Self {
        let path = store.root().join(CACHE_FILE);
        let entries = match store::read_bytes(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("discarding unreadable execution cache: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("execution cache holds {} entries", entries.len());
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Cache key of a request: the digest of its canonical form.
    ///
    /// The keep-sandbox flag only affects side effects and is excluded.
    /// Inline input contents are folded into their digest, so a request
    /// carrying a small file inline hashes the same as one referencing
    /// the already-stored artifact.
    pub fn key(request: &ExecutionRequest) -> Digest {
        let mut canonical = request.clone();
        canonical.keep_sandbox = false;
        for input in &mut canonical.inputs {
            if input.digest.is_none() {
                input.digest = input.contents.as_deref().map(Digest::of_bytes);
            }
            input.contents = None;
        }
        let bytes = serde_json::to_vec(&canonical).expect("request serialization is infallible");
        Digest::of_bytes(&bytes)
    }

    pub fn get(&self, key: &Digest, store: &FileStore) -> Option<Response> {
        let entries = self.entries.lock().unwrap();
        let response = entries.get(&key.to_hex())?;
        for output in &response.outputs {
            // Outputs carrying their contents inline replay as-is; the
            // rest must still be present in the store.
            if output.contents.is_some() {
                continue;
            }
            if let Some(digest) = &output.digest {
                if !store.contains(digest) {
                    return None;
                }
            }
        }
        Some(response.clone())
    }

    pub fn put(&self, key: Digest, response: &Response) {
        if response.status == ExitStatus::InternalError {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_hex(), response.clone());
        if let Err(e) = self.save(&entries) {
            warn!("failed to persist execution cache: {}", e);
        }
    }

    fn save(&self, entries: &HashMap<String, Response>) -> Result<(), store::StoreError> {
        let bytes = serde_json::to_vec(entries).expect("cache serialization is infallible");
        store::write_bytes(&self.path, &bytes, true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{FileInfo, FileRole, ResourceUsage};

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn success_response(outputs: Vec<FileInfo>) -> Response {
        Response {
            status: ExitStatus::Success,
            resource_usage: ResourceUsage::default(),
            status_code: 0,
            signal: 0,
            error_message: String::new(),
            outputs,
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, store) = store();
        let cache = ExecutionCache::open(&store);
        let request = ExecutionRequest::new("sol");
        let key = ExecutionCache::key(&request);
        assert!(cache.get(&key, &store).is_none());
        let response = success_response(vec![]);
        cache.put(key, &response);
        assert_eq!(cache.get(&key, &store), Some(response));
    }

    #[test]
    fn test_persisted_across_reopen() {
        let (_dir, store) = store();
        let key = ExecutionCache::key(&ExecutionRequest::new("sol"));
        {
            let cache = ExecutionCache::open(&store);
            cache.put(key, &success_response(vec![]));
        }
        let cache = ExecutionCache::open(&store);
        assert!(cache.get(&key, &store).is_some());
    }

    #[test]
    fn test_hit_requires_outputs_present() {
        let (_dir, store) = store();
        let cache = ExecutionCache::open(&store);
        let key = ExecutionCache::key(&ExecutionRequest::new("sol"));
        let missing = Digest::of_bytes(b"never stored");
        let response = success_response(vec![
            FileInfo::new("out", FileRole::Output).with_digest(missing)
        ]);
        cache.put(key, &response);
        assert!(cache.get(&key, &store).is_none());

        store.ingest(b"never stored").unwrap();
        assert!(cache.get(&key, &store).is_some());
    }

    #[test]
    fn test_keep_sandbox_does_not_change_key() {
        let mut request = ExecutionRequest::new("sol");
        let key = ExecutionCache::key(&request);
        request.keep_sandbox = true;
        assert_eq!(ExecutionCache::key(&request), key);
        request.args.push("x".into());
        assert_ne!(ExecutionCache::key(&request), key);
    }

    #[test]
    fn test_inline_inputs_hash_like_digest_references() {
        let payload = b"small input";
        let digest = Digest::of_bytes(payload);

        let mut by_digest = ExecutionRequest::new("sol");
        by_digest
            .inputs
            .push(FileInfo::new("in.txt", FileRole::Input).with_digest(digest));

        let mut inline = ExecutionRequest::new("sol");
        inline
            .inputs
            .push(FileInfo::new("in.txt", FileRole::Input).with_contents(&payload[..]));

        let mut inline_with_digest = ExecutionRequest::new("sol");
        inline_with_digest.inputs.push(
            FileInfo::new("in.txt", FileRole::Input)
                .with_digest(digest)
                .with_contents(&payload[..]),
        );

        let key = ExecutionCache::key(&by_digest);
        assert_eq!(ExecutionCache::key(&inline), key);
        assert_eq!(ExecutionCache::key(&inline_with_digest), key);

        let mut other = ExecutionRequest::new("sol");
        other
            .inputs
            .push(FileInfo::new("in.txt", FileRole::Input).with_contents(&b"different"[..]));
        assert_ne!(ExecutionCache::key(&other), key);
    }

    #[test]
    fn test_inline_outputs_do_not_require_store_presence() {
        let (_dir, store) = store();
        let cache = ExecutionCache::open(&store);
        let key = ExecutionCache::key(&ExecutionRequest::new("sol"));
        let contents = b"ok\n".to_vec();
        let response = success_response(vec![FileInfo::new("stdout", FileRole::Stdout)
            .with_digest(Digest::of_bytes(&contents))
            .with_contents(contents)]);
        cache.put(key, &response);
        // The stdout artifact was never ingested, but the inline copy
        // makes the entry replayable.
        assert_eq!(cache.get(&key, &store), Some(response));
    }

    #[test]
    fn test_internal_errors_not_cached() {
        let (_dir, store) = store();
        let cache = ExecutionCache::open(&store);
        let key = ExecutionCache::key(&ExecutionRequest::new("sol"));
        cache.put(key, &Response::internal_error("boom"));
        assert!(cache.get(&key, &store).is_none());
    }
}
