//! Content-addressed file store.
//!
//! Artifacts are immutable byte sequences stored at
//! `<root>/<aa>/<bb>/<hex>` where `aa` and `bb` are the first two bytes of
//! the lowercase hex digest. Every write goes through a uniquely named
//! temporary file next to its destination and becomes visible with an
//! atomic link/rename, so a reader that observes a path always observes a
//! complete, correctly hashed file.

pub mod digest;

pub use digest::{Digest, DigestHasher};

use std::fs::{self, File, Permissions};
use std::io::{Read as _, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::{Builder, NamedTempFile, TempDir};
use thiserror::Error;

/// Preferred size of a streamed chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} already exists")]
    Exists(PathBuf),
    #[error("{0} not found")]
    NotFound(PathBuf),
    #[error("{path}: expected digest {expected}, found {actual}")]
    Corrupt {
        path: PathBuf,
        expected: Digest,
        actual: Digest,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => Self::Exists(path.to_path_buf()),
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Ensures every prefix of `path` exists. Idempotent.
pub fn make_dirs(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| StoreError::io(path, e))
}

/// Marks the file runnable (and readable) by its owner only.
pub fn make_executable(path: &Path) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(0o500)).map_err(|e| StoreError::io(path, e))
}

/// Marks the file read-only.
pub fn make_immutable(path: &Path) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(0o400)).map_err(|e| StoreError::io(path, e))
}

/// File size, or `None` when the path does not name a readable file.
pub fn size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Lazy chunk sequence over a file's bytes.
pub struct ChunkReader {
    file: File,
    path: PathBuf,
    done: bool,
}

impl Iterator for ChunkReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        match self.file.read(&mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => self.next(),
            Err(e) => {
                self.done = true;
                Some(Err(StoreError::io(&self.path, e)))
            }
        }
    }
}

/// Opens `path` for chunked reading.
pub fn read(path: &Path) -> Result<ChunkReader> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    Ok(ChunkReader {
        file,
        path: path.to_path_buf(),
        done: false,
    })
}

enum WriterState {
    Active {
        temp: NamedTempFile,
        dest: PathBuf,
        overwrite: bool,
        exist_ok: bool,
    },
    /// The destination already existed and `exist_ok` was set; chunks are
    /// accepted and dropped.
    Discard,
    Finished,
}

/// Chunk sink writing to a temporary file that is atomically moved into
/// place on finalization.
///
/// A zero-length chunk (or [`ChunkWriter::finish`]) finalizes the write:
/// the temporary is fsynced and linked/renamed onto the destination.
/// Dropping an unfinalized writer rolls the write back.
pub struct ChunkWriter {
    state: WriterState,
}

impl ChunkWriter {
    /// Appends a chunk; an empty chunk finalizes the file.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return self.finalize();
        }
        match &mut self.state {
            WriterState::Active { temp, dest, .. } => temp
                .as_file_mut()
                .write_all(chunk)
                .map_err(|e| StoreError::io(dest, e)),
            WriterState::Discard | WriterState::Finished => Ok(()),
        }
    }

    /// Finalizes the file if a zero-length chunk has not done so already.
    pub fn finish(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, WriterState::Finished);
        let WriterState::Active {
            temp,
            dest,
            overwrite,
            exist_ok,
        } = state
        else {
            return Ok(());
        };
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(&dest, e))?;
        let result = if overwrite {
            temp.persist(&dest).map(|_| ())
        } else {
            temp.persist_noclobber(&dest).map(|_| ())
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost a race against a concurrent writer of the same path;
                // the temporary is discarded.
                if exist_ok {
                    Ok(())
                } else {
                    Err(StoreError::Exists(dest))
                }
            }
            Err(e) => Err(StoreError::io(&dest, e.error)),
        }
    }
}

/// Opens a chunk sink for `path`.
///
/// If the destination exists: with `overwrite` the finished temporary
/// replaces it; otherwise with `exist_ok` the write is silently discarded;
/// otherwise the call fails with [`StoreError::Exists`].
pub fn write(path: &Path, overwrite: bool, exist_ok: bool) -> Result<ChunkWriter> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    make_dirs(parent)?;
    if !overwrite && size(path).is_some() {
        if exist_ok {
            return Ok(ChunkWriter {
                state: WriterState::Discard,
            });
        }
        return Err(StoreError::Exists(path.to_path_buf()));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = Builder::new()
        .prefix(&format!("{}.", name))
        .rand_bytes(6)
        .tempfile_in(parent)
        .map_err(|e| StoreError::io(path, e))?;
    Ok(ChunkWriter {
        state: WriterState::Active {
            temp,
            dest: path.to_path_buf(),
            overwrite,
            exist_ok,
        },
    })
}

/// Writes a full byte sequence through the chunked sink.
pub fn write_bytes(path: &Path, bytes: &[u8], overwrite: bool, exist_ok: bool) -> Result<()> {
    let mut sink = write(path, overwrite, exist_ok)?;
    for chunk in bytes.chunks(CHUNK_SIZE) {
        sink.push(chunk)?;
    }
    sink.finish()
}

/// Reads a whole file through the chunked reader.
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for chunk in read(path)? {
        bytes.extend_from_slice(&chunk?);
    }
    Ok(bytes)
}

fn copy_contents(src: &Path, dst: &Path, overwrite: bool, exist_ok: bool) -> Result<()> {
    let mut sink = write(dst, overwrite, exist_ok)?;
    for chunk in read(src)? {
        sink.push(&chunk?)?;
    }
    sink.finish()
}

/// Copies `src` to `dst`, preferring a hardlink for zero-cost
/// deduplication and falling back to a bytewise copy when the source is a
/// symlink or the link fails (cross-device, permissions, ...).
pub fn copy(src: &Path, dst: &Path, overwrite: bool, exist_ok: bool) -> Result<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    make_dirs(parent)?;
    if !is_symlink(src) {
        match fs::hard_link(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if exist_ok {
                    return Ok(());
                }
                if !overwrite {
                    return Err(StoreError::Exists(dst.to_path_buf()));
                }
                fs::remove_file(dst).map_err(|e| StoreError::io(dst, e))?;
                if fs::hard_link(src, dst).is_ok() {
                    return Ok(());
                }
            }
            Err(_) => {}
        }
    }
    copy_contents(src, dst, overwrite, exist_ok)
}

/// Moves `src` to `dst`, using an atomic rename/link first and a
/// copy-and-remove otherwise. On success `src` no longer exists.
pub fn move_file(src: &Path, dst: &Path, overwrite: bool, exist_ok: bool) -> Result<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    make_dirs(parent)?;
    if !is_symlink(src) {
        if overwrite {
            if fs::rename(src, dst).is_ok() {
                return Ok(());
            }
        } else {
            match fs::hard_link(src, dst) {
                Ok(()) => return remove(src),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if exist_ok {
                        return remove(src);
                    }
                    return Err(StoreError::Exists(dst.to_path_buf()));
                }
                Err(_) => {}
            }
        }
    }
    copy_contents(src, dst, overwrite, exist_ok)?;
    remove(src)
}

pub fn remove(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(|e| StoreError::io(path, e))
}

/// Streams the file through the digest hasher.
pub fn hash(path: &Path) -> Result<Digest> {
    let mut hasher = DigestHasher::new();
    for chunk in read(path)? {
        hasher.update(&chunk?);
    }
    Ok(hasher.finalize())
}

/// Recursively enumerates regular files under `path`, ordered by access
/// time ascending. Used for LRU-style cleanup by external collaborators.
pub fn list_files(path: &Path) -> Result<Vec<PathBuf>> {
    make_dirs(path)?;
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    collect_files(path, &mut files)?;
    files.sort();
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

fn collect_files(dir: &Path, out: &mut Vec<(SystemTime, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| StoreError::io(&path, e))?;
        if metadata.is_dir() {
            collect_files(&path, out)?;
        } else if metadata.is_file() {
            let accessed = metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((accessed, path));
        }
    }
    Ok(())
}

/// Creates a fresh uniquely-named subdirectory of `base`.
///
/// The directory and everything under it is removed when the returned
/// guard is dropped, unless [`TempDir::keep`] is called.
pub fn temp_dir(base: &Path) -> Result<TempDir> {
    make_dirs(base)?;
    Builder::new()
        .prefix("")
        .rand_bytes(6)
        .tempdir_in(base)
        .map_err(|e| StoreError::io(base, e))
}

/// Handle on a content-addressed store root.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        make_dirs(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sharded path for a digest: `<root>/<aa>/<bb>/<hex>`.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        size(&self.path_for(digest)).is_some()
    }

    /// Stores a byte sequence, returning its digest. Idempotent.
    pub fn ingest(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        write_bytes(&self.path_for(&digest), bytes, false, true)?;
        Ok(digest)
    }

    /// Hashes an external file and copies it into the store.
    pub fn ingest_file(&self, path: &Path) -> Result<Digest> {
        let digest = hash(path)?;
        copy(path, &self.path_for(&digest), false, true)?;
        Ok(digest)
    }

    pub fn open(&self, digest: &Digest) -> Result<ChunkReader> {
        read(&self.path_for(digest))
    }

    pub fn read_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        read_bytes(&self.path_for(digest))
    }

    /// Copies the artifact out of the store (hardlink-preferring).
    pub fn materialize(&self, digest: &Digest, dst: &Path) -> Result<()> {
        copy(&self.path_for(digest), dst, false, false)
    }

    /// Re-hashes a stored artifact, failing with [`StoreError::Corrupt`] on
    /// mismatch.
    pub fn verify(&self, digest: &Digest) -> Result<()> {
        let path = self.path_for(digest);
        let actual = hash(&path)?;
        if actual != *digest {
            return Err(StoreError::Corrupt {
                path,
                expected: *digest,
                actual,
            });
        }
        Ok(())
    }
}
