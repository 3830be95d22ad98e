//! Namespaced content-addressable store.
//!
//! Files live at:
//!   {root}/{namespace}/{pathname}/{filename}
//!
//! where (pathname, filename) comes from the store's `PathTransform`. The
//! namespace is a node identity, so several nodes can share one root
//! without seeing each other's files.
//!
//! No locking. Writes to different keys touch disjoint paths; two writes to
//! the same key race and the last one wins.
//!
//! Every write is staged: bytes go to a temporary sibling file which is only
//! renamed onto the key's path by `StagedFile::commit`. A failed or discarded
//! write never shows up in `has`/`read`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use cairn_core::crypto::{self, CipherError, EncryptionKey};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::path::{cas_path_transform, PathKey, PathTransform};

/// Root used when none is configured.
pub const DEFAULT_ROOT: &str = "cairn-network";

#[derive(Clone)]
pub struct StoreOpts {
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
        }
    }
}

/// Content-addressable store rooted at one directory.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };
        Self {
            root,
            path_transform: opts.path_transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The PathKey this store uses for `key`. Recomputed on every call.
    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    /// Absolute location of `key`'s file under `namespace`.
    pub fn file_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(self.path_key(key).full_path())
    }

    /// Existence check. Stats the file, never opens it.
    pub async fn has(&self, namespace: &str, key: &str) -> bool {
        fs::metadata(self.file_path(namespace, key)).await.is_ok()
    }

    /// Copy everything `reader` yields into `key`'s file, replacing any
    /// previous content. Returns the number of bytes written.
    pub async fn write<R>(&self, namespace: &str, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.stage(namespace, key, reader).await?.commit().await
    }

    /// Like `write`, but `reader` yields an IV-prefixed encrypted stream
    /// which is decrypted on the way to disk.
    ///
    /// Returns the number of bytes consumed from `reader`.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &EncryptionKey,
        namespace: &str,
        key: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.stage_decrypt(enc_key, namespace, key, reader)
            .await?
            .commit()
            .await
    }

    /// Copy `reader` into a temporary file next to `key`'s path. Nothing is
    /// visible under `key` until the result is committed.
    pub async fn stage<R>(&self, namespace: &str, key: &str, reader: &mut R) -> Result<StagedFile, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (mut staged, mut file) = self.open_staged(namespace, key).await?;
        let tmp = staged.tmp_path().to_path_buf();

        let n = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.flush().await.map_err(|e| StoreError::io(&tmp, e))?;

        staged.len = n;
        Ok(staged)
    }

    /// `stage`, decrypting an IV-prefixed stream. The staged length is the
    /// number of bytes consumed from `reader`.
    pub async fn stage_decrypt<R>(
        &self,
        enc_key: &EncryptionKey,
        namespace: &str,
        key: &str,
        reader: &mut R,
    ) -> Result<StagedFile, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (mut staged, mut file) = self.open_staged(namespace, key).await?;

        let n = crypto::decrypt_stream(enc_key, reader, &mut file)
            .await
            .map_err(|source| StoreError::Cipher {
                path: staged.dest.clone(),
                source,
            })?;

        staged.len = n;
        Ok(staged)
    }

    /// Open `key` for reading. Returns its size alongside the handle, so
    /// callers can length-prefix network replies.
    pub async fn read(&self, namespace: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.file_path(namespace, key);
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::io(&path, e)
            }
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(&path, e))?
            .len();
        Ok((size, file))
    }

    /// Remove `key` by deleting the whole subtree under its *first* path
    /// segment. Any other key whose path starts with the same segment goes
    /// with it. Deleting an absent key is not an error.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path_key = self.path_key(key);
        let first = self.root.join(namespace).join(path_key.first_path_name());

        remove_tree(&first).await?;
        tracing::debug!(namespace, key, path = %first.display(), "deleted from disk");
        Ok(())
    }

    /// Remove the whole root, every namespace included.
    pub async fn clear(&self) -> Result<(), StoreError> {
        remove_tree(&self.root).await
    }

    async fn open_staged(&self, namespace: &str, key: &str) -> Result<(StagedFile, File), StoreError> {
        let dest = self.file_path(namespace, key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let n = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".partial-{}-{n}", std::process::id()));
        let tmp = dest.with_file_name(name);

        let file = File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        let staged = StagedFile {
            tmp: Some(tmp),
            dest,
            len: 0,
        };
        Ok((staged, file))
    }
}

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

// ── Staged writes ─────────────────────────────────────────────────────────────

/// A fully written temporary file waiting to be moved onto its key.
///
/// Dropping it without `commit` removes the temporary file.
#[derive(Debug)]
pub struct StagedFile {
    tmp: Option<PathBuf>,
    dest: PathBuf,
    len: u64,
}

impl StagedFile {
    /// Bytes consumed from the source reader.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Final location once committed.
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    fn tmp_path(&self) -> &Path {
        self.tmp.as_deref().unwrap_or(&self.dest)
    }

    /// Atomically replace the key's file with the staged content.
    pub async fn commit(mut self) -> Result<u64, StoreError> {
        let Some(tmp) = self.tmp.take() else {
            return Ok(self.len);
        };
        if let Err(e) = fs::rename(&tmp, &self.dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::io(&self.dest, e));
        }
        tracing::debug!(bytes = self.len, path = %self.dest.display(), "wrote to disk");
        Ok(self.len)
    }

    /// Throw the staged content away.
    pub async fn discard(mut self) {
        if let Some(tmp) = self.tmp.take() {
            if let Err(e) = fs::remove_file(&tmp).await {
                tracing::trace!(path = %tmp.display(), error = %e, "failed to remove staged file");
            }
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            let _ = std::fs::remove_file(tmp);
        }
    }
}

async fn remove_tree(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("{}: {source}", .path.display())]
    Cipher {
        path: PathBuf,
        #[source]
        source: CipherError,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
