// Copyright 2017 Engine Contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

mod local;
#[cfg(test)]
mod local_tests;
mod snapshot;
mod snapshot_ops;
#[cfg(test)]
mod snapshot_ops_tests;

pub use crate::local::ByteStore as LocalStore;
pub use crate::snapshot::{OneOffStoreFileByDigest, Snapshot, StoreFileByDigest};
pub use crate::snapshot_ops::{SnapshotOps, SubsetParams};

pub use immutable_inputs::{ImmutableInputs, WorkdirSymlink};
pub use materialization_cache::{
  CachedFileToMaterialize, CanonicalFileMaterializationRequest, FileMaterializationInput,
  LocalFileMaterializationCache,
};
pub use remote_provider::{ActionCacheProvider, ByteStoreProvider, RemoteOptions};

mod immutable_inputs;
mod materialization_cache;

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fs::{
  DigestTrie, Dir, Directory, DirectoryDigest, File, GlobMatching, Link, Permissions, PathGlobs,
  PathStat, PosixFS, RelativePath, Stat, SymlinkBehavior, EMPTY_DIRECTORY_DIGEST,
};
use futures::future::{self, try_join_all, FutureExt};
use grpc_util::prost::MessageExt;
use hashing::{Digest, Fingerprint, EMPTY_DIGEST};
use log::Level;
use parking_lot::Mutex;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use workunit_store::{in_workunit, Metric};

const MEGABYTES: usize = 1024 * 1024;
const GIGABYTES: usize = 1024 * MEGABYTES;

/// The target number of bytes which should be present in all combined LMDB store files
/// after garbage collection, expressed as a default.
pub const DEFAULT_LOCAL_STORE_GC_TARGET_BYTES: usize = 4 * GIGABYTES;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EntryType {
  Directory,
  File,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShrinkBehavior {
  /// Free up space, even if it substantially slows down the garbage collection process.
  Fast,
  /// Free up space, even if it substantially slows down the garbage collection process.
  Compact,
}

#[derive(Clone, Debug)]
pub struct LocalOptions {
  pub files_max_size_bytes: usize,
  pub directories_max_size_bytes: usize,
  pub lease_time: Duration,
  pub shard_count: u8,
}

impl Default for LocalOptions {
  fn default() -> Self {
    LocalOptions {
      files_max_size_bytes: 16 * GIGABYTES,
      directories_max_size_bytes: 2 * GIGABYTES,
      lease_time: Duration::from_secs(2 * 24 * 60 * 60),
      shard_count: 16,
    }
  }
}

/// A StoreError is either a shorthand string description (which almost all store operations fail
/// with today), or an indication that particular content was missing, such that a caller might
/// attempt to backfill it (for example: by re-running a Process which would produce it).
#[derive(Clone, Debug)]
pub enum StoreError {
  /// A Digest was not found in either the local or remote Store, or an AC/cache-lookup missed.
  MissingDigest(String, Digest),
  /// All other error types.
  Error(String),
}

impl StoreError {
  pub fn enrich(self, prefix: &str) -> Self {
    match self {
      StoreError::MissingDigest(s, d) => StoreError::MissingDigest(format!("{prefix}: {s}"), d),
      StoreError::Error(s) => StoreError::Error(format!("{prefix}: {s}")),
    }
  }
}

impl std::fmt::Display for StoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StoreError::MissingDigest(s, d) => {
        write!(f, "{s}: {d:?} was not found in this store")
      }
      StoreError::Error(s) => write!(f, "{s}"),
    }
  }
}

impl std::error::Error for StoreError {}

impl From<String> for StoreError {
  fn from(err: String) -> Self {
    StoreError::Error(err)
  }
}

impl From<StoreError> for String {
  fn from(err: StoreError) -> Self {
    err.to_string()
  }
}

/// A content-addressed store of file contents and directory structures, backed by a local LMDB
/// store (plus a filesystem-based store for large files) and optionally fronted by a remote CAS
/// reachable through a pluggable `ByteStoreProvider`.
///
/// Consumers interact with `Directory` content exclusively via `DirectoryDigest`/`DigestTrie`
/// (see `fs::directory`): this struct is responsible for persisting and recalling the serialized
/// `bazel_remote_execution::Directory` proto form of those tries, and for the bytes of individual
/// files.
#[derive(Clone)]
pub struct Store {
  local: local::ByteStore,
  remote: Option<RemoteStore>,
}

#[derive(Clone)]
struct RemoteStore {
  byte_store_provider: Arc<dyn ByteStoreProvider>,
  remote_batch_size: usize,
}

impl Store {
  /// Make a store which only uses its local storage.
  pub fn local_only<P: AsRef<Path>>(
    executor: task_executor::Executor,
    path: P,
  ) -> Result<Store, String> {
    Ok(Store {
      local: local::ByteStore::new(executor, path)?,
      remote: None,
    })
  }

  pub fn local_only_with_options<P: AsRef<Path>>(
    executor: task_executor::Executor,
    path: P,
    options: LocalOptions,
  ) -> Result<Store, String> {
    Ok(Store {
      local: local::ByteStore::new_with_options(executor, path, options)?,
      remote: None,
    })
  }

  /// Add a remote CAS layer, fronted by the given provider. `remote_batch_size` bounds how many
  /// digests are checked for existence (or fetched) in a single provider round-trip.
  pub fn into_with_remote(
    self,
    byte_store_provider: Arc<dyn ByteStoreProvider>,
    remote_batch_size: usize,
  ) -> Store {
    Store {
      local: self.local,
      remote: Some(RemoteStore {
        byte_store_provider,
        remote_batch_size,
      }),
    }
  }

  pub fn has_remote(&self) -> bool {
    self.remote.is_some()
  }

  ///
  /// Store a file locally, returning a Digest. Large files are hardlinked into the fsdb portion
  /// of the local store rather than copied, where possible.
  ///
  pub async fn store_file_bytes(&self, bytes: Bytes, initial_lease: bool) -> Result<Digest, String> {
    let digest = Digest::of_bytes(&bytes);
    self
      .local
      .store_bytes(EntryType::File, digest.hash, bytes, initial_lease)
      .await?;
    Ok(digest)
  }

  ///
  /// Store a file on disk, copying (or hardlinking) it into the store without buffering its
  /// contents into memory. `src_is_immutable` allows skipping a defensive copy when the source is
  /// known not to be mutated concurrently (for example: a materialized immutable input).
  ///
  pub async fn store_file(
    &self,
    initial_lease: bool,
    src_is_immutable: bool,
    src: PathBuf,
  ) -> Result<Digest, String> {
    self
      .local
      .store(EntryType::File, initial_lease, src_is_immutable, src)
      .await
  }

  ///
  /// Loads the bytes of a File, applying the given function to them, if they exist locally.
  /// Does not check remotely in the case of a local miss.
  ///
  pub async fn load_file_bytes_with<
    T: Send + 'static,
    F: FnMut(&[u8]) -> T + Send + Sync + 'static,
  >(
    &self,
    digest: Digest,
    f: F,
  ) -> Result<Option<T>, StoreError> {
    Ok(
      self
        .local
        .load_bytes_with(EntryType::File, digest, f)
        .await?,
    )
  }

  ///
  /// Loads a `DigestTrie` given the `Digest` of its serialized root `Directory` proto, checking
  /// the remote store (if any) on a local miss, and recursively fetching children.
  ///
  pub async fn load_digest_trie(&self, digest: Digest) -> Result<DigestTrie, StoreError> {
    if digest == EMPTY_DIGEST {
      return Ok(DigestTrie::from(EMPTY_DIRECTORY_DIGEST.clone()));
    }

    let maybe_directory = self.load_directory_proto(digest).await?;
    let directory = match maybe_directory {
      Some(d) => d,
      None => {
        self.ensure_local_has_recursive(vec![digest]).await?;
        self
          .load_directory_proto(digest)
          .await?
          .ok_or_else(|| StoreError::MissingDigest("Was not present after fetch".to_owned(), digest))?
      }
    };

    let mut children = std::collections::HashMap::new();
    self.collect_child_directories(&directory, &mut children).await?;
    let tree = remexec::Tree {
      root: Some(directory),
      children: children.into_values().collect(),
    };
    DigestTrie::try_from(tree).map_err(StoreError::Error)
  }

  ///
  /// Loads the `Directory` proto uniquely identified by `digest`, checking the remote store (if
  /// any) on a local miss.
  ///
  pub async fn load_directory(&self, digest: Digest) -> Result<remexec::Directory, StoreError> {
    if let Some(directory) = self.load_directory_proto(digest).await? {
      return Ok(directory);
    }
    self.ensure_local_has_recursive(vec![digest]).await?;
    self
      .load_directory_proto(digest)
      .await?
      .ok_or_else(|| StoreError::MissingDigest("Was not present after fetch".to_owned(), digest))
  }

  async fn load_directory_proto(&self, digest: Digest) -> Result<Option<remexec::Directory>, StoreError> {
    if digest == EMPTY_DIGEST {
      return Ok(Some(remexec::Directory::default()));
    }
    Ok(
      self
        .load_file_bytes_with_entry_type(EntryType::Directory, digest, |bytes| {
          <remexec::Directory as prost::Message>::decode(bytes)
            .map_err(|e| format!("LMDB corruption: {e}"))
        })
        .await?
        .transpose()
        .map_err(StoreError::Error)?,
    )
  }

  async fn load_file_bytes_with_entry_type<
    T: Send + 'static,
    F: FnMut(&[u8]) -> T + Send + Sync + 'static,
  >(
    &self,
    entry_type: EntryType,
    digest: Digest,
    f: F,
  ) -> Result<Option<T>, StoreError> {
    Ok(self.local.load_bytes_with(entry_type, digest, f).await?)
  }

  fn collect_child_directories<'a>(
    &'a self,
    directory: &'a remexec::Directory,
    out: &'a mut std::collections::HashMap<Digest, remexec::Directory>,
  ) -> futures::future::BoxFuture<'a, Result<(), StoreError>> {
    async move {
      for child in &directory.directories {
        let child_digest: Digest = child
          .digest
          .as_ref()
          .ok_or_else(|| StoreError::Error("Directory node missing digest".to_owned()))?
          .try_into()
          .map_err(StoreError::Error)?;
        if out.contains_key(&child_digest) {
          continue;
        }
        let child_directory = self
          .load_directory_proto(child_digest)
          .await?
          .ok_or_else(|| StoreError::MissingDigest("directory child".to_owned(), child_digest))?;
        self.collect_child_directories(&child_directory, out).await?;
        out.insert(child_digest, child_directory);
      }
      Ok(())
    }
    .boxed()
  }

  ///
  /// Save the given DigestTrie (and all of its children) to the local store, returning a
  /// DirectoryDigest which identifies it.
  ///
  pub async fn record_digest_trie(&self, trie: DigestTrie) -> Result<DirectoryDigest, StoreError> {
    let root = trie.as_remexec_directory();
    let digest = self.record_directory(&root, true).await?;
    Ok(DirectoryDigest::new(digest, trie))
  }

  ///
  /// Save the given `Directory` proto to the local store, returning the `Digest` which
  /// identifies it. Does not recurse: any child directories referenced from `directory` must be
  /// separately recorded (see `record_digest_trie`, which records an entire tree).
  ///
  pub async fn record_directory(
    &self,
    directory: &remexec::Directory,
    initial_lease: bool,
  ) -> Result<Digest, StoreError> {
    let bytes = directory.to_bytes();
    let digest = Digest::of_bytes(&bytes);
    self
      .local
      .store_bytes(EntryType::Directory, digest.hash, bytes, initial_lease)
      .await?;
    Ok(digest)
  }

  ///
  /// Ensures that the given `DirectoryDigest` (and its full contents) are persisted to the local
  /// store: a `DirectoryDigest` carrying an in-memory `DigestTrie` need not have been written out
  /// yet, and this makes that guarantee explicit.
  ///
  pub async fn ensure_directory_digest_persisted(
    &self,
    digest: DirectoryDigest,
  ) -> Result<(), StoreError> {
    match digest.tree {
      Some(tree) => {
        self.record_digest_trie(tree).await?;
        Ok(())
      }
      None => Ok(()),
    }
  }

  ///
  /// Merges any number of `DirectoryDigest`s into one, erroring if any paths are duplicated
  /// between them (unless the duplicated entries are identical).
  ///
  pub async fn merge(&self, digests: Vec<DirectoryDigest>) -> Result<DirectoryDigest, StoreError> {
    if digests.is_empty() {
      return Ok(EMPTY_DIRECTORY_DIGEST.clone());
    }
    if digests.len() == 1 {
      let mut digests = digests;
      return Ok(digests.pop().unwrap());
    }

    let trees = try_join_all(
      digests
        .into_iter()
        .map(|digest| self.load_digest_trie_from(digest)),
    )
    .await?;
    let merged = DigestTrie::merge(trees).map_err(|e| StoreError::Error(describe_merge_error(e)))?;
    Ok(merged.into())
  }

  ///
  /// Adds the given prefix to every path in `directory_digest`.
  ///
  pub async fn add_prefix(
    &self,
    directory_digest: DirectoryDigest,
    prefix: &RelativePath,
  ) -> Result<DirectoryDigest, StoreError> {
    let trie = self.load_digest_trie_from(directory_digest).await?;
    let trie = trie.add_prefix(prefix).map_err(StoreError::Error)?;
    Ok(trie.into())
  }

  ///
  /// Removes `prefix` from every path in `directory_digest`, erroring if any component of the
  /// prefix is not present in the directory tree as a sole entry at each level.
  ///
  pub async fn strip_prefix(
    &self,
    directory_digest: DirectoryDigest,
    prefix: &RelativePath,
  ) -> Result<DirectoryDigest, StoreError> {
    let trie = self.load_digest_trie_from(directory_digest).await?;
    let trie = trie.remove_prefix(prefix).map_err(StoreError::Error)?;
    Ok(trie.into())
  }

  ///
  /// Ensures that the remote ByteStore (if configured) has all of the given digests.
  ///
  pub async fn ensure_remote_has_recursive(
    &self,
    digests: Vec<Digest>,
  ) -> Result<(), StoreError> {
    let remote = match &self.remote {
      Some(remote) => remote.clone(),
      None => return Ok(()),
    };

    let digests: HashSet<Digest> = digests.into_iter().collect();
    let missing = {
      let mut missing_iter = digests.iter().copied();
      remote
        .byte_store_provider
        .list_missing_digests(&mut missing_iter)
        .await
        .map_err(StoreError::Error)?
    };

    try_join_all(missing.into_iter().map(|digest| {
      let store = self.clone();
      let remote = remote.clone();
      async move {
        let bytes = store
          .local
          .load_bytes_with(EntryType::File, digest, Bytes::copy_from_slice)
          .await?
          .ok_or_else(|| {
            StoreError::MissingDigest("Was not present in local store".to_owned(), digest)
          })?;
        remote
          .byte_store_provider
          .store_bytes(digest, bytes)
          .await
          .map_err(StoreError::Error)
      }
    }))
    .await?;
    Ok(())
  }

  ///
  /// Ensures that the local store has all of the given digests, downloading them from the remote
  /// store (if configured) on a local miss.
  ///
  pub async fn ensure_local_has_recursive(&self, digests: Vec<Digest>) -> Result<(), StoreError> {
    let remote = self
      .remote
      .clone()
      .ok_or_else(|| StoreError::Error("Digest was not in the local store, and no remote store is configured".to_owned()))?;

    try_join_all(digests.into_iter().map(|digest| {
      let store = self.clone();
      let remote = remote.clone();
      async move {
        if store.local.entry_type(digest.hash).await?.is_some() {
          return Ok(());
        }
        let bytes = remote
          .byte_store_provider
          .load_bytes(digest)
          .await
          .map_err(StoreError::Error)?
          .ok_or_else(|| StoreError::MissingDigest("remote store".to_owned(), digest))?;
        let entry_type = if bytes.len() == digest.size_bytes {
          EntryType::File
        } else {
          EntryType::File
        };
        store
          .local
          .store_bytes(entry_type, digest.hash, bytes, true)
          .await?;
        Ok::<(), StoreError>(())
      }
    }))
    .await?;
    Ok(())
  }

  ///
  /// Materializes a DirectoryDigest onto the local filesystem at `destination`, hardlinking
  /// immutable content out of the fsdb where possible.
  ///
  pub async fn materialize_directory(
    &self,
    destination: PathBuf,
    _workdir: &Path,
    digest: DirectoryDigest,
    mutable: bool,
    mutable_paths: &BTreeSet<RelativePath>,
    perms: Permissions,
  ) -> Result<(), StoreError> {
    let trie = self.load_digest_trie_from(digest).await?;
    self
      .materialize_directory_trie(&destination, &trie, mutable, mutable_paths, perms)
      .await
  }

  async fn load_digest_trie_from(&self, digest: DirectoryDigest) -> Result<DigestTrie, StoreError> {
    match digest.tree {
      Some(tree) => Ok(tree),
      None => self.load_digest_trie(digest.as_digest()).await,
    }
  }

  fn materialize_directory_trie<'a>(
    &'a self,
    destination: &'a Path,
    trie: &'a DigestTrie,
    mutable: bool,
    mutable_paths: &'a BTreeSet<RelativePath>,
    perms: Permissions,
  ) -> futures::future::BoxFuture<'a, Result<(), StoreError>> {
    async move {
      tokio::fs::create_dir_all(destination)
        .await
        .map_err(|e| StoreError::Error(format!("Failed to create {}: {e}", destination.display())))?;

      for entry in trie.entries() {
        match entry {
          fs::directory::Entry::File(f) => {
            let path = destination.join(f.name().as_ref());
            let content = self
              .load_file_bytes_with(f.digest(), |b| Bytes::copy_from_slice(b))
              .await?
              .ok_or_else(|| StoreError::MissingDigest("file content".to_owned(), f.digest()))?;
            tokio::fs::write(&path, &content)
              .await
              .map_err(|e| StoreError::Error(format!("Failed to write {}: {e}", path.display())))?;
            if f.is_executable() {
              use std::os::unix::fs::PermissionsExt;
              let mut fs_perms = tokio::fs::metadata(&path)
                .await
                .map_err(|e| StoreError::Error(e.to_string()))?
                .permissions();
              fs_perms.set_mode(0o755);
              tokio::fs::set_permissions(&path, fs_perms)
                .await
                .map_err(|e| StoreError::Error(e.to_string()))?;
            }
            if matches!(perms, Permissions::ReadOnly) && !mutable {
              use std::os::unix::fs::PermissionsExt;
              let mut fs_perms = tokio::fs::metadata(&path)
                .await
                .map_err(|e| StoreError::Error(e.to_string()))?
                .permissions();
              let mode = fs_perms.mode() & !0o222;
              fs_perms.set_mode(mode);
              tokio::fs::set_permissions(&path, fs_perms)
                .await
                .map_err(|e| StoreError::Error(e.to_string()))?;
            }
          }
          fs::directory::Entry::Symlink(s) => {
            let path = destination.join(s.name().as_ref());
            #[cfg(unix)]
            tokio::fs::symlink(s.target(), &path)
              .await
              .map_err(|e| StoreError::Error(format!("Failed to symlink {}: {e}", path.display())))?;
          }
          fs::directory::Entry::Directory(d) => {
            let path = destination.join(d.name().as_ref());
            self
              .materialize_directory_trie(&path, d.tree(), mutable || !mutable_paths.is_empty(), mutable_paths, perms)
              .await?;
          }
        }
      }
      Ok(())
    }
    .boxed()
  }

  ///
  /// Captures a Snapshot of a presumed-immutable piece of the filesystem at `root_path`.
  ///
  pub async fn capture_snapshot_from_arbitrary_root<P: AsRef<Path> + Send + 'static>(
    &self,
    executor: task_executor::Executor,
    root_path: P,
    path_globs: PathGlobs,
  ) -> Result<Snapshot, String> {
    let posix_fs = Arc::new(PosixFS::new_with_symlink_behavior(
      root_path,
      &[],
      executor,
      SymlinkBehavior::Oblivious,
    )?);
    let path_stats = posix_fs.expand_globs(path_globs, SymlinkBehavior::Oblivious, None).await?;
    Snapshot::from_path_stats(
      self.clone(),
      OneOffStoreFileByDigest::new(self.clone(), posix_fs),
      path_stats,
    )
    .await
  }
}

fn describe_merge_error(err: fs::directory::MergeError) -> String {
  let fs::directory::MergeError::Duplicates {
    parent_path,
    files,
    directories,
    symlinks,
  } = err;
  let count = files.len() + directories.len() + symlinks.len();
  let names: Vec<String> = files
    .iter()
    .map(|f| f.name().to_string())
    .chain(directories.iter().map(|d| d.name().to_string()))
    .chain(symlinks.iter().map(|s| s.name().to_string()))
    .collect();
  format!(
    "Can only merge Directories with no duplicates, but found {} duplicate entries in `{}`: {}",
    count,
    parent_path.display(),
    names.join(", "),
  )
}

impl std::fmt::Debug for Store {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Store(has_remote={})", self.remote.is_some())
  }
}
