// Copyright 2017 Engine Contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be
// copied and pasted across crates, but there doesn't appear to be a way to include inner
// attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

pub mod bounded;
pub mod cache;
#[cfg(test)]
mod cache_tests;
pub mod fork_exec;
pub mod local;
#[cfg(test)]
mod local_tests;
pub mod named_caches;
#[cfg(test)]
mod named_caches_tests;
pub mod remote;
pub mod remote_cache;
pub mod switched;
#[cfg(test)]
mod test_utils;
pub mod workspace;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs::{DirectoryDigest, RelativePath, EMPTY_DIRECTORY_DIGEST};
use hashing::Digest;
use store::StoreError;
use workunit_store::{Level, RunId, RunningWorkunit, WorkunitStore};

pub use children::ManagedChild;
pub use named_caches::NamedCaches;
pub use store::{ImmutableInputs, WorkdirSymlink};

/// The field name used to indicate which concurrency slot a process has been assigned, so
/// that the process can avoid colliding with its siblings (e.g. by choosing a port to bind).
pub const CONCURRENCY_ENV_VAR_NAME: &str = "ENGINE_CONCURRENCY";

/// A platform that a process can run on, or be constrained to run on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Platform {
    Macos_x86_64,
    Macos_arm64,
    Linux_x86_64,
    Linux_arm64,
}

impl Platform {
    pub fn current() -> Result<Platform, String> {
        let arch = std::env::consts::ARCH;
        match std::env::consts::OS {
            "macos" if arch == "aarch64" => Ok(Platform::Macos_arm64),
            "macos" => Ok(Platform::Macos_x86_64),
            "linux" if arch == "aarch64" => Ok(Platform::Linux_arm64),
            "linux" => Ok(Platform::Linux_x86_64),
            other => Err(format!("Unknown platform: {other}")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Macos_x86_64 => "macos_x86_64",
            Platform::Macos_arm64 => "macos_arm64",
            Platform::Linux_x86_64 => "linux_x86_64",
            Platform::Linux_arm64 => "linux_arm64",
        };
        write!(f, "{s}")
    }
}

/// The scope at which a process's result may be cached: only `Always` and `Successful` persist
/// across sessions; `PerSession` is visible only to the in-memory per-session memo; `Never`
/// bypasses caching entirely.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessCacheScope {
    /// Cached in all caches, regardless of success or failure.
    Always,
    /// Cached in all caches, but only if the process exits with exit code 0.
    Successful,
    /// Cached only for the lifetime of the local in-memory session; never written to a
    /// persistent cache.
    PerSession,
    /// Like `Always`, but invalidated at the start of a new Session (e.g. a daemon restart).
    PerRestartAlways,
    /// Like `Successful`, but invalidated at the start of a new Session.
    PerRestartSuccessful,
    /// Never cached anywhere; always re-executed.
    Never,
}

/// Input digests for a process: the complete merged input tree, the "raw" (non-immutable)
/// subset, and any immutable inputs mounted at fixed paths (these are deduplicated and shared
/// across sandboxes rather than copied into each one).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct InputDigests {
    /// All inputs, as will be materialized into a sandbox: `inputs` merged with the digests of
    /// `immutable_inputs`.
    pub complete: DirectoryDigest,
    /// The non-immutable inputs.
    pub inputs: DirectoryDigest,
    /// Immutable inputs, mounted read-only at the given relative paths and shared by content
    /// hash across concurrent sandboxes rather than copied.
    pub immutable_inputs: BTreeMap<RelativePath, DirectoryDigest>,
}

impl InputDigests {
    pub async fn new(
        store: &store::Store,
        inputs: DirectoryDigest,
        immutable_inputs: BTreeMap<RelativePath, DirectoryDigest>,
    ) -> Result<Self, StoreError> {
        let complete = store
            .merge(
                std::iter::once(inputs.clone())
                    .chain(immutable_inputs.values().cloned())
                    .collect(),
            )
            .await?;
        Ok(Self {
            complete,
            inputs,
            immutable_inputs,
        })
    }

    pub fn with_input_digest(input_digest: DirectoryDigest) -> Self {
        Self {
            complete: input_digest.clone(),
            inputs: input_digest,
            immutable_inputs: BTreeMap::new(),
        }
    }
}

/// The strategy used to execute a Process. The engine itself only ever runs processes locally,
/// in a hermetic sandbox; remote dispatch of the subprocess itself is a concern for a
/// collaborating system built on top of this API, not the core.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ProcessExecutionStrategy {
    Local,
}

impl ProcessExecutionStrategy {
    pub fn strategy_type(&self) -> &str {
        match self {
            ProcessExecutionStrategy::Local => "local",
        }
    }
}

/// The environment a process is requesting to run in, independent of where it actually lands.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ProcessExecutionEnvironment {
    pub name: Option<String>,
    pub platform: Platform,
    pub strategy: ProcessExecutionStrategy,
}

/// How many execution slots (e.g. cores) a process would like to occupy.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProcessConcurrency {
    Exclusive,
    Available { min: usize, max: usize },
}

/// A request to run a subprocess hermetically in a sandbox. Everything except `description` is
/// part of the request's fingerprint (see `EntireExecuteProcessRequest` in `cache.rs`).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Process {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<RelativePath>,
    pub input_digests: InputDigests,
    pub output_files: BTreeSet<RelativePath>,
    pub output_directories: BTreeSet<RelativePath>,
    pub timeout: Option<Duration>,
    /// If set, an environment variable of this name is populated with the concurrency slot
    /// assigned to this process (see `ProcessConcurrency`).
    pub execution_slot_variable: Option<String>,
    pub concurrency_available: ProcessConcurrency,
    pub description: String,
    pub level: Level,
    /// Named, append-only caches mounted outside of the sandbox.
    pub append_only_caches: BTreeMap<String, RelativePath>,
    pub jdk_home: Option<PathBuf>,
    pub execution_environment: ProcessExecutionEnvironment,
    pub cache_scope: ProcessCacheScope,
}

impl Process {
    pub fn new(argv: Vec<String>) -> Process {
        Process {
            argv,
            env: BTreeMap::new(),
            working_directory: None,
            input_digests: InputDigests {
                complete: EMPTY_DIRECTORY_DIGEST.clone(),
                inputs: EMPTY_DIRECTORY_DIGEST.clone(),
                immutable_inputs: BTreeMap::new(),
            },
            output_files: BTreeSet::new(),
            output_directories: BTreeSet::new(),
            timeout: None,
            execution_slot_variable: None,
            concurrency_available: ProcessConcurrency::Exclusive,
            description: String::new(),
            level: Level::Info,
            append_only_caches: BTreeMap::new(),
            jdk_home: None,
            execution_environment: ProcessExecutionEnvironment {
                name: None,
                platform: Platform::current().unwrap_or(Platform::Linux_x86_64),
                strategy: ProcessExecutionStrategy::Local,
            },
            cache_scope: ProcessCacheScope::Successful,
        }
    }

    pub fn working_directory(mut self, working_directory: Option<RelativePath>) -> Process {
        self.working_directory = working_directory;
        self
    }

    pub fn output_files(mut self, output_files: BTreeSet<RelativePath>) -> Process {
        self.output_files = output_files;
        self
    }

    pub fn output_directories(mut self, output_directories: BTreeSet<RelativePath>) -> Process {
        self.output_directories = output_directories;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Process {
        self.timeout = timeout;
        self
    }

    pub fn description(mut self, description: String) -> Process {
        self.description = description;
        self
    }

    pub fn append_only_caches(mut self, caches: BTreeMap<String, RelativePath>) -> Process {
        self.append_only_caches = caches;
        self
    }

    pub fn cache_scope(mut self, cache_scope: ProcessCacheScope) -> Process {
        self.cache_scope = cache_scope;
        self
    }
}

/// Metadata describing how to reach a remote execution/cache backend, threaded through the
/// command runners that need it without being part of a Process's own identity.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProcessMetadata {
    pub instance_name: Option<String>,
    pub cache_key_gen_version: Option<String>,
    pub append_only_caches_base_path: Option<String>,
}

/// Where a ProcessResult actually came from: useful for progress reporting and tests that
/// assert a process cache hit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessResultSource {
    Ran,
    HitLocally,
    HitRemotely,
    RanRemotely,
}

impl ProcessResultSource {
    pub fn into_static_str(self) -> &'static str {
        match self {
            ProcessResultSource::Ran => "ran_locally",
            ProcessResultSource::HitLocally => "hit_locally",
            ProcessResultSource::HitRemotely => "hit_remotely",
            ProcessResultSource::RanRemotely => "ran_remotely",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessResultMetadata {
    /// The wall time this process took to execute, if known (e.g. not available for a cache hit
    /// whose source never recorded it).
    pub total_elapsed: Option<concrete_time::Duration>,
    pub source: ProcessResultSource,
    /// The RunId of the Session this result was produced (or re-confirmed) during.
    pub source_run_id: RunId,
}

impl ProcessResultMetadata {
    pub fn new(
        total_elapsed: Option<concrete_time::Duration>,
        source: ProcessResultSource,
        source_run_id: RunId,
    ) -> Self {
        Self {
            total_elapsed,
            source,
            source_run_id,
        }
    }

    pub fn new_from_metadata(
        metadata: ProcessResultMetadata,
        source: ProcessResultSource,
        source_run_id: RunId,
    ) -> Self {
        Self {
            total_elapsed: metadata.total_elapsed,
            source,
            source_run_id,
        }
    }

    pub fn update_cache_hit_elapsed(&mut self, cache_hit_elapsed: Option<Duration>) {
        if let Some(elapsed) = cache_hit_elapsed {
            self.total_elapsed = Some(elapsed.into());
        }
    }
}

/// The outcome of executing a Process: a non-zero `exit_code` is a normal, successful return
/// from `run`; it is not a `ProcessError`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FallibleProcessResultWithPlatform {
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    pub exit_code: i32,
    pub output_directory: DirectoryDigest,
    pub platform: Platform,
    pub metadata: ProcessResultMetadata,
}

/// Errors reserved for things that actually prevented a result from being produced: spawn
/// failure, timeout, sandbox I/O, or a missing digest. A non-zero exit code is never a
/// `ProcessError`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessError {
    /// The process could not be spawned, timed out, or its sandbox could not be constructed.
    Unclassified(String),
    /// A digest referenced by the request (or needed to record its result) was not found in
    /// any configured store.
    MissingDigest(String, Digest),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Unclassified(s) => write!(f, "{s}"),
            ProcessError::MissingDigest(s, d) => write!(f, "{s}: {d:?}"),
        }
    }
}

impl From<String> for ProcessError {
    fn from(err: String) -> Self {
        ProcessError::Unclassified(err)
    }
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingDigest(s, d) => ProcessError::MissingDigest(s, d),
            other => ProcessError::Unclassified(other.to_string()),
        }
    }
}

/// Whether a remote cache hit must be validated by fetching its output tree, or may be trusted
/// on the strength of the action-cache entry alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheContentBehavior {
    Fetch,
    Validate,
}

/// The state shared between a `Session`'s Process requests: workunit recording, and the
/// identifiers used to fingerprint `PerSession`/`PerRestart*` cache scopes.
#[derive(Clone)]
pub struct Context {
    pub workunit_store: WorkunitStore,
    pub build_id: String,
    pub run_id: RunId,
    pub tail_tasks: task_executor::TailTasks,
}

impl Context {
    pub fn new(
        workunit_store: WorkunitStore,
        build_id: String,
        run_id: RunId,
        tail_tasks: task_executor::TailTasks,
    ) -> Context {
        Context {
            workunit_store,
            build_id,
            run_id,
            tail_tasks,
        }
    }
}

/// Executes a `Process`, returning a `FallibleProcessResultWithPlatform` or a `ProcessError`.
/// Implementors compose: `BoundedCommandRunner` wraps a local runner to bound parallelism;
/// `CommandRunner` (in `cache.rs`) wraps any runner with the process cache; `remote_cache::CommandRunner`
/// overlays the optional remote cache.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError>;
}

pub fn remove_platform_constraint_mismatch(_req: &Process) {}

/// Resolves the absolute path of the working directory a Process should see, relative to the
/// sandbox root.
pub fn working_directory_or_default(working_directory: &Option<RelativePath>) -> &Path {
    working_directory
        .as_ref()
        .map(|p| p.as_ref())
        .unwrap_or_else(|| Path::new(""))
}
