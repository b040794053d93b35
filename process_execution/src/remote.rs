//! REAPI marshaling helpers shared by the local cache and remote cache `CommandRunner`s: building
//! the `Action`/`Command` pair that fingerprints a `Process`, translating a REAPI `ActionResult`
//! back into a `FallibleProcessResultWithPlatform`, and the small utilities (digesting a proto,
//! applying auth headers, formatting a REAPI `Status`) that both of those call through.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use concrete_time::TimeSpan;
use fs::{self, DirectoryDigest, File, PathStat, RelativePath, EMPTY_DIRECTORY_DIGEST};
use futures::future::{self, BoxFuture, TryFutureExt};
use futures::FutureExt;
use grpc_util::prost::MessageExt;
use hashing::{Digest, Fingerprint};
use log::Level;
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::rpc::Status as StatusProto;
use protos::require_digest;
use remexec::{Action, Command, ExecuteRequest};
use store::{Snapshot, Store, StoreError, StoreFileByDigest};
use tonic::metadata::BinaryMetadataValue;
use tonic::{Code, Request};
use tryfuture::try_future;
use uuid::Uuid;
use workunit_store::{in_workunit, RunId, SpanId, WorkunitMetadata, WorkunitStore};

use crate::{
    Context, FallibleProcessResultWithPlatform, Platform, Process, ProcessCacheScope,
    ProcessMetadata, ProcessResultMetadata, ProcessResultSource,
};

// Environment variable which is exclusively used for cache key invalidation.
// This may be not specified in an Process, and may be populated only by the
// CommandRunner.
pub const CACHE_KEY_GEN_VERSION_ENV_VAR_NAME: &str = "ENGINE_CACHE_KEY_GEN_VERSION";

// Environment variable which is used to include a unique value for cache busting of processes that
// have indicated that they should never be cached.
pub const CACHE_KEY_SALT_ENV_VAR_NAME: &str = "ENGINE_CACHE_KEY_SALT";

// Environment variable which is exclusively used for cache key invalidation.
// This may be not specified in an Process, and may be populated only by the
// CommandRunner.
pub const CACHE_KEY_TARGET_PLATFORM_ENV_VAR_NAME: &str = "ENGINE_CACHE_KEY_TARGET_PLATFORM";

fn maybe_add_workunit(
    result_cached: bool,
    name: &'static str,
    level: Level,
    time_span: concrete_time::TimeSpan,
    parent_id: Option<SpanId>,
    workunit_store: &WorkunitStore,
    metadata: WorkunitMetadata,
) {
    if !result_cached && workunit_store.max_level() >= level {
        let start_time: SystemTime = SystemTime::UNIX_EPOCH + time_span.start.into();
        let end_time: SystemTime = start_time + time_span.duration.into();
        workunit_store
            .add_completed_workunit(name, level, start_time, end_time, parent_id, metadata);
    }
}

pub fn make_execute_request(
    req: &Process,
    metadata: ProcessMetadata,
) -> Result<(remexec::Action, remexec::Command, remexec::ExecuteRequest), String> {
    let mut command = remexec::Command {
        arguments: req.argv.clone(),
        ..remexec::Command::default()
    };
    for (name, value) in &req.env {
        if name == CACHE_KEY_GEN_VERSION_ENV_VAR_NAME
            || name == CACHE_KEY_TARGET_PLATFORM_ENV_VAR_NAME
            || name == CACHE_KEY_SALT_ENV_VAR_NAME
        {
            return Err(format!(
                "Cannot set env var with name {} as that is reserved for internal use by the engine",
                name
            ));
        }

        command
            .environment_variables
            .push(remexec::command::EnvironmentVariable {
                name: name.to_string(),
                value: value.to_string(),
            });
    }

    let ProcessMetadata {
        instance_name,
        cache_key_gen_version,
        mut platform_properties,
    } = metadata;

    // TODO: Disabling append-only caches in remoting until server support exists due to
    //       interaction with how servers match platform properties.
    // if !req.append_only_caches.is_empty() {
    //   platform_properties.extend(NamedCaches::platform_properties(
    //     &req.append_only_caches,
    //     &cache_key_gen_version,
    //   ));
    // }

    if let Some(cache_key_gen_version) = cache_key_gen_version {
        command
            .environment_variables
            .push(remexec::command::EnvironmentVariable {
                name: CACHE_KEY_GEN_VERSION_ENV_VAR_NAME.to_string(),
                value: cache_key_gen_version,
            });
    }

    if matches!(
        req.cache_scope,
        ProcessCacheScope::PerSession
            | ProcessCacheScope::PerRestartAlways
            | ProcessCacheScope::PerRestartSuccessful
    ) {
        command
            .environment_variables
            .push(remexec::command::EnvironmentVariable {
                name: CACHE_KEY_SALT_ENV_VAR_NAME.to_string(),
                value: Uuid::new_v4().to_string(),
            });
    }

    {
        command
            .environment_variables
            .push(remexec::command::EnvironmentVariable {
                name: CACHE_KEY_TARGET_PLATFORM_ENV_VAR_NAME.to_string(),
                value: match req.platform_constraint {
                    Some(plat) => plat.into(),
                    None => "none".to_string(),
                },
            });
    }

    let mut output_files = req
        .output_files
        .iter()
        .map(|p| {
            p.to_str()
                .map(str::to_owned)
                .ok_or_else(|| format!("Non-UTF8 output file path: {:?}", p))
        })
        .collect::<Result<Vec<String>, String>>()?;
    output_files.sort();
    command.output_files = output_files;

    let mut output_directories = req
        .output_directories
        .iter()
        .map(|p| {
            p.to_str()
                .map(str::to_owned)
                .ok_or_else(|| format!("Non-UTF8 output directory path: {:?}", p))
        })
        .collect::<Result<Vec<String>, String>>()?;
    output_directories.sort();
    command.output_directories = output_directories;

    if let Some(working_directory) = &req.working_directory {
        command.working_directory = working_directory
            .to_str()
            .map(str::to_owned)
            .unwrap_or_else(|| panic!("Non-UTF8 working directory path: {:?}", working_directory));
    }

    if req.jdk_home.is_some() {
        // Ideally, the JDK would be brought along as part of the input directory, but we don't
        // currently have support for that. Scoot supports this property, and will symlink .jdk to a
        // system-installed JDK https://github.com/twitter/scoot/pull/391 - we should probably come to
        // some kind of consensus across tools as to how this should work; RBE appears to work by
        // allowing you to specify a jdk-version platform property, and it will put a JDK at a
        // well-known path in the docker container you specify in which to run.
        platform_properties.push(("JDK_SYMLINK".to_owned(), ".jdk".to_owned()));
    }

    // Extract `Platform` proto from the `Command` to avoid a partial move of `Command`.
    let mut command_platform = command.platform.take().unwrap_or_default();

    // Add configured platform properties to the `Platform`.
    for (name, value) in platform_properties {
        command_platform
            .properties
            .push(remexec::platform::Property {
                name: name.clone(),
                value: value.clone(),
            });
    }

    // Sort the platform properties.
    //
    // From the remote execution spec:
    //   The properties that make up this platform. In order to ensure that
    //   equivalent `Platform`s always hash to the same value, the properties MUST
    //   be lexicographically sorted by name, and then by value. Sorting of strings
    //   is done by code point, equivalently, by the UTF-8 bytes.
    //
    // Note: BuildBarn enforces this requirement.
    command_platform
        .properties
        .sort_by(|x, y| match x.name.cmp(&y.name) {
            Ordering::Equal => x.value.cmp(&y.value),
            v => v,
        });

    // Store the separate copy back into the Command proto.
    command.platform = Some(command_platform);

    // Sort the environment variables. REv2 spec requires sorting by name for same reasons that
    // platform properties are sorted, i.e. consistent hashing.
    command
        .environment_variables
        .sort_by(|x, y| x.name.cmp(&y.name));

    let mut action = remexec::Action {
        command_digest: Some((&digest(&command)?).into()),
        input_root_digest: Some((&req.input_digests.complete.as_digest()).into()),
        ..remexec::Action::default()
    };

    if let Some(timeout) = req.timeout {
        action.timeout = Some(prost_types::Duration::from(timeout));
    }

    let execute_request = remexec::ExecuteRequest {
        action_digest: Some((&digest(&action)?).into()),
        instance_name: instance_name.unwrap_or_else(|| "".to_owned()),
        ..remexec::ExecuteRequest::default()
    };

    Ok((action, command, execute_request))
}

/// Convert an ActionResult into a FallibleProcessResultWithPlatform.
///
/// HACK: The caching CommandRunner stores the digest of the Directory that merges all output
/// files and output directories in the `tree_digest` field of the `output_directories` field
/// of the ActionResult/ExecuteResponse stored in the local cache. When
/// `treat_tree_digest_as_final_directory_hack` is true, then that final merged directory
/// will be extracted from the tree_digest of the single output directory.
pub(crate) async fn populate_fallible_execution_result(
    store: Store,
    run_id: RunId,
    action_result: &remexec::ActionResult,
    platform: Platform,
    treat_tree_digest_as_final_directory_hack: bool,
    source: ProcessResultSource,
) -> Result<FallibleProcessResultWithPlatform, StoreError> {
    let (stdout_digest, stderr_digest, output_directory) = future::try_join3(
        extract_stdout(&store, action_result),
        extract_stderr(&store, action_result),
        extract_output_files(
            store,
            action_result,
            treat_tree_digest_as_final_directory_hack,
        ),
    )
    .await?;

    Ok(FallibleProcessResultWithPlatform {
        stdout_digest,
        stderr_digest,
        exit_code: action_result.exit_code,
        output_directory,
        platform,
        metadata: action_result.execution_metadata.clone().map_or(
            ProcessResultMetadata::new(None, source, run_id),
            |metadata| ProcessResultMetadata::new_from_metadata(metadata, source, run_id),
        ),
    })
}

fn extract_stdout<'a>(
    store: &Store,
    action_result: &'a remexec::ActionResult,
) -> BoxFuture<'a, Result<Digest, StoreError>> {
    let store = store.clone();
    async move {
        if let Some(digest_proto) = &action_result.stdout_digest {
            let stdout_digest_result: Result<Digest, String> = digest_proto.try_into();
            let stdout_digest =
                stdout_digest_result.map_err(|err| format!("Error extracting stdout: {}", err))?;
            Ok(stdout_digest)
        } else {
            let stdout_raw = Bytes::copy_from_slice(&action_result.stdout_raw);
            let digest = store
                .store_file_bytes(stdout_raw, true)
                .map_err(move |error| format!("Error storing raw stdout: {:?}", error))
                .await?;
            Ok(digest)
        }
    }
    .boxed()
}

fn extract_stderr<'a>(
    store: &Store,
    action_result: &'a remexec::ActionResult,
) -> BoxFuture<'a, Result<Digest, StoreError>> {
    let store = store.clone();
    async move {
        if let Some(digest_proto) = &action_result.stderr_digest {
            let stderr_digest_result: Result<Digest, String> = digest_proto.try_into();
            let stderr_digest =
                stderr_digest_result.map_err(|err| format!("Error extracting stderr: {}", err))?;
            Ok(stderr_digest)
        } else {
            let stderr_raw = Bytes::copy_from_slice(&action_result.stderr_raw);
            let digest = store
                .store_file_bytes(stderr_raw, true)
                .map_err(move |error| format!("Error storing raw stderr: {:?}", error))
                .await?;
            Ok(digest)
        }
    }
    .boxed()
}

pub fn extract_output_files(
    store: Store,
    action_result: &remexec::ActionResult,
    treat_tree_digest_as_final_directory_hack: bool,
) -> BoxFuture<'static, Result<DirectoryDigest, StoreError>> {
    // HACK: The caching CommandRunner stores the digest of the Directory that merges all output
    // files and output directories in the `tree_digest` field of the `output_directories` field
    // of the ActionResult/ExecuteResponse stored in the local cache. When
    // `treat_tree_digest_as_final_directory_hack` is true, then this code will extract that
    // directory from the tree_digest and skip the merging performed by the remainder of this
    // method.
    if treat_tree_digest_as_final_directory_hack {
        match &action_result.output_directories[..] {
            &[ref directory] => {
                match require_digest(directory.tree_digest.as_ref()) {
                    Ok(digest) => {
                        return future::ready::<Result<_, StoreError>>(Ok(
                            DirectoryDigest::from_persisted_digest(digest),
                        ))
                        .boxed()
                    }
                    Err(err) => return futures::future::err(err.into()).boxed(),
                };
            }
            _ => {
                return futures::future::err(
                    "illegal state: treat_tree_digest_as_final_directory_hack \
          expected single output directory"
                        .to_owned()
                        .into(),
                )
                .boxed();
            }
        }
    }

    // Get Digests of output Directories.
    // Then we'll make a Directory for the output files, and merge them.
    let mut directory_digests = Vec::with_capacity(action_result.output_directories.len() + 1);
    // TODO: Maybe take rather than clone
    let output_directories = action_result.output_directories.clone();
    for dir in output_directories {
        let store = store.clone();
        directory_digests.push(
            (async move {
                // The `OutputDirectory` contains the digest of a `Tree` proto which contains
                // the `Directory` proto of the root directory of this `OutputDirectory` plus all
                // of the `Directory` protos for child directories of that root.

                // Retrieve the Tree proto and hash its root `Directory` proto to obtain the digest
                // of the output directory needed to construct the series of `Directory` protos needed
                // for the final merge of the output directories.
                let tree_digest: Digest = require_digest(dir.tree_digest.as_ref())?;
                let directory_digest =
                    store
                        .load_tree_from_remote(tree_digest)
                        .await?
                        .ok_or_else(|| {
                            format!("Tree with digest {:?} was not in remote", tree_digest)
                        })?;

                store
                    .add_prefix(directory_digest, &RelativePath::new(dir.path)?)
                    .await
            })
            .map_err(|err| {
                format!(
                    "Error saving remote output directory to local cache: {}",
                    err
                )
            }),
        );
    }

    // Make a directory for the files
    let mut path_map = HashMap::new();
    let path_stats_result: Result<Vec<PathStat>, String> = action_result
        .output_files
        .iter()
        .map(|output_file| {
            let output_file_path_buf = PathBuf::from(output_file.path.clone());
            let digest: Result<Digest, String> = require_digest(output_file.digest.as_ref());
            path_map.insert(output_file_path_buf.clone(), digest?);
            Ok(PathStat::file(
                output_file_path_buf.clone(),
                File {
                    path: output_file_path_buf,
                    is_executable: output_file.is_executable,
                },
            ))
        })
        .collect();

    let path_stats = try_future!(path_stats_result);

    #[derive(Clone)]
    struct StoreOneOffRemoteDigest {
        map_of_paths_to_digests: HashMap<PathBuf, Digest>,
    }

    impl StoreOneOffRemoteDigest {
        fn new(map: HashMap<PathBuf, Digest>) -> StoreOneOffRemoteDigest {
            StoreOneOffRemoteDigest {
                map_of_paths_to_digests: map,
            }
        }
    }

    impl StoreFileByDigest<String> for StoreOneOffRemoteDigest {
        fn store_by_digest(
            &self,
            file: File,
        ) -> future::BoxFuture<'static, Result<Digest, String>> {
            match self.map_of_paths_to_digests.get(&file.path) {
                Some(digest) => future::ok(*digest),
                None => future::err(format!(
                    "Didn't know digest for path in remote execution response: {:?}",
                    file.path
                )),
            }
            .boxed()
        }
    }

    async move {
        let files_snapshot =
            Snapshot::from_path_stats(StoreOneOffRemoteDigest::new(path_map), path_stats).map_err(
                move |error| {
                    format!(
                        "Error when storing the output file directory info in the remote CAS: {:?}",
                        error
                    )
                },
            );

        let (files_snapshot, mut directory_digests) =
            future::try_join(files_snapshot, future::try_join_all(directory_digests)).await?;

        directory_digests.push(files_snapshot.into());

        store
            .merge(directory_digests)
            .map_err(|err| err.enrich("Error when merging output files and directories"))
            .await
    }
    .boxed()
}

/// Apply REAPI request metadata header to a `tonic::Request`.
pub(crate) fn apply_headers<T>(mut request: Request<T>, build_id: &str) -> Request<T> {
    let reapi_request_metadata = remexec::RequestMetadata {
        tool_details: Some(remexec::ToolDetails {
            tool_name: "engine".into(),
            ..remexec::ToolDetails::default()
        }),
        tool_invocation_id: build_id.to_string(),
        ..remexec::RequestMetadata::default()
    };

    let md = request.metadata_mut();
    md.insert_bin(
        "google.devtools.remoteexecution.v1test.requestmetadata-bin",
        BinaryMetadataValue::try_from_bytes(&reapi_request_metadata.to_bytes()).unwrap(),
    );

    request
}

pub async fn store_proto_locally<P: prost::Message>(
    store: &Store,
    proto: &P,
) -> Result<Digest, String> {
    store
        .store_file_bytes(proto.to_bytes(), true)
        .await
        .map_err(|e| format!("Error saving proto to local store: {:?}", e))
}

pub async fn ensure_action_stored_locally(
    store: &Store,
    command: &Command,
    action: &Action,
) -> Result<(Digest, Digest), String> {
    let (command_digest, action_digest) = future::try_join(
        store_proto_locally(store, command),
        store_proto_locally(store, action),
    )
    .await?;

    Ok((command_digest, action_digest))
}

///
/// Ensure that the Action and Command (and optionally their input files, likely depending on
/// whether we are in a remote execution context, or a pure cache-usage context) are uploaded.
///
pub async fn ensure_action_uploaded(
    store: &Store,
    command_digest: Digest,
    action_digest: Digest,
    input_files: Option<DirectoryDigest>,
) -> Result<(), StoreError> {
    in_workunit!(
        "ensure_action_uploaded",
        Level::Trace,
        desc = Some(format!("ensure action uploaded for {:?}", action_digest)),
        |_workunit| async move {
            let mut digests = vec![command_digest, action_digest];
            if let Some(input_files) = input_files {
                // TODO: Port ensure_remote_has_recursive. See #13112.
                store
                    .ensure_directory_digest_persisted(input_files.clone())
                    .await?;
                digests.push(input_files.todo_as_digest());
            }
            let _ = store.ensure_remote_has_recursive(digests).await?;
            Ok(())
        },
    )
    .await
}

pub fn format_error(error: &StatusProto) -> String {
    let error_code_enum = Code::from_i32(error.code);
    let error_code = match error_code_enum {
        Code::Unknown => format!("{:?}", error.code),
        x => format!("{:?}", x),
    };
    format!("{}: {}", error_code, error.message)
}

pub fn digest<T: prost::Message>(message: &T) -> Result<Digest, String> {
    Ok(Digest::of_bytes(&message.to_bytes()))
}
