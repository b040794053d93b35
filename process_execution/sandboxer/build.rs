// Copyright 2025 Engine Contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let mut config = prost_build::Config::new();
  config.bytes(&["."]);
  // The request message embeds a REAPI Digest: reuse the type already generated by the
  // `protos` crate rather than generating (and converting between) a second copy of it.
  config.extern_path(
    ".build.bazel.remote.execution.v2",
    "::protos::gen::build::bazel::remote::execution::v2",
  );

  tonic_build::configure()
    .build_client(true)
    .build_server(true)
    .compile_with_config(
      config,
      &["proto/sandboxer.proto"],
      &["proto", "../../protos/protos/bazelbuild_remote-apis"],
    )?;
  Ok(())
}
