// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

fn main() -> std::io::Result<()> {
    let proto_file = "spike.proto";
    println!("cargo:rerun-if-changed={}", proto_file);

    setup_protoc_env()?;

    tonic_build::configure()
        .protoc_arg("--experimental_allow_proto3_optional")
        .compile(&[proto_file], &["."] /* includes */)
}

/// Setup process level env vars for tonic to find protoc etc
fn setup_protoc_env() -> std::io::Result<()> {
    let protoc_bin = protoc_bin_vendored::protoc_bin_path()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
    unsafe {
        std::env::set_var("PROTOC", protoc_bin);
    }

    let protoc_inc = protoc_bin_vendored::include_path()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
    // protoc wants canonicalized paths
    let protoc_inc = protoc_inc.canonicalize()?;
    unsafe {
        std::env::set_var("PROTOC_INCLUDE", protoc_inc);
    }
    Ok(())
}
