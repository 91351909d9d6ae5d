fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Prefer a system protoc when one is configured, fall back to the vendored binary.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    println!("cargo:rerun-if-changed=proto/deploy.proto");
    tonic_build::compile_protos("proto/deploy.proto")?;
    Ok(())
}
