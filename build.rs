fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "prost-build")]
    tonic_build::configure()
        .build_server(false)
        .bytes(["."])
        .out_dir("src/api")
        .compile_protos(&["proto/pubsub_api.proto"], &["proto"])?;

    Ok(())
}
