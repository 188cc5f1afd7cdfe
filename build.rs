fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the Terraform plugin protocol (v6) and the go-plugin controller.
    // The host is the gRPC client; this crate only serves.
    let mut config = prost_build::Config::new();
    config.disable_comments(["."]);

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos_with_config(
            config,
            &["proto/tfplugin6.proto", "proto/grpc_controller.proto"],
            &["proto/"],
        )?;
    Ok(())
}
