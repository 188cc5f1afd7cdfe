pub mod codec;
pub mod diagnostics;
pub mod handshake;
pub mod server;
pub mod service;

/// Generated gRPC types for the Terraform plugin protocol.
#[allow(clippy::all)]
#[allow(non_camel_case_types)]
pub mod tfplugin6 {
    #![doc(hidden)]
    tonic::include_proto!("tfplugin6");
}

/// Generated gRPC types for the go-plugin controller service.
#[allow(clippy::all)]
pub mod controller {
    #![doc(hidden)]
    tonic::include_proto!("plugin");
}

/// Terraform plugin protocol major version served by this binary.
pub const PROTOCOL_VERSION: u32 = 6;

/// go-plugin core protocol version, first field of the handshake line.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Registry address the host uses for this provider in reattach mode.
pub const PROVIDER_ADDRESS: &str = "registry.terraform.io/cyrilgdn/postgresql";
