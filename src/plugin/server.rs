use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tonic::transport::server::TcpIncoming;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::info;

use super::controller::grpc_controller_server::{GrpcController, GrpcControllerServer};
use super::controller::Empty;
use super::handshake::{self, Handshake, CLIENT_CERT_KEY};
use super::service::ProviderService;
use super::tfplugin6::provider_server::ProviderServer;
use crate::config::{Env, ProcessEnv};

/// Largest message accepted or sent; schemas and states can be large.
const MAX_MESSAGE_SIZE: usize = 256 << 20;

/// go-plugin controller: the host asks the plugin to exit through it.
pub struct Controller {
    shutdown: Arc<Notify>,
}

#[tonic::async_trait]
impl GrpcController for Controller {
    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        info!("Shutdown requested by host");
        self.shutdown.notify_one();
        Ok(Response::new(Empty {}))
    }
}

/// Run the provider until the host shuts it down.
///
/// In debug mode the cookie check and TLS are skipped and reattach
/// instructions are printed instead of the handshake line.
pub async fn serve(debug: bool) -> Result<()> {
    let env = ProcessEnv;
    if !debug {
        handshake::check_environment(&env)?;
    }

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind provider listener")?;
    let address: SocketAddr = listener
        .local_addr()
        .context("Failed to read listener address")?;

    let mut builder = Server::builder();
    let mut server_cert = None;
    if let Some(client_cert) = env.var(CLIENT_CERT_KEY).filter(|_| !debug) {
        let identity = handshake::generate_identity()?;
        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(&identity.cert_pem, &identity.key_pem))
            .client_ca_root(Certificate::from_pem(client_cert));
        builder = builder
            .tls_config(tls)
            .context("Failed to configure TLS")?;
        server_cert = Some(identity.cert_der);
        info!("AutoMTLS enabled");
    }

    let shutdown = Arc::new(Notify::new());
    let provider = ProviderServer::new(ProviderService::new())
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);
    let controller = GrpcControllerServer::new(Controller {
        shutdown: Arc::clone(&shutdown),
    });

    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| anyhow!("Failed to accept on provider listener: {}", e))?;

    let mut stdout = std::io::stdout();
    if debug {
        let instructions = handshake::reattach_instructions(address, std::process::id())?;
        writeln!(stdout, "{}", instructions).context("Failed to write reattach instructions")?;
    } else {
        let line = Handshake {
            address,
            server_cert,
        };
        writeln!(stdout, "{}", line).context("Failed to write handshake")?;
    }
    stdout.flush().context("Failed to flush handshake")?;
    let debug_mode = debug;
    info!(address = %address, debug_mode, "Provider listening");

    let signal = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            if debug {
                tokio::select! {
                    _ = shutdown.notified() => {}
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                }
            } else {
                shutdown.notified().await;
            }
        }
    };

    builder
        .add_service(provider)
        .add_service(controller)
        .serve_with_incoming_shutdown(incoming, signal)
        .await
        .context("Provider server failed")?;

    info!("Provider stopped");
    Ok(())
}
