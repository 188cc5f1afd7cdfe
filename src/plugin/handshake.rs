//! go-plugin handshake: environment checks, the stdout handshake line, the
//! AutoMTLS server certificate and the debug-mode reattach value.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use serde::Serialize;

use super::{CORE_PROTOCOL_VERSION, PROTOCOL_VERSION, PROVIDER_ADDRESS};
use crate::config::Env;

/// The go-plugin handshake magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "TF_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

pub const PROTOCOL_VERSIONS_KEY: &str = "PLUGIN_PROTOCOL_VERSIONS";
pub const CLIENT_CERT_KEY: &str = "PLUGIN_CLIENT_CERT";

/// Refuse to start unless launched by a plugin host speaking protocol 6.
pub fn check_environment(env: &dyn Env) -> Result<()> {
    if env.var(MAGIC_COOKIE_KEY).as_deref() != Some(MAGIC_COOKIE_VALUE) {
        bail!(
            "This binary is a plugin. These are not meant to be executed directly. \
             Please execute the program that consumes these plugins, which will \
             load any plugins automatically"
        );
    }
    if let Some(versions) = env.var(PROTOCOL_VERSIONS_KEY) {
        let wanted = PROTOCOL_VERSION.to_string();
        if !versions.split(',').any(|v| v.trim() == wanted) {
            bail!(
                "Plugin host offers protocol versions {:?}; this provider only speaks {}",
                versions,
                PROTOCOL_VERSION
            );
        }
    }
    Ok(())
}

/// The single line written to stdout once the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub address: SocketAddr,
    /// DER of the server certificate when AutoMTLS is on.
    pub server_cert: Option<Vec<u8>>,
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|tcp|{}|grpc",
            CORE_PROTOCOL_VERSION, PROTOCOL_VERSION, self.address
        )?;
        if let Some(der) = &self.server_cert {
            write!(f, "|{}", STANDARD_NO_PAD.encode(der))?;
        }
        Ok(())
    }
}

/// Self-signed server certificate for AutoMTLS.
pub struct ServerIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

/// Generate an ECDSA P-256 certificate for `localhost`. The host pins it
/// from the handshake line, so it is its own CA.
pub fn generate_identity() -> Result<ServerIdentity> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("Failed to build certificate parameters")?;
    params
        .distinguished_name
        .push(DnType::OrganizationName, "HashiCorp");
    params.distinguished_name.push(DnType::CommonName, "localhost");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key_pair = KeyPair::generate().context("Failed to generate server key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign server certificate")?;

    Ok(ServerIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().to_vec(),
    })
}

// ─── Debug Mode ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReattachConfig {
    protocol: &'static str,
    protocol_version: u32,
    pid: u32,
    test: bool,
    addr: ReattachAddr,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReattachAddr {
    network: &'static str,
    string: String,
}

/// Value for `TF_REATTACH_PROVIDERS` pointing the host at a running server.
pub fn reattach_json(address: SocketAddr, pid: u32) -> Result<String> {
    let config = ReattachConfig {
        protocol: "grpc",
        protocol_version: PROTOCOL_VERSION,
        pid,
        test: true,
        addr: ReattachAddr {
            network: "tcp",
            string: address.to_string(),
        },
    };
    let providers = BTreeMap::from([(PROVIDER_ADDRESS, config)]);
    serde_json::to_string(&providers).context("Failed to encode reattach configuration")
}

/// Instructions printed in debug mode.
pub fn reattach_instructions(address: SocketAddr, pid: u32) -> Result<String> {
    Ok(format!(
        "Provider started. To attach Terraform CLI, set the TF_REATTACH_PROVIDERS \
         environment variable with the following:\n\n\tTF_REATTACH_PROVIDERS='{}'\n",
        reattach_json(address, pid)?
    ))
}
