use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::retry::Backoff;
use crate::config::JumpHost;

/// Readiness checks against the forwarded port.
const READY_BACKOFF: Backoff = Backoff::new(8, Duration::from_millis(100), Duration::from_secs(2));

/// A local port forwarded through an SSH jump host to the database.
/// The ssh process is killed when the tunnel is dropped.
pub struct Tunnel {
    pub local_port: u16,
    _child: Child,
}

impl Tunnel {
    /// Start `ssh -N -L` and wait until the forwarded port accepts connections.
    pub async fn open(jump: &JumpHost, db_host: &str, db_port: u16) -> Result<Self> {
        let local_port = free_local_port().await?;
        let args = ssh_args(jump, local_port, db_host, db_port);
        info!(
            jump_host = %jump.host,
            local_port,
            target = %format!("{}:{}", db_host, db_port),
            "Opening SSH tunnel"
        );

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start ssh for jump host")?;

        // ssh only talks on stderr; keep the pipe drained and surface it in logs.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "ssh_tunnel", "{}", line.trim_end());
                }
            });
        }

        let addr = format!("127.0.0.1:{}", local_port);
        let ready = READY_BACKOFF
            .run("ssh tunnel readiness", || TcpStream::connect(addr.as_str()))
            .await;

        if let Err(e) = ready {
            if let Ok(Some(status)) = child.try_wait() {
                bail!("ssh exited with {} before the tunnel was ready", status);
            }
            bail!("SSH tunnel on {} never became ready: {}", addr, e);
        }

        debug!(local_port, "SSH tunnel ready");
        Ok(Self {
            local_port,
            _child: child,
        })
    }
}

/// Arguments for a forward-only ssh session.
pub fn ssh_args(jump: &JumpHost, local_port: u16, db_host: &str, db_port: u16) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{}:{}:{}", local_port, db_host, db_port),
        "-p".to_string(),
        jump.port.to_string(),
    ];
    if let Some(key) = &jump.private_key_file {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args.push(match &jump.user {
        Some(user) => format!("{}@{}", user, jump.host),
        None => jump.host.clone(),
    });
    args
}

async fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to find a free local port for the SSH tunnel")?;
    Ok(listener
        .local_addr()
        .context("Failed to read tunnel listener address")?
        .port())
}
