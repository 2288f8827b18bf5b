//! Launching provider plugin subprocesses.
//!
//! Plugins follow the go-plugin client protocol: the host spawns the binary
//! with a magic cookie in the environment, the plugin prints a single
//! handshake line announcing its RPC endpoint, and the host connects a gRPC
//! channel to it. The subprocess is owned by the returned handle and killed
//! when the handle drops.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use super::proto::tfplugin5::provider_client::ProviderClient;

const MAGIC_COOKIE_KEY: &str = "TF_PLUGIN_MAGIC_COOKIE";
const MAGIC_COOKIE: &str = "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";
const CORE_PROTOCOL_VERSION: u32 = 1;
const PLUGIN_PROTOCOL_VERSION: u32 = 5;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to spawn plugin {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("plugin exited before completing the handshake")]
    NoHandshake,

    #[error("timed out waiting for plugin handshake")]
    HandshakeTimeout,

    #[error("invalid plugin handshake: {0}")]
    Handshake(String),

    #[error("unsupported plugin core protocol version {0}")]
    CoreProtocolVersion(u32),

    #[error("unsupported plugin protocol version {0}")]
    ProtocolVersion(u32),

    #[error("plugin offers unsupported RPC protocol '{0}'")]
    NotGrpc(String),

    #[error("failed to connect to plugin at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: tonic::transport::Error,
    },

    #[error("failed to read plugin handshake: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PluginEndpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl std::fmt::Display for PluginEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginEndpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            PluginEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Owns a running plugin subprocess; the process is killed on drop.
#[derive(Debug)]
pub struct PluginProcess {
    child: Child,
}

impl PluginProcess {
    /// Kills the plugin process. Dropping the handle has the same effect.
    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

/// Launches a plugin executable and returns a gRPC client bound to the live
/// subprocess.
pub(crate) async fn launch(
    path: &Path,
) -> Result<(ProviderClient<Channel>, PluginProcess), PluginError> {
    let mut child = Command::new(path)
        .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE)
        .env("PLUGIN_PROTOCOL_VERSIONS", PLUGIN_PROTOCOL_VERSION.to_string())
        .env("PLUGIN_MIN_PORT", "10000")
        .env("PLUGIN_MAX_PORT", "25000")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PluginError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

    let stdout = child.stdout.take().ok_or(PluginError::NoHandshake)?;
    let mut lines = BufReader::new(stdout).lines();
    let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| PluginError::HandshakeTimeout)??
        .ok_or(PluginError::NoHandshake)?;

    let endpoint = parse_handshake(&line)?;
    debug!(%endpoint, "plugin handshake complete");

    // plugins log to stderr; surface those lines at debug level
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "plugin", "{line}");
            }
        });
    }

    let channel = connect(&endpoint).await?;
    Ok((ProviderClient::new(channel), PluginProcess { child }))
}

/// Parses the go-plugin handshake line:
/// `core-version|protocol-version|network|address|protocol[|cert]`.
///
/// A trailing certificate field would only be present if the host had
/// requested TLS, which it does not; it is tolerated and ignored.
fn parse_handshake(line: &str) -> Result<PluginEndpoint, PluginError> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() < 4 {
        return Err(PluginError::Handshake(format!(
            "expected at least 4 fields, got {}",
            parts.len()
        )));
    }

    let core_version: u32 = parts[0]
        .parse()
        .map_err(|_| PluginError::Handshake(format!("invalid core version '{}'", parts[0])))?;
    if core_version != CORE_PROTOCOL_VERSION {
        return Err(PluginError::CoreProtocolVersion(core_version));
    }

    let protocol_version: u32 = parts[1]
        .parse()
        .map_err(|_| PluginError::Handshake(format!("invalid protocol version '{}'", parts[1])))?;
    if protocol_version != PLUGIN_PROTOCOL_VERSION {
        return Err(PluginError::ProtocolVersion(protocol_version));
    }

    // plugins that predate gRPC omit the fifth field
    let protocol = parts.get(4).copied().unwrap_or("netrpc");
    if protocol != "grpc" {
        return Err(PluginError::NotGrpc(protocol.to_string()));
    }

    match parts[2] {
        "tcp" => Ok(PluginEndpoint::Tcp(parts[3].to_string())),
        "unix" => Ok(PluginEndpoint::Unix(PathBuf::from(parts[3]))),
        other => Err(PluginError::Handshake(format!(
            "unsupported network type '{other}'"
        ))),
    }
}

async fn connect(endpoint: &PluginEndpoint) -> Result<Channel, PluginError> {
    match endpoint {
        PluginEndpoint::Tcp(addr) => Endpoint::try_from(format!("http://{addr}"))
            .map_err(|source| PluginError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?
            .connect()
            .await
            .map_err(|source| PluginError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }),
        PluginEndpoint::Unix(path) => {
            let path = path.clone();
            // the URI is required by the builder but never used to dial
            Endpoint::from_static("http://[::1]:1")
                .connect_with_connector(service_fn(move |_: Uri| {
                    UnixStream::connect(path.clone())
                }))
                .await
                .map_err(|source| PluginError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })
        }
    }
}
