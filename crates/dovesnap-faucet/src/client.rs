//! Controller configuration client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use dovesnap_common::{DovesnapError, DovesnapResult, RetryPolicy, retry};

use crate::doc::FaucetDoc;
use crate::proto;

/// A remote mirror registration for a network's loopback port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMirror {
    /// Local datapath name.
    pub dp_name: String,
    /// Local loopback port.
    pub port: u32,
    /// VLAN the mirrored traffic is tunneled on.
    pub tunnel_vid: u32,
    /// Datapath owning the collector port.
    pub remote_dp_name: String,
    /// Collector port.
    pub remote_port: u32,
}

/// The controller's configuration service.
///
/// Every call is a delta; nothing is read back.
#[async_trait]
pub trait FaucetConfig: Send + Sync {
    /// Merge a document into the running configuration.
    async fn set_config(&self, doc: &FaucetDoc) -> DovesnapResult<()>;

    /// Remove a datapath.
    async fn delete_dp(&self, dp_name: &str) -> DovesnapResult<()>;

    /// Remove interfaces from a datapath, dropping the datapath if it ends up empty.
    async fn delete_dp_interfaces(&self, dp_name: &str, ports: &[u32]) -> DovesnapResult<()>;

    /// Mirror `port` to `mirror_port`.
    async fn add_port_mirror(&self, dp_name: &str, port: u32, mirror_port: u32)
    -> DovesnapResult<()>;

    /// Stop mirroring `port` to `mirror_port`.
    async fn remove_port_mirror(
        &self,
        dp_name: &str,
        port: u32,
        mirror_port: u32,
    ) -> DovesnapResult<()>;

    /// Tunnel a loopback port's traffic to a remote collector.
    async fn set_remote_mirror_port(&self, mirror: &RemoteMirror) -> DovesnapResult<()>;
}

/// Connection settings for faucetconfrpc.
#[derive(Debug, Clone)]
pub struct FaucetConnectConfig {
    /// Server host name, also used for TLS verification.
    pub server: String,
    /// Server port.
    pub port: u16,
    /// Directory holding the client certificate, key and server CA.
    pub keydir: PathBuf,
    /// Client certificate base name.
    pub client_name: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for FaucetConnectConfig {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: 59999,
            keydir: PathBuf::from("/faucetconfrpc"),
            client_name: "faucetconfrpc".into(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl FaucetConnectConfig {
    /// Client certificate, client key and server CA paths.
    #[must_use]
    pub fn tls_files(&self) -> (PathBuf, PathBuf, PathBuf) {
        (
            self.keydir.join(format!("{}.crt", self.client_name)),
            self.keydir.join(format!("{}.key", self.client_name)),
            self.keydir.join(format!("{}-ca.crt", self.server)),
        )
    }

    /// `https://server:port`
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("https://{}:{}", self.server, self.port)
    }
}

async fn read_pem(path: &Path) -> DovesnapResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        DovesnapError::config(format!("Cannot read {}: {e}", path.display()))
    })
}

/// gRPC client for faucetconfrpc over mutual TLS.
#[derive(Debug, Clone)]
pub struct FaucetConfClient {
    inner: tonic::client::Grpc<Channel>,
    policy: RetryPolicy,
}

impl FaucetConfClient {
    /// Load certificates and connect.
    ///
    /// # Errors
    ///
    /// Returns [`DovesnapError::Config`] for unreadable certificates and
    /// [`DovesnapError::Controller`] if the server cannot be reached.
    pub async fn connect(config: &FaucetConnectConfig) -> DovesnapResult<Self> {
        let (crt, key, ca) = config.tls_files();
        let identity = Identity::from_pem(read_pem(&crt).await?, read_pem(&key).await?);
        let ca = Certificate::from_pem(read_pem(&ca).await?);
        tracing::debug!("Certificates loaded");

        let tls = ClientTlsConfig::new()
            .domain_name(config.server.clone())
            .ca_certificate(ca)
            .identity(identity);

        let endpoint = config.endpoint();
        tracing::debug!(%endpoint, "Connecting to RPC server");
        let channel = Channel::from_shared(endpoint.clone())
            .map_err(|e| DovesnapError::config(format!("Invalid endpoint {endpoint}: {e}")))?
            .tls_config(tls)
            .map_err(|e| DovesnapError::config(format!("TLS configuration: {e}")))?
            .connect_timeout(config.connect_timeout)
            .connect()
            .await
            .map_err(|e| DovesnapError::Controller {
                message: format!("Cannot connect to {endpoint}: {e}"),
            })?;
        tracing::info!(%endpoint, "Connected to RPC server");

        Ok(Self::from_channel(channel))
    }

    /// Use an already established channel.
    #[must_use]
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
            policy: RetryPolicy::CONTROLLER,
        }
    }

    async fn call<Req, Resp>(&self, path: &'static str, request: Req) -> DovesnapResult<Resp>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        retry(self.policy, path, || {
            let mut grpc = self.inner.clone();
            let request = request.clone();
            async move {
                grpc.ready().await.map_err(|e| DovesnapError::Controller {
                    message: format!("Service was not ready: {e}"),
                })?;
                let codec = tonic_prost::ProstCodec::default();
                grpc.unary(
                    tonic::Request::new(request),
                    PathAndQuery::from_static(path),
                    codec,
                )
                .await
                .map(tonic::Response::into_inner)
                .map_err(|status| DovesnapError::Controller {
                    message: format!("{path}: {}", status.message()),
                })
            }
        })
        .await
    }
}

#[async_trait]
impl FaucetConfig for FaucetConfClient {
    async fn set_config(&self, doc: &FaucetDoc) -> DovesnapResult<()> {
        let config_yaml = doc.to_yaml()?;
        tracing::debug!(%config_yaml, "setFaucetConfigFile");
        let request = proto::SetConfigFileRequest {
            config_yaml,
            merge: true,
            ..Default::default()
        };
        self.call::<_, proto::SetConfigFileReply>(
            "/faucetconfserver.FaucetConfServer/SetConfigFile",
            request,
        )
        .await
        .map(|_| ())
    }

    async fn delete_dp(&self, dp_name: &str) -> DovesnapResult<()> {
        let request = proto::DelDpsRequest {
            interfaces_config: vec![proto::DpInfo {
                name: dp_name.to_string(),
                interfaces: Vec::new(),
            }],
        };
        self.call::<_, proto::DelDpsReply>("/faucetconfserver.FaucetConfServer/DelDps", request)
            .await
            .map(|_| ())
    }

    async fn delete_dp_interfaces(&self, dp_name: &str, ports: &[u32]) -> DovesnapResult<()> {
        let request = proto::DelDpInterfacesRequest {
            interfaces_config: vec![proto::DpInfo {
                name: dp_name.to_string(),
                interfaces: ports
                    .iter()
                    .map(|&port_no| proto::InterfaceInfo { port_no })
                    .collect(),
            }],
            delete_empty_dp: true,
        };
        self.call::<_, proto::DelDpInterfacesReply>(
            "/faucetconfserver.FaucetConfServer/DelDpInterfaces",
            request,
        )
        .await
        .map(|_| ())
    }

    async fn add_port_mirror(
        &self,
        dp_name: &str,
        port: u32,
        mirror_port: u32,
    ) -> DovesnapResult<()> {
        let request = proto::PortMirrorRequest {
            dp_name: dp_name.to_string(),
            port_no: port,
            mirror_port_no: mirror_port,
        };
        self.call::<_, proto::PortMirrorReply>(
            "/faucetconfserver.FaucetConfServer/AddPortMirror",
            request,
        )
        .await
        .map(|_| ())
    }

    async fn remove_port_mirror(
        &self,
        dp_name: &str,
        port: u32,
        mirror_port: u32,
    ) -> DovesnapResult<()> {
        let request = proto::PortMirrorRequest {
            dp_name: dp_name.to_string(),
            port_no: port,
            mirror_port_no: mirror_port,
        };
        self.call::<_, proto::PortMirrorReply>(
            "/faucetconfserver.FaucetConfServer/RemovePortMirror",
            request,
        )
        .await
        .map(|_| ())
    }

    async fn set_remote_mirror_port(&self, mirror: &RemoteMirror) -> DovesnapResult<()> {
        let request = proto::SetRemoteMirrorPortRequest {
            dp_name: mirror.dp_name.clone(),
            port_no: mirror.port,
            tunnel_vid: mirror.tunnel_vid,
            remote_dp_name: mirror.remote_dp_name.clone(),
            remote_port_no: mirror.remote_port,
        };
        self.call::<_, proto::SetRemoteMirrorPortReply>(
            "/faucetconfserver.FaucetConfServer/SetRemoteMirrorPort",
            request,
        )
        .await
        .map(|_| ())
    }
}
