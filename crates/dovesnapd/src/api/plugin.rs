//! Docker network plugin protocol.
//!
//! Docker POSTs a JSON body to `/<Interface>.<Method>` on the plugin's Unix
//! socket. Network and endpoint lifecycle calls are queued on the resource
//! manager; everything else is acknowledged without side effects.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::UnixListener;
use tower_http::trace::TraceLayer;

use dovesnap::ManagerHandle;
use dovesnap::driver::{Gateway, NetworkOptions, PublishedPort};
use dovesnap_common::{DovesnapError, DovesnapResult};
use dovesnap_network::Protocol;

use super::ApiError;

const GENERIC_OPTION: &str = "com.docker.network.generic";
const INTERNAL_OPTION: &str = "com.docker.network.internal";
const PORTMAP_OPTION: &str = "com.docker.network.portmap";

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

type ApiResult = Result<Json<Value>, ApiError>;

/// Request bodies may be empty; those decode to the default value.
fn decode<T: DeserializeOwned + Default>(body: &[u8]) -> DovesnapResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| DovesnapError::Serialization(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpamData {
    #[serde(default)]
    gateway: Option<String>,
}

/// `NetworkDriver.CreateNetwork`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(default)]
    options: Option<HashMap<String, Value>>,
    #[serde(rename = "IPv4Data", default)]
    ipv4_data: Option<Vec<IpamData>>,
    #[serde(rename = "IPv6Data", default)]
    ipv6_data: Option<Vec<IpamData>>,
}

fn first_gateway(data: Option<&Vec<IpamData>>) -> Option<&str> {
    data?
        .first()?
        .gateway
        .as_deref()
        .filter(|gateway| !gateway.is_empty())
}

fn option_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl CreateNetworkRequest {
    fn option(&self, key: &str) -> Option<&Value> {
        self.options.as_ref()?.get(key)
    }

    /// The `-o key=value` driver options.
    fn generic_options(&self) -> HashMap<String, String> {
        self.option(GENERIC_OPTION)
            .and_then(Value::as_object)
            .map(|options| {
                options
                    .iter()
                    .map(|(key, value)| (key.clone(), option_text(value)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn internal(&self) -> bool {
        self.option(INTERNAL_OPTION)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// IPv4 gateway, else IPv6.
    fn gateway(&self) -> DovesnapResult<Option<Gateway>> {
        first_gateway(self.ipv4_data.as_ref())
            .or_else(|| first_gateway(self.ipv6_data.as_ref()))
            .map(Gateway::parse_cidr)
            .transpose()
    }

    /// Validated options of the new network.
    ///
    /// # Errors
    ///
    /// Returns the first invalid option.
    pub fn network_options(&self) -> DovesnapResult<NetworkOptions> {
        NetworkOptions::parse(
            &self.network_id,
            &self.generic_options(),
            self.internal(),
            self.gateway()?,
        )
    }
}

/// Requests naming only a network.
#[derive(Debug, Default, Deserialize)]
struct NetworkRequest {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
}

/// Requests naming an endpoint of a network.
#[derive(Debug, Default, Deserialize)]
struct EndpointRequest {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
    #[serde(rename = "EndpointID", default)]
    endpoint_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    proto: u8,
    port: u16,
    #[serde(rename = "HostIP", default)]
    host_ip: Option<String>,
    host_port: u16,
}

/// `NetworkDriver.Join`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "EndpointID")]
    endpoint_id: String,
    #[serde(default)]
    sandbox_key: String,
    #[serde(default)]
    options: Option<HashMap<String, Value>>,
}

impl JoinRequest {
    /// Host ports published by the joining container.
    ///
    /// # Errors
    ///
    /// Returns an error if the port map is malformed.
    pub fn published_ports(&self) -> DovesnapResult<Vec<PublishedPort>> {
        let Some(portmap) = self.options.as_ref().and_then(|o| o.get(PORTMAP_OPTION)) else {
            return Ok(Vec::new());
        };
        let bindings: Vec<PortBinding> = serde_json::from_value(portmap.clone())
            .map_err(|e| DovesnapError::Serialization(e.to_string()))?;
        Ok(bindings
            .into_iter()
            .filter_map(|binding| {
                let protocol = match binding.proto {
                    IPPROTO_TCP => Protocol::Tcp,
                    IPPROTO_UDP => Protocol::Udp,
                    other => {
                        tracing::warn!(proto = other, port = binding.port, "Unsupported protocol");
                        return None;
                    }
                };
                Some(PublishedPort {
                    protocol,
                    container_port: binding.port,
                    host_port: binding.host_port,
                    host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                })
            })
            .collect())
    }
}

async fn activate() -> Json<Value> {
    Json(json!({ "Implements": ["NetworkDriver"] }))
}

async fn capabilities() -> Json<Value> {
    Json(json!({ "Scope": "local", "ConnectivityScope": "local" }))
}

async fn create_network(State(handle): State<ManagerHandle>, body: Bytes) -> ApiResult {
    let request: CreateNetworkRequest = decode(&body)?;
    tracing::debug!(?request, "Create network request");
    handle.create_network(request.network_options()?).await?;
    Ok(Json(json!({})))
}

async fn delete_network(State(handle): State<ManagerHandle>, body: Bytes) -> ApiResult {
    let request: NetworkRequest = decode(&body)?;
    tracing::debug!(network_id = %request.network_id, "Delete network request");
    handle.delete_network(&request.network_id).await?;
    Ok(Json(json!({})))
}

async fn create_endpoint(body: Bytes) -> ApiResult {
    let request: EndpointRequest = decode(&body)?;
    tracing::debug!(
        network_id = %request.network_id,
        endpoint_id = %request.endpoint_id,
        "Create endpoint request"
    );
    Ok(Json(json!({})))
}

async fn endpoint_info() -> Json<Value> {
    Json(json!({ "Value": {} }))
}

async fn join(State(handle): State<ManagerHandle>, body: Bytes) -> ApiResult {
    let request: JoinRequest = decode(&body)?;
    tracing::debug!(
        network_id = %request.network_id,
        endpoint_id = %request.endpoint_id,
        sandbox = %request.sandbox_key,
        "Join request"
    );
    let published = request.published_ports()?;
    let info = handle
        .join(&request.network_id, &request.endpoint_id, published)
        .await?;
    Ok(Json(json!({
        "InterfaceName": {
            "SrcName": info.src_name,
            "DstPrefix": info.dst_prefix,
        },
        "Gateway": info.gateway.unwrap_or_default(),
    })))
}

async fn leave(State(handle): State<ManagerHandle>, body: Bytes) -> ApiResult {
    let request: EndpointRequest = decode(&body)?;
    tracing::debug!(
        network_id = %request.network_id,
        endpoint_id = %request.endpoint_id,
        "Leave request"
    );
    handle
        .leave(&request.network_id, &request.endpoint_id)
        .await?;
    Ok(Json(json!({})))
}

async fn allocate_network() -> Json<Value> {
    Json(json!({ "Options": {} }))
}

/// Calls with nothing to do beyond acknowledging them.
async fn acknowledge(body: Bytes) -> Json<Value> {
    tracing::debug!(body = %String::from_utf8_lossy(&body), "Acknowledged request");
    Json(json!({}))
}

/// The plugin API router.
pub fn router(handle: ManagerHandle) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(acknowledge))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.AllocateNetwork", post(allocate_network))
        .route("/NetworkDriver.FreeNetwork", post(acknowledge))
        .route("/NetworkDriver.DiscoverNew", post(acknowledge))
        .route("/NetworkDriver.DiscoverDelete", post(acknowledge))
        .route("/NetworkDriver.ProgramExternalConnectivity", post(acknowledge))
        .route("/NetworkDriver.RevokeExternalConnectivity", post(acknowledge))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the plugin API on `socket`, replacing a stale socket file.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or the server fails.
pub async fn serve(socket: &Path, handle: ManagerHandle) -> DovesnapResult<()> {
    if let Some(dir) = socket.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    match tokio::fs::remove_file(socket).await {
        Ok(()) => tracing::debug!(socket = %socket.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(socket)?;
    tracing::info!(socket = %socket.display(), "Plugin API listening");
    axum::serve(listener, router(handle)).await?;
    Ok(())
}
