//! faucetconfrpc wire messages (`faucetconfserver` package).

/// Service name used in request paths.
pub const SERVICE: &str = "faucetconfserver.FaucetConfServer";

#[allow(missing_docs)]
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetConfigFileRequest {
    #[prost(string, tag = "1")]
    pub config_yaml: String,
    #[prost(string, tag = "2")]
    pub config_filename: String,
    #[prost(bool, tag = "3")]
    pub merge: bool,
    #[prost(string, tag = "4")]
    pub del_config_yaml_keys: String,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct SetConfigFileReply {}

#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct InterfaceInfo {
    #[prost(uint32, tag = "1")]
    pub port_no: u32,
}

#[allow(missing_docs)]
#[derive(Clone, PartialEq, prost::Message)]
pub struct DpInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub interfaces: Vec<InterfaceInfo>,
}

#[allow(missing_docs)]
#[derive(Clone, PartialEq, prost::Message)]
pub struct DelDpsRequest {
    #[prost(message, repeated, tag = "1")]
    pub interfaces_config: Vec<DpInfo>,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct DelDpsReply {}

#[allow(missing_docs)]
#[derive(Clone, PartialEq, prost::Message)]
pub struct DelDpInterfacesRequest {
    #[prost(message, repeated, tag = "1")]
    pub interfaces_config: Vec<DpInfo>,
    #[prost(bool, tag = "2")]
    pub delete_empty_dp: bool,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct DelDpInterfacesReply {}

#[allow(missing_docs)]
#[derive(Clone, PartialEq, prost::Message)]
pub struct PortMirrorRequest {
    #[prost(string, tag = "1")]
    pub dp_name: String,
    #[prost(uint32, tag = "2")]
    pub port_no: u32,
    #[prost(uint32, tag = "3")]
    pub mirror_port_no: u32,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct PortMirrorReply {}

#[allow(missing_docs)]
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetRemoteMirrorPortRequest {
    #[prost(string, tag = "1")]
    pub dp_name: String,
    #[prost(uint32, tag = "2")]
    pub port_no: u32,
    #[prost(uint32, tag = "3")]
    pub tunnel_vid: u32,
    #[prost(string, tag = "4")]
    pub remote_dp_name: String,
    #[prost(uint32, tag = "5")]
    pub remote_port_no: u32,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct SetRemoteMirrorPortReply {}
