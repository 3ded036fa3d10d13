//! Typed request/response records and the tag->record envelope.
//!
//! A serde internally-tagged enum (`tag = "type", content = "payload"`)
//! gives the `{ type, payload }` envelope shape for free, with the tag
//! being the enum variant name, so there's no hand-written
//! tag-to-constructor table to maintain.

use serde::{Deserialize, Serialize};

/// Resource limits carried on Create/Spawn requests.
///
/// Effective value = request value if present, else the server
/// config's default if non-zero, else unset. Serialised to the child
/// process as `RLIMIT_<UPPERNAME>=<decimal>` env vars.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(rename = "as", skip_serializing_if = "Option::is_none", default)]
    pub as_: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub core: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cpu: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub locks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memlock: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub msgqueue: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nice: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nofile: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nproc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rss: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rtprio: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sigpending: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack: Option<i64>,
}

macro_rules! rlimit_fields {
    ($($field:ident => $name:literal),+ $(,)?) => {
        /// Layer this request's rlimits over `defaults`, producing the
        /// `RLIMIT_<NAME>=<value>` env vars for non-unset limits.
        pub fn env_vars(&self, defaults: &ResourceLimits) -> Vec<(String, String)> {
            let mut out = Vec::new();
            $(
                let effective = self.$field.or(defaults.$field.filter(|v| *v != 0));
                if let Some(v) = effective {
                    out.push((concat!("RLIMIT_", $name).to_string(), v.to_string()));
                }
            )+
            out
        }
    };
}

impl ResourceLimits {
    rlimit_fields! {
        as_ => "AS",
        core => "CORE",
        cpu => "CPU",
        data => "DATA",
        fsize => "FSIZE",
        locks => "LOCKS",
        memlock => "MEMLOCK",
        msgqueue => "MSGQUEUE",
        nice => "NICE",
        nofile => "NOFILE",
        nproc => "NPROC",
        rss => "RSS",
        rtprio => "RTPRIO",
        sigpending => "SIGPENDING",
        stack => "STACK",
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grace_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rlimits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateResponse {
    pub handle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    pub handle: String,
    #[serde(default)]
    pub kill: bool,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub handle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestroyResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoRequest {
    pub handle: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoResponse {
    pub state: String,
    pub host_ip: String,
    pub container_ip: String,
    pub container_path: String,
    pub job_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub handle: String,
    pub script: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rlimits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub job_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkRequest {
    pub handle: String,
    pub job_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// `Run` combines spawn+link into a single round trip: convenient for
/// short-lived scripts that don't need a separate link call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub handle: String,
    pub script: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rlimits: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// `Stream` hijacks like `Link` but is intended for callers that want
/// to attach mid-job; in this core it is link-equivalent (full replay
/// from byte zero) since true incremental streaming would need a
/// multi-frame response the opaque wire schema doesn't define here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    pub handle: String,
    pub job_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetInRequest {
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub host_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub container_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetInResponse {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetOutRequest {
    pub handle: String,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetOutResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyInRequest {
    pub handle: String,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyInResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyOutRequest {
    pub handle: String,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyOutResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitMemoryRequest {
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit_in_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitMemoryResponse {
    pub limit_in_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitDiskRequest {
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub byte_limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitDiskResponse {
    pub byte_limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitBandwidthRequest {
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub burst: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitBandwidthResponse {
    pub rate: u64,
    pub burst: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub handles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoRequest {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoResponse {
    pub message: String,
}

/// Requests that target an existing container carry a `handle`.
pub trait HasHandle {
    fn handle(&self) -> &str;
}

macro_rules! impl_has_handle {
    ($($t:ty),+ $(,)?) => {
        $(impl HasHandle for $t {
            fn handle(&self) -> &str { &self.handle }
        })+
    };
}

impl_has_handle!(
    StopRequest,
    DestroyRequest,
    InfoRequest,
    SpawnRequest,
    LinkRequest,
    RunRequest,
    StreamRequest,
    NetInRequest,
    NetOutRequest,
    CopyInRequest,
    CopyOutRequest,
    LimitMemoryRequest,
    LimitDiskRequest,
    LimitBandwidthRequest,
);

/// The envelope's tag selects a typed record. `Create` is the only
/// variant that doesn't require a pre-existing handle (it's how one
/// gets created in the first place).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    Create(CreateRequest),
    Stop(StopRequest),
    Destroy(DestroyRequest),
    Info(InfoRequest),
    Spawn(SpawnRequest),
    Link(LinkRequest),
    Run(RunRequest),
    Stream(StreamRequest),
    NetIn(NetInRequest),
    NetOut(NetOutRequest),
    CopyIn(CopyInRequest),
    CopyOut(CopyOutRequest),
    LimitMemory(LimitMemoryRequest),
    LimitDisk(LimitDiskRequest),
    LimitBandwidth(LimitBandwidthRequest),
    Ping(PingRequest),
    List(ListRequest),
    Echo(EchoRequest),
}

impl Request {
    /// The handle this request targets, if any (`Create`, `Ping`,
    /// `List`, `Echo` don't target an existing container).
    pub fn handle(&self) -> Option<&str> {
        match self {
            Request::Stop(r) => Some(r.handle()),
            Request::Destroy(r) => Some(r.handle()),
            Request::Info(r) => Some(r.handle()),
            Request::Spawn(r) => Some(r.handle()),
            Request::Link(r) => Some(r.handle()),
            Request::Run(r) => Some(r.handle()),
            Request::Stream(r) => Some(r.handle()),
            Request::NetIn(r) => Some(r.handle()),
            Request::NetOut(r) => Some(r.handle()),
            Request::CopyIn(r) => Some(r.handle()),
            Request::CopyOut(r) => Some(r.handle()),
            Request::LimitMemory(r) => Some(r.handle()),
            Request::LimitDisk(r) => Some(r.handle()),
            Request::LimitBandwidth(r) => Some(r.handle()),
            Request::Create(_) | Request::Ping(_) | Request::List(_) | Request::Echo(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Create(_) => "Create",
            Request::Stop(_) => "Stop",
            Request::Destroy(_) => "Destroy",
            Request::Info(_) => "Info",
            Request::Spawn(_) => "Spawn",
            Request::Link(_) => "Link",
            Request::Run(_) => "Run",
            Request::Stream(_) => "Stream",
            Request::NetIn(_) => "NetIn",
            Request::NetOut(_) => "NetOut",
            Request::CopyIn(_) => "CopyIn",
            Request::CopyOut(_) => "CopyOut",
            Request::LimitMemory(_) => "LimitMemory",
            Request::LimitDisk(_) => "LimitDisk",
            Request::LimitBandwidth(_) => "LimitBandwidth",
            Request::Ping(_) => "Ping",
            Request::List(_) => "List",
            Request::Echo(_) => "Echo",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Response {
    Error(ErrorResponse),
    Create(CreateResponse),
    Stop(StopResponse),
    Destroy(DestroyResponse),
    Info(InfoResponse),
    Spawn(SpawnResponse),
    Link(LinkResponse),
    Run(RunResponse),
    Stream(StreamResponse),
    NetIn(NetInResponse),
    NetOut(NetOutResponse),
    CopyIn(CopyInResponse),
    CopyOut(CopyOutResponse),
    LimitMemory(LimitMemoryResponse),
    LimitDisk(LimitDiskResponse),
    LimitBandwidth(LimitBandwidthResponse),
    Ping(PingResponse),
    List(ListResponse),
    Echo(EchoResponse),
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(ErrorResponse {
            message: message.into(),
            data: None,
        })
    }

    pub fn invalid_state(state: &str) -> Self {
        Self::error(format!("invalid state for this request: {}", state))
    }
}
