//! Wire protocol: typed messages and length-prefixed framing.

mod codec;
mod message;

pub use codec::{FrameReader, FrameWriter};
pub use message::{
    CopyInRequest, CopyInResponse, CopyOutRequest, CopyOutResponse, CreateRequest,
    CreateResponse, DestroyRequest, DestroyResponse, EchoRequest, EchoResponse, ErrorResponse,
    HasHandle, InfoRequest, InfoResponse, LimitBandwidthRequest, LimitBandwidthResponse,
    LimitDiskRequest, LimitDiskResponse, LimitMemoryRequest, LimitMemoryResponse, LinkRequest,
    LinkResponse, ListRequest, ListResponse, NetInRequest, NetInResponse, NetOutRequest,
    NetOutResponse, PingRequest, PingResponse, Request, ResourceLimits, Response, RunRequest,
    RunResponse, SpawnRequest, SpawnResponse, StopRequest, StopResponse, StreamRequest,
    StreamResponse,
};
