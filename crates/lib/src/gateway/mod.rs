//! Gateway: HTTP + WebSocket control plane.
//!
//! Single port serves HTTP and WebSocket. Protocol: first frame must be `connect`;
//! then requests (req/res) and events (`session.state`, `dispatch.progress`,
//! `dispatch.completed`, `shutdown`). The bridge posts connection signals to `/bridge/events`.

mod protocol;
mod server;

pub use protocol::{
    ConnectAuth, ConnectClient, ConnectParams, GrantParams, HelloOk, HelloPolicy, JobParams, SendParams,
    TenantParams, WsEvent, WsRequest, WsResponse,
};
pub use server::{router, run_gateway, GatewayState};
