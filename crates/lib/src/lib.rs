//! Herald core library: per-tenant channel sessions, recipient resolution, bulk dispatch
//! and the gateway used by the CLI.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod init;
pub mod message;
pub mod recipients;
pub mod session;
