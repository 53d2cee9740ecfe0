//! RunCash relay: store poller, topic broadcaster and the viewer-facing
//! HTTP/WebSocket surface.

pub mod app;
pub mod http;
pub mod ws;
