//! Viewer-facing wire contract: event frames, join/leave control messages,
//! push-stream line parsing and per-transport decoding into canonical events.

pub mod control;
pub mod decode;
pub mod frames;
pub mod sse;

pub use decode::DecodeError;
