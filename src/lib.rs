//! Room-based realtime messaging relay: chat, emoji reactions, and
//! WebRTC call signaling over WebSockets.

pub mod messages;
pub mod room;
pub mod server;
