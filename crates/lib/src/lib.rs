//! Trivia core library: live game sessions over WebSocket, the upstream content
//! service client, configuration, and the HTTP server.

pub mod config;
pub mod content;
pub mod game;
pub mod server;
