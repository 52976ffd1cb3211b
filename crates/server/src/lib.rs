//! The drawlatch remote server: HTTP endpoints for handshake and sealed
//! requests, the session table, the per-caller tool surface, and the CLI.

pub mod api;
pub mod cli;
pub mod ratelimit;
pub mod sessions;
pub mod state;
pub mod tools;
