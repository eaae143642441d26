//! chattr: a single-room, real-time group chat server.
//!
//! Clients speak JSON events over a WebSocket. Each connection is an actor
//! that passes joins and messages through the session registry, rate limiter
//! and message pipeline, and the broadcast router fans the results out.

pub mod admin;
pub mod companion;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod gate;
pub mod model;
pub mod msgid;
pub mod pipeline;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod sanitize;
pub mod server;
pub mod web;
