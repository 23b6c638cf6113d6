//! Voicebridge API Library Crate
//!
//! This library contains all the core logic for the voicebridge service:
//! configuration, application state, REST handlers for call placement and
//! call routing, and the WebSocket relay that bridges a live phone call to a
//! conversational AI agent. The `api` binary is a thin wrapper around this
//! library.

pub mod audio;
pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod twilio;
pub mod ws;
