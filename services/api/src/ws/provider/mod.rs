//! Manages the agent-side WebSocket connection for one call.

pub mod elevenlabs;

use super::session::CallLeg;
use crate::state::AppState;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::error;

/// An internal event passed to the active agent connection task.
#[derive(Debug)]
pub enum AgentCommand {
    /// A chunk of caller audio, already decoded from base64.
    UserAudio(Bytes),
    /// Close the agent connection.
    Hangup,
}

/// Spawns the agent connection task for one call.
///
/// The task fetches a signed connection URL, opens the agent WebSocket, sends
/// the initiation handshake built from the call's custom parameters, and then
/// relays events until the call ends.
///
/// # Returns
/// A `mpsc::Sender` for routing `AgentCommand`s to the task. Dropping the
/// sender (or sending `Hangup`) ends the task.
pub fn start_agent_session(
    state: Arc<AppState>,
    params: HashMap<String, String>,
    call_leg: Arc<Mutex<CallLeg>>,
) -> mpsc::Sender<AgentCommand> {
    let (tx, rx) = mpsc::channel(128);

    tokio::spawn(async move {
        if let Err(e) = elevenlabs::run(&state, params, rx, call_leg).await {
            // A failed agent leg leaves the call running in silence; the
            // telephony leg decides when the call ends.
            error!(error = ?e, "Agent session task failed");
        }
    });

    tx
}
