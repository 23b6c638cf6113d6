//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the HTTP client and the Twilio REST client.

use crate::{config::Config, twilio::TwilioClient};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared HTTP client, used for the signed agent URL fetch.
    pub http: reqwest::Client,
    pub twilio: TwilioClient,
}
