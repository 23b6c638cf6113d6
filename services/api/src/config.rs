use reqwest::Url;
use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Externally reachable base URL of this service, used in the call
    /// callback URL and the media-stream URL handed to Twilio.
    pub public_url: Url,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
    pub elevenlabs_api_key: String,
    pub elevenlabs_agent_id: String,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5050".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let public_url_str =
            std::env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:5050".to_string());
        let public_url = public_url_str
            .parse::<Url>()
            .map_err(|e| ConfigError::InvalidValue("PUBLIC_URL".to_string(), e.to_string()))?;

        let twilio_account_sid = required("TWILIO_ACCOUNT_SID")?;
        let twilio_auth_token = required("TWILIO_AUTH_TOKEN")?;
        let twilio_phone_number = required("TWILIO_PHONE_NUMBER")?;
        let elevenlabs_api_key = required("ELEVENLABS_API_KEY")?;
        let elevenlabs_agent_id = required("ELEVENLABS_AGENT_ID")?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            public_url,
            twilio_account_sid,
            twilio_auth_token,
            twilio_phone_number,
            elevenlabs_api_key,
            elevenlabs_agent_id,
            log_level,
        })
    }
}
