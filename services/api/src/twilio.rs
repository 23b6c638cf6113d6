//! Twilio REST client and call-routing document generation.
//!
//! Call placement is a plain request/response against the Twilio REST API;
//! the returned TwiML instructs Twilio to open a media-stream WebSocket back
//! to this service with the caller-supplied parameters attached.

use crate::config::Config;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::info;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Errors surfaced by the Twilio REST API when placing a call.
#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("Twilio rejected the call request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("Twilio API unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct CallCreated {
    sid: String,
}

/// Thin client for the Twilio REST API, scoped to outbound call placement.
#[derive(Clone)]
pub struct TwilioClient {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    public_url: Url,
}

impl TwilioClient {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self {
            http,
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            from_number: config.twilio_phone_number.clone(),
            public_url: config.public_url.clone(),
        }
    }

    /// Places an outbound call. Twilio will fetch call instructions from this
    /// service's `/connect` endpoint, with the prompt and opening line carried
    /// in the query string.
    ///
    /// Returns the Twilio call SID on success.
    pub async fn place_call(
        &self,
        to: &str,
        prompt: Option<&str>,
        initial_script: Option<&str>,
    ) -> Result<String, TwilioError> {
        let mut callback = self.public_url.clone();
        callback.set_path("/connect");
        callback
            .query_pairs_mut()
            .append_pair("prompt", prompt.unwrap_or_default())
            .append_pair("initialScript", initial_script.unwrap_or_default());

        let response = self
            .http
            .post(format!(
                "{}/Accounts/{}/Calls.json",
                TWILIO_API_BASE, self.account_sid
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", self.from_number.as_str()),
                ("Url", callback.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TwilioError::Rejected { status, body });
        }

        let created: CallCreated = response.json().await?;
        info!(call_sid = %created.sid, "Call initiated");
        Ok(created.sid)
    }
}

/// Derives the WebSocket media-stream URL from the service's public URL.
pub fn media_stream_url(public_url: &Url) -> String {
    let scheme = if public_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    let host = public_url.host_str().unwrap_or("localhost");
    match public_url.port() {
        Some(port) => format!("{scheme}://{host}:{port}/media-stream"),
        None => format!("{scheme}://{host}/media-stream"),
    }
}

/// Renders the TwiML document that connects the answered call to the
/// media-stream endpoint, attaching the prompt and opening line as
/// custom stream parameters.
pub fn connect_twiml(public_url: &Url, prompt: Option<&str>, initial_script: Option<&str>) -> String {
    let stream_url = media_stream_url(public_url);
    let mut parameters = String::new();
    if let Some(prompt) = prompt {
        parameters.push_str(&format!(
            "\n      <Parameter name=\"prompt\" value=\"{}\"/>",
            xml_escape(prompt)
        ));
    }
    if let Some(script) = initial_script {
        parameters.push_str(&format!(
            "\n      <Parameter name=\"initialScript\" value=\"{}\"/>",
            xml_escape(script)
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Say>Connecting to AI assistant...</Say>
  <Connect>
    <Stream url="{stream_url}">{parameters}
    </Stream>
  </Connect>
</Response>"#
    )
}

/// Escapes a string for use inside an XML attribute value.
fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().expect("test URL should parse")
    }

    #[test]
    fn test_media_stream_url_schemes() {
        assert_eq!(
            media_stream_url(&url("https://bridge.example.com")),
            "wss://bridge.example.com/media-stream"
        );
        assert_eq!(
            media_stream_url(&url("http://localhost:5050")),
            "ws://localhost:5050/media-stream"
        );
    }

    #[test]
    fn test_connect_twiml_shape() {
        let twiml = connect_twiml(
            &url("https://bridge.example.com"),
            Some("You are a helpful agent"),
            Some("Hello there!"),
        );

        assert!(twiml.contains("<Say>Connecting to AI assistant...</Say>"));
        assert!(twiml.contains(r#"<Stream url="wss://bridge.example.com/media-stream">"#));
        assert!(twiml.contains(r#"<Parameter name="prompt" value="You are a helpful agent"/>"#));
        assert!(twiml.contains(r#"<Parameter name="initialScript" value="Hello there!"/>"#));
    }

    #[test]
    fn test_connect_twiml_without_parameters() {
        let twiml = connect_twiml(&url("http://localhost:5050"), None, None);
        assert!(!twiml.contains("<Parameter"));
        assert!(twiml.contains(r#"<Stream url="ws://localhost:5050/media-stream">"#));
    }

    #[test]
    fn test_connect_twiml_escapes_attribute_values() {
        let twiml = connect_twiml(
            &url("https://bridge.example.com"),
            Some(r#"Tom & Jerry <"cartoons">"#),
            None,
        );
        assert!(twiml.contains("Tom &amp; Jerry &lt;&quot;cartoons&quot;&gt;"));
        assert!(!twiml.contains(r#"value="Tom & Jerry"#));
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a&b"), "a&amp;b");
        assert_eq!(xml_escape("<tag>"), "&lt;tag&gt;");
        assert_eq!(xml_escape("it's \"quoted\""), "it&apos;s &quot;quoted&quot;");
        assert_eq!(xml_escape("plain"), "plain");
    }
}
