//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests: placing an
//! outbound call and serving the call-routing TwiML document.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::{
    state::AppState,
    twilio::{self, TwilioError},
};

pub enum ApiError {
    BadRequest(String),
    UpstreamFailure(String),
    InternalServerError(anyhow::Error),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(error) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
            }
            ApiError::UpstreamFailure(error) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { error })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let error = "An internal server error occurred.".to_string();
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error }))
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

#[derive(Deserialize, Debug)]
pub struct MakeCallPayload {
    pub to: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, rename = "initialScript")]
    pub initial_script: Option<String>,
}

#[derive(Serialize)]
pub struct MakeCallResponse {
    pub call_sid: String,
    pub message: String,
}

/// Place an outbound call that will be bridged to the conversational agent.
pub async fn make_call(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MakeCallPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.to.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Phone number (\"to\") is required".to_string(),
        ));
    }

    let call_sid = state
        .twilio
        .place_call(
            &payload.to,
            payload.prompt.as_deref(),
            payload.initial_script.as_deref(),
        )
        .await
        .map_err(|e| match e {
            TwilioError::Rejected { .. } => ApiError::UpstreamFailure(e.to_string()),
            TwilioError::Transport(_) => ApiError::InternalServerError(e.into()),
        })?;

    Ok(Json(MakeCallResponse {
        call_sid,
        message: "Call initiated successfully".to_string(),
    }))
}

#[derive(Deserialize, Debug)]
pub struct ConnectParams {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, rename = "initialScript")]
    pub initial_script: Option<String>,
}

/// Serve the call-routing document Twilio fetches when the call is answered.
/// It connects the call to this service's media-stream endpoint and attaches
/// the prompt and opening line as stream parameters.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    let document = twilio::connect_twiml(
        &state.config.public_url,
        params.prompt.as_deref(),
        params.initial_script.as_deref(),
    );

    ([(header::CONTENT_TYPE, "text/xml")], document)
}

pub async fn health() -> &'static str {
    "ok"
}
