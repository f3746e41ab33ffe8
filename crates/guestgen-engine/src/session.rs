use guestgen_contracts::config::IMAGE_CHAT_TYPE;
use guestgen_contracts::{
    GuestConfig, GuestError, RequestMetadata, Result, SessionHandle, VerificationToken,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use tracing::info;

use crate::headers::{HeaderOptions, HeaderSynthesizer};
use crate::http::{response_json_or_error, to_header_map, transport_error, truncate_text};
use crate::stream::RATE_LIMITED_CODE;

const SESSION_TITLE: &str = "新建对话";
const GUEST_CHAT_MODE: &str = "guest";

/// Opens chat sessions against the guest endpoint.
#[derive(Debug, Clone)]
pub struct SessionClient {
    http: HttpClient,
    synthesizer: HeaderSynthesizer,
    session_url: String,
    model: String,
}

impl SessionClient {
    pub fn new(http: HttpClient, synthesizer: HeaderSynthesizer, config: &GuestConfig) -> Self {
        Self {
            http,
            synthesizer,
            session_url: config.session_url(),
            model: config.default_model.clone(),
        }
    }

    /// Opens an image-generation session.
    pub fn open_session<F>(
        &self,
        metadata: &RequestMetadata,
        token: &VerificationToken,
        fingerprint: F,
    ) -> Result<SessionHandle>
    where
        F: FnOnce() -> String,
    {
        self.open_chat(IMAGE_CHAT_TYPE, metadata, token, fingerprint)
    }

    pub fn open_chat<F>(
        &self,
        chat_type: &str,
        metadata: &RequestMetadata,
        token: &VerificationToken,
        fingerprint: F,
    ) -> Result<SessionHandle>
    where
        F: FnOnce() -> String,
    {
        let headers = self.synthesizer.synthesize(
            metadata,
            token,
            &fingerprint(),
            HeaderOptions::session(),
            &mut rand::thread_rng(),
        );
        let body = session_body(&self.model, chat_type, metadata);

        let response = self
            .http
            .post(&self.session_url)
            .headers(to_header_map(&headers))
            .json(&body)
            .send()
            .map_err(|err| transport_error("session open", err))?;
        let payload = response_json_or_error("session open", response)?;
        let session = parse_session_response(&payload)?;
        info!(session_id = %session.id, chat_type, "session opened");
        Ok(session)
    }
}

pub fn session_body(model: &str, chat_type: &str, metadata: &RequestMetadata) -> Value {
    json!({
        "title": SESSION_TITLE,
        "models": [model],
        "chat_mode": GUEST_CHAT_MODE,
        "chat_type": chat_type,
        "timestamp": metadata.timestamp,
    })
}

/// Accepts only `{success: true, data: {id: <non-empty>}}`.
pub fn parse_session_response(payload: &Value) -> Result<SessionHandle> {
    let success = payload.get("success").and_then(Value::as_bool);
    let data = payload.get("data");
    if success == Some(true) {
        if let Some(id) = data
            .and_then(|data| data.get("id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            return Ok(SessionHandle::new(id));
        }
    }
    if success == Some(false) {
        let code = data
            .and_then(|data| data.get("code"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let details = data
            .and_then(|data| data.get("details"))
            .and_then(Value::as_str)
            .unwrap_or("no details");
        if code == RATE_LIMITED_CODE {
            return Err(GuestError::rate_limited(details.to_string()));
        }
    }
    Err(GuestError::protocol(format!(
        "session open failed: unexpected response shape: {}",
        truncate_text(&payload.to_string(), 240)
    )))
}
