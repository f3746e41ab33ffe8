//! End-to-end guest generation: token, session, completion request, stream decode.

use std::sync::Arc;
use std::thread;

use guestgen_contracts::config::IMAGE_CHAT_TYPE;
use guestgen_contracts::events::{
    payload, ARTIFACT_RESOLVED, BATCH_ITEM_SKIPPED, GENERATION_FAILED, GENERATION_STARTED,
    SESSION_OPENED,
};
use guestgen_contracts::{
    BatchOutcome, EventLog, EventPayload, GenerationRequest, GenerationResult, GuestConfig,
    GuestError, RequestMetadata, Result, SessionHandle, SizeSelector,
};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::headers::{browser_fingerprint, HeaderOptions, HeaderSynthesizer};
use crate::http::{build_http_client, ensure_success, to_header_map, transport_error};
use crate::session::SessionClient;
use crate::stream::{decode_reader, ArtifactMatcher, StreamDecoder};
use crate::token::TokenOracle;

const GUEST_CHAT_MODE: &str = "guest";

pub struct GenerationOrchestrator {
    config: GuestConfig,
    http: HttpClient,
    synthesizer: HeaderSynthesizer,
    sessions: SessionClient,
    oracle: Arc<TokenOracle>,
    sizes: SizeSelector,
    matcher: ArtifactMatcher,
    events: EventLog,
}

impl GenerationOrchestrator {
    pub fn new(config: GuestConfig, oracle: Arc<TokenOracle>) -> Result<Self> {
        let http = build_http_client(config.timeout)?;
        let synthesizer = HeaderSynthesizer::new(&config);
        let sessions = SessionClient::new(http.clone(), synthesizer.clone(), &config);
        let sizes = SizeSelector::new(&config.supported_sizes, &config.default_size);
        Ok(Self {
            config,
            http,
            synthesizer,
            sessions,
            oracle,
            sizes,
            matcher: ArtifactMatcher::default(),
            events: EventLog::disabled("guestgen"),
        })
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_matcher(mut self, matcher: ArtifactMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &GuestConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Arc<TokenOracle> {
        &self.oracle
    }

    pub fn create_session(&self, chat_type: &str) -> Result<SessionHandle> {
        let token = self.guard(self.oracle.get_token())?;
        let metadata = RequestMetadata::generate();
        let now_ms = metadata.timestamp;
        let session = self.guard(self.sessions.open_chat(chat_type, &metadata, &token, || {
            browser_fingerprint(&mut rand::thread_rng(), now_ms)
        }))?;
        self.emit(
            SESSION_OPENED,
            payload([
                ("session_id", Value::String(session.id.clone())),
                ("chat_type", Value::String(chat_type.to_string())),
            ]),
        );
        Ok(session)
    }

    pub fn generate_once(&self, prompt: &str, size: Option<&str>) -> Result<GenerationResult> {
        let prompt = require_text("prompt", prompt)?;
        let size = self.select_size(size);
        let result = self
            .create_session(IMAGE_CHAT_TYPE)
            .and_then(|session| self.submit(&session.id, prompt, &size));
        self.record(prompt, &size, result)
    }

    pub fn generate_with_existing_session(
        &self,
        session_id: &str,
        prompt: &str,
        size: Option<&str>,
    ) -> Result<GenerationResult> {
        let session_id = require_text("session id", session_id)?;
        let prompt = require_text("prompt", prompt)?;
        let size = self.select_size(size);
        let result = self.submit(session_id, prompt, &size);
        self.record(prompt, &size, result)
    }

    /// Runs requests one after another; per-item failures are captured, not raised.
    pub fn generate_batch(&self, requests: &[GenerationRequest]) -> Result<Vec<BatchOutcome>> {
        if requests.is_empty() {
            return Err(GuestError::validation("batch must contain at least one request"));
        }
        let mut outcomes = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            if request.prompt.trim().is_empty() {
                warn!(index, "skipping batch item with empty prompt");
                self.emit(BATCH_ITEM_SKIPPED, payload([("index", Value::from(index))]));
                continue;
            }

            info!(index, prompt = %request.prompt, "processing batch item");
            let outcome = match self.generate_once(&request.prompt, request.size.as_deref()) {
                Ok(result) => BatchOutcome::Succeeded(result),
                Err(err) => BatchOutcome::Failed {
                    prompt: request.prompt.clone(),
                    error: err.to_string(),
                },
            };
            outcomes.push(outcome);

            let is_last = index + 1 == requests.len();
            if !is_last && !self.config.batch_pause.is_zero() {
                thread::sleep(self.config.batch_pause);
            }
        }
        Ok(outcomes)
    }

    fn select_size(&self, requested: Option<&str>) -> String {
        let selection = self.sizes.select(requested);
        if let Some(reason) = &selection.fallback_reason {
            warn!("{reason}");
        }
        selection.size
    }

    fn submit(&self, session_id: &str, prompt: &str, size: &str) -> Result<GenerationResult> {
        let token = self.guard(self.oracle.get_token())?;
        let metadata = RequestMetadata::generate();
        let fingerprint = browser_fingerprint(&mut rand::thread_rng(), metadata.timestamp);
        let headers = self.synthesizer.synthesize(
            &metadata,
            &token,
            &fingerprint,
            HeaderOptions::completion(),
            &mut rand::thread_rng(),
        );
        let body = completion_body(
            &self.config.default_model,
            session_id,
            prompt,
            size,
            &metadata,
            &Uuid::new_v4().to_string(),
        );

        self.emit(
            GENERATION_STARTED,
            payload([
                ("session_id", Value::String(session_id.to_string())),
                ("prompt", Value::String(prompt.to_string())),
                ("size", Value::String(size.to_string())),
            ]),
        );
        info!(session_id, size, "submitting generation request");

        let response = self
            .http
            .post(self.config.completions_url())
            .query(&[("chat_id", session_id)])
            .headers(to_header_map(&headers))
            .json(&body)
            .send()
            .map_err(|err| transport_error("completion", err));
        let response = self.guard(response.and_then(|response| ensure_success("completion", response)))?;

        let mut decoder = StreamDecoder::new(self.matcher.clone());
        let artifact_url = decode_reader(response, &mut decoder)?;
        Ok(GenerationResult {
            session_id: session_id.to_string(),
            artifact_url,
            prompt: prompt.to_string(),
            size: size.to_string(),
        })
    }

    fn record(
        &self,
        prompt: &str,
        size: &str,
        result: Result<GenerationResult>,
    ) -> Result<GenerationResult> {
        match &result {
            Ok(generated) => {
                info!(url = %generated.artifact_url, "artifact resolved");
                self.emit(
                    ARTIFACT_RESOLVED,
                    payload([
                        ("session_id", Value::String(generated.session_id.clone())),
                        ("artifact_url", Value::String(generated.artifact_url.clone())),
                        ("prompt", Value::String(prompt.to_string())),
                        ("size", Value::String(size.to_string())),
                    ]),
                );
            }
            Err(err) => {
                warn!(error = %err, "generation failed");
                self.emit(
                    GENERATION_FAILED,
                    payload([
                        ("prompt", Value::String(prompt.to_string())),
                        ("size", Value::String(size.to_string())),
                        ("error", Value::String(err.to_string())),
                        ("kind", Value::String(format!("{:?}", err.kind()))),
                    ]),
                );
            }
        }
        result
    }

    /// A rejected token is dropped so the next call acquires a fresh one.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(GuestError::Unauthorized(message)) = &result {
            warn!(%message, "service rejected the verification token");
            self.oracle.invalidate();
        }
        result
    }

    fn emit(&self, event_type: &str, fields: EventPayload) {
        if let Err(err) = self.events.emit(event_type, fields) {
            warn!(event = event_type, error = %err, "failed to write event");
        }
    }
}

fn require_text<'a>(label: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(GuestError::validation(format!("{label} must not be empty")));
    }
    Ok(value)
}

pub fn completion_body(
    model: &str,
    chat_id: &str,
    prompt: &str,
    size: &str,
    metadata: &RequestMetadata,
    message_id: &str,
) -> Value {
    let timestamp = metadata.timestamp_secs();
    json!({
        "stream": true,
        "incremental_output": true,
        "chat_id": chat_id,
        "chat_mode": GUEST_CHAT_MODE,
        "model": model,
        "parent_id": null,
        "messages": [{
            "fid": message_id,
            "parentId": null,
            "childrenIds": [],
            "role": "user",
            "content": prompt,
            "user_action": "chat",
            "files": [],
            "timestamp": timestamp,
            "models": [model],
            "chat_type": IMAGE_CHAT_TYPE,
            "feature_config": {
                "thinking_enabled": false,
                "output_schema": "phase"
            },
            "extra": {
                "meta": {
                    "subChatType": IMAGE_CHAT_TYPE
                }
            },
            "sub_chat_type": IMAGE_CHAT_TYPE,
            "parent_id": null
        }],
        "timestamp": timestamp,
        "size": size
    })
}
