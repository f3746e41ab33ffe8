use std::time::Duration;

use guestgen_contracts::{GuestError, HeaderSet, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::warn;

const ERROR_BODY_MAX_CHARS: usize = 512;

pub fn build_http_client(timeout: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| GuestError::transport(format!("failed to build http client: {err}")))
}

pub fn to_header_map(headers: &HeaderSet) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(value).ok());
        match parsed {
            Some((name, value)) => {
                map.insert(name, value);
            }
            None => warn!(header = name, "dropping header with invalid name or value"),
        }
    }
    map
}

pub fn transport_error(context: &str, err: reqwest::Error) -> GuestError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "failed"
    };
    GuestError::transport(format!("{context} {kind}: {err}"))
}

/// Maps a non-success status onto the error taxonomy; `Ok(response)` otherwise.
pub fn ensure_success(label: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response.text().unwrap_or_default();
    let message = format!(
        "{label} request failed ({code}): {}",
        truncate_text(&body, ERROR_BODY_MAX_CHARS)
    );
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GuestError::unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => GuestError::rate_limited(message),
        _ => GuestError::protocol(message),
    })
}

pub fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let response = ensure_success(label, response)?;
    let body = response
        .text()
        .map_err(|err| transport_error(&format!("{label} response body read"), err))?;
    serde_json::from_str(&body).map_err(|_| {
        GuestError::protocol(format!(
            "{label} returned invalid JSON payload: {}",
            truncate_text(&body, ERROR_BODY_MAX_CHARS)
        ))
    })
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
