use std::sync::OnceLock;
use std::time::Duration;

use guestgen_contracts::{GuestError, Result};
use regex::Regex;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use tracing::{info, warn};

use super::TokenSource;
use crate::http::{build_http_client, ensure_success, transport_error, truncate_text};

const ENDPOINT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const ENDPOINT_REFERER: &str = "https://www.alibaba.com/";

fn token_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [r"umx\.wu\('([^']+)'\)", r"__fycb\('([^']+)'\)"]
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

/// Pulls the token out of an endpoint's script-like response body.
pub fn extract_token(body: &str) -> Option<String> {
    token_patterns().iter().find_map(|pattern| {
        pattern
            .captures(body)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().to_string())
    })
}

/// Plain-HTTP token source: each endpoint in priority order, first success wins.
pub struct EndpointTokenSource {
    http: HttpClient,
    endpoints: Vec<String>,
}

impl EndpointTokenSource {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            endpoints,
        })
    }

    fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .headers(endpoint_headers())
            .send()
            .map_err(|err| transport_error(&format!("GET {url}"), err))?;
        let body = ensure_success(url, response)?
            .text()
            .map_err(|err| transport_error(&format!("GET {url} body read"), err))?;
        extract_token(&body).ok_or_else(|| {
            GuestError::protocol(format!(
                "no token in response from {url}: {}",
                truncate_text(&body, 120)
            ))
        })
    }
}

impl TokenSource for EndpointTokenSource {
    fn name(&self) -> &str {
        "endpoints"
    }

    fn acquire(&mut self) -> Result<String> {
        let mut failures = Vec::new();
        for url in &self.endpoints {
            match self.fetch(url) {
                Ok(token) => {
                    info!(url = %url, "token endpoint answered");
                    return Ok(token);
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "token endpoint failed");
                    failures.push(err.to_string());
                }
            }
        }
        Err(GuestError::token(format!(
            "all token endpoints failed ({})",
            failures.join("; ")
        )))
    }
}

fn endpoint_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(ENDPOINT_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    headers.insert(REFERER, HeaderValue::from_static(ENDPOINT_REFERER));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-site"));
    headers
}
