use std::thread;
use std::time::Duration;

use guestgen_contracts::{BrowserConfig, GuestError, Result, RetryPolicy};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::TokenSource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser operation timed out: {0}")]
    Timeout(String),
    /// The session is unusable (socket closed, process gone) and must be relaunched.
    #[error("browser disconnected: {0}")]
    Disconnected(String),
    #[error("browser script failed: {0}")]
    Script(String),
}

impl BrowserError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::Disconnected(_))
    }
}

/// A controllable page in a real browser.
pub trait BrowserSession: Send {
    fn navigate(&mut self, url: &str, timeout: Duration) -> std::result::Result<(), BrowserError>;

    /// Blocks until `window[name]` is defined.
    fn wait_for_global(&mut self, name: &str, timeout: Duration) -> std::result::Result<(), BrowserError>;

    /// Evaluates `script` in the page, awaiting a returned promise.
    fn evaluate(&mut self, script: &str, timeout: Duration) -> std::result::Result<Value, BrowserError>;

    fn close(&mut self);

    fn is_alive(&mut self) -> bool;
}

pub trait BrowserLauncher: Send {
    fn launch(&self) -> std::result::Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Obtains tokens by running the verification module inside a browser page.
///
/// The browser is launched lazily on first use and reused afterwards; a
/// session that reports itself broken is dropped and relaunched on the next
/// acquisition.
pub struct BrowserTokenSource {
    launcher: Box<dyn BrowserLauncher>,
    session: Option<Box<dyn BrowserSession>>,
    config: BrowserConfig,
    landing_url: String,
    retry: RetryPolicy,
}

impl BrowserTokenSource {
    pub fn new(
        launcher: Box<dyn BrowserLauncher>,
        config: BrowserConfig,
        landing_url: String,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            launcher,
            session: None,
            config,
            landing_url,
            retry,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn session(&mut self) -> Result<&mut Box<dyn BrowserSession>> {
        let alive = match self.session.as_mut() {
            Some(session) => session.is_alive(),
            None => false,
        };
        if !alive {
            if let Some(mut stale) = self.session.take() {
                warn!("browser session is gone; relaunching");
                stale.close();
            }
            let session = self
                .launcher
                .launch()
                .map_err(|err| GuestError::token(err.to_string()))?;
            info!("browser session launched");
            self.session = Some(session);
        }
        self.session
            .as_mut()
            .ok_or_else(|| GuestError::token("browser session unavailable"))
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn run_attempts(&mut self) -> std::result::Result<Option<String>, BrowserError> {
        let landing_url = self.landing_url.clone();
        let config = self.config.clone();
        let retry = self.retry;
        let script = config.init_script();
        let session = match self.session() {
            Ok(session) => session,
            Err(err) => return Err(BrowserError::Launch(err.message().to_string())),
        };

        session.navigate(&landing_url, config.navigation_timeout)?;
        session.wait_for_global(&config.verification_global, config.global_timeout)?;

        let attempts = retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            match session.evaluate(&script, config.attempt_timeout) {
                Ok(Value::String(token)) if !token.trim().is_empty() => {
                    debug!(attempt, "verification module produced a token");
                    return Ok(Some(token.trim().to_string()));
                }
                Ok(other) => debug!(attempt, result = %other, "verification attempt returned no token"),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(attempt, error = %err, "verification attempt missed"),
            }
            if attempt < attempts && !retry.delay.is_zero() {
                thread::sleep(retry.delay);
            }
        }
        Ok(None)
    }
}

impl TokenSource for BrowserTokenSource {
    fn name(&self) -> &str {
        "browser"
    }

    fn acquire(&mut self) -> Result<String> {
        match self.run_attempts() {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(GuestError::token(format!(
                "verification module produced no token after {} attempts",
                self.retry.max_attempts.max(1)
            ))),
            Err(err) => {
                if err.is_fatal() {
                    self.drop_session();
                }
                Err(GuestError::token(err.to_string()))
            }
        }
    }

    fn shutdown(&mut self) {
        self.drop_session();
    }
}
