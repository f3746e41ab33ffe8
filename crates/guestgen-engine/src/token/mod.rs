//! Verification token lifecycle: one cached token, single-flight acquisition,
//! and swappable acquisition strategies behind [`TokenSource`].

pub mod browser;
pub mod cdp;
pub mod endpoints;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use guestgen_contracts::events::{TOKEN_ACQUIRED, TOKEN_INVALIDATED};
use guestgen_contracts::{EventLog, EventPayload, GuestConfig, GuestError, Result, VerificationToken};
use serde_json::Value;
use tracing::{info, warn};

pub use browser::{BrowserError, BrowserLauncher, BrowserSession, BrowserTokenSource};
pub use cdp::{CdpLauncher, CdpSession};
pub use endpoints::{extract_token, EndpointTokenSource};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.origin + *offset
    }
}

/// One way of obtaining a fresh token value.
pub trait TokenSource: Send {
    fn name(&self) -> &str;

    fn acquire(&mut self) -> Result<String>;

    /// Releases long-lived resources. Called at most once by the oracle.
    fn shutdown(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStrategy {
    /// Browser first, endpoint chain as fallback.
    Auto,
    Browser,
    Endpoints,
}

pub fn build_token_source(config: &GuestConfig, strategy: TokenStrategy) -> Result<Box<dyn TokenSource>> {
    let browser = || {
        Box::new(BrowserTokenSource::new(
            Box::new(CdpLauncher::new(config.browser.clone())),
            config.browser.clone(),
            config.landing_url(),
            config.retry,
        )) as Box<dyn TokenSource>
    };
    let endpoints = || -> Result<Box<dyn TokenSource>> {
        Ok(Box::new(EndpointTokenSource::new(
            config.token_endpoints.clone(),
            config.endpoint_timeout,
        )?))
    };
    Ok(match strategy {
        TokenStrategy::Browser => browser(),
        TokenStrategy::Endpoints => endpoints()?,
        TokenStrategy::Auto => Box::new(FallbackTokenSource::new(vec![browser(), endpoints()?])),
    })
}

/// Tries each source in order; the first success wins.
pub struct FallbackTokenSource {
    sources: Vec<Box<dyn TokenSource>>,
}

impl FallbackTokenSource {
    pub fn new(sources: Vec<Box<dyn TokenSource>>) -> Self {
        Self { sources }
    }
}

impl TokenSource for FallbackTokenSource {
    fn name(&self) -> &str {
        "fallback"
    }

    fn acquire(&mut self) -> Result<String> {
        if self.sources.is_empty() {
            return Err(GuestError::token("no token sources configured"));
        }
        let mut failures = Vec::with_capacity(self.sources.len());
        for source in &mut self.sources {
            match source.acquire() {
                Ok(value) => {
                    info!(source = source.name(), "token source succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(source = source.name(), error = %err, "token source failed");
                    failures.push(format!("{}: {}", source.name(), err.message()));
                }
            }
        }
        Err(GuestError::token(format!(
            "all token sources failed ({})",
            failures.join("; ")
        )))
    }

    fn shutdown(&mut self) {
        for source in &mut self.sources {
            source.shutdown();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    Uninitialized,
    Initializing,
    Ready,
    Expired,
    Acquiring,
    Closed,
}

struct OracleState {
    source: Box<dyn TokenSource>,
    token: Option<VerificationToken>,
    had_token: bool,
    closed: bool,
    last_failure: Option<GuestError>,
}

#[derive(Debug, Clone, Copy)]
struct PhaseCell {
    phase: TokenPhase,
    expires_at: Option<Instant>,
}

/// Owns the current verification token.
///
/// Acquisition runs with the state lock held, so concurrent callers of
/// [`TokenOracle::get_token`] wait for the in-flight attempt and share its
/// outcome: the cached token on success, the same error on failure. A caller
/// arriving after an attempt has settled starts a new one. Phase lives in a
/// separate lock so it stays observable while an acquisition is running.
pub struct TokenOracle {
    state: Mutex<OracleState>,
    phase: Mutex<PhaseCell>,
    clock: Arc<dyn Clock>,
    validity: Duration,
    acquisitions: AtomicU64,
    settled: AtomicU64,
    events: Option<EventLog>,
}

impl TokenOracle {
    pub fn new(source: Box<dyn TokenSource>, validity: Duration) -> Self {
        Self::with_clock(source, validity, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Box<dyn TokenSource>, validity: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(OracleState {
                source,
                token: None,
                had_token: false,
                closed: false,
                last_failure: None,
            }),
            phase: Mutex::new(PhaseCell {
                phase: TokenPhase::Uninitialized,
                expires_at: None,
            }),
            clock,
            validity,
            acquisitions: AtomicU64::new(0),
            settled: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Number of acquisition attempts started so far.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> TokenPhase {
        let cell = *self.phase_cell();
        match (cell.phase, cell.expires_at) {
            (TokenPhase::Ready, Some(expires_at)) if self.clock.now() >= expires_at => {
                TokenPhase::Expired
            }
            (phase, _) => phase,
        }
    }

    pub fn get_token(&self) -> Result<VerificationToken> {
        // Attempts settled before this caller queued on the lock.
        let seen = self.settled.load(Ordering::SeqCst);
        let mut state = self
            .state
            .lock()
            .map_err(|_| GuestError::token("token oracle lock poisoned"))?;
        if state.closed {
            return Err(GuestError::token("token oracle is closed"));
        }
        if let Some(token) = &state.token {
            if token.is_valid_at(self.clock.now()) {
                return Ok(token.clone());
            }
            self.set_phase(TokenPhase::Expired, None);
        }
        if self.settled.load(Ordering::SeqCst) != seen {
            if let Some(err) = &state.last_failure {
                return Err(err.clone());
            }
        }

        let had_token = state.had_token;
        self.set_phase(
            if had_token {
                TokenPhase::Acquiring
            } else {
                TokenPhase::Initializing
            },
            None,
        );
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        state.token = None;

        let source_name = state.source.name().to_string();
        let acquired = state.source.acquire().and_then(|value| {
            let value = value.trim().to_string();
            if value.is_empty() {
                Err(GuestError::token(format!("{source_name} returned an empty token")))
            } else {
                Ok(value)
            }
        });

        let outcome = match acquired {
            Ok(value) => {
                let token = VerificationToken::new(value, self.clock.now(), self.validity);
                state.token = Some(token.clone());
                state.had_token = true;
                self.set_phase(TokenPhase::Ready, Some(token.expires_at));
                info!(source = %source_name, "verification token acquired");
                self.emit(TOKEN_ACQUIRED, |payload| {
                    payload.insert("source".to_string(), Value::String(source_name.clone()));
                    payload.insert(
                        "valid_for_secs".to_string(),
                        Value::from(self.validity.as_secs()),
                    );
                });
                Ok(token)
            }
            Err(err) => {
                self.set_phase(
                    if had_token {
                        TokenPhase::Expired
                    } else {
                        TokenPhase::Uninitialized
                    },
                    None,
                );
                warn!(source = %source_name, error = %err, "verification token acquisition failed");
                Err(match err {
                    GuestError::TokenAcquisition(_) => err,
                    other => GuestError::token(format!("{source_name}: {other}")),
                })
            }
        };
        state.last_failure = outcome.as_ref().err().cloned();
        self.settled.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Drops the cached token; the next `get_token` acquires a fresh one.
    pub fn invalidate(&self) {
        let mut state = self.lock_for_cleanup();
        if state.closed {
            return;
        }
        let dropped = state.token.take().is_some();
        state.last_failure = None;
        if state.had_token {
            self.set_phase(TokenPhase::Expired, None);
        }
        if dropped {
            info!("verification token invalidated");
            self.emit(TOKEN_INVALIDATED, |_| {});
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.lock_for_cleanup();
        if state.closed {
            return;
        }
        state.closed = true;
        state.token = None;
        state.source.shutdown();
        self.set_phase(TokenPhase::Closed, None);
    }

    fn lock_for_cleanup(&self) -> MutexGuard<'_, OracleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn phase_cell(&self) -> MutexGuard<'_, PhaseCell> {
        self.phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: TokenPhase, expires_at: Option<Instant>) {
        *self.phase_cell() = PhaseCell { phase, expires_at };
    }

    fn emit(&self, event_type: &str, fill: impl FnOnce(&mut EventPayload)) {
        let Some(events) = &self.events else {
            return;
        };
        let mut payload = EventPayload::new();
        fill(&mut payload);
        if let Err(err) = events.emit(event_type, payload) {
            warn!(event = event_type, error = %err, "failed to write event");
        }
    }
}

impl Drop for TokenOracle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use guestgen_contracts::{ErrorKind, GuestError, Result};

    use super::{FallbackTokenSource, ManualClock, TokenOracle, TokenPhase, TokenSource};

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        shut_down: Arc<AtomicBool>,
    }

    impl CountingSource {
        fn new(delay: Duration) -> (Self, Arc<AtomicUsize>, Arc<AtomicBool>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let shut_down = Arc::new(AtomicBool::new(false));
            (
                Self {
                    calls: Arc::clone(&calls),
                    delay,
                    shut_down: Arc::clone(&shut_down),
                },
                calls,
                shut_down,
            )
        }
    }

    impl TokenSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn acquire(&mut self) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(self.delay);
            Ok(format!("tok-{n}"))
        }

        fn shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    struct FailingSource {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl TokenSource for FailingSource {
        fn name(&self) -> &str {
            self.name
        }

        fn acquire(&mut self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GuestError::transport(format!("{} unreachable", self.name)))
        }
    }

    struct FixedSource(&'static str);

    impl TokenSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        fn acquire(&mut self) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn concurrent_callers_share_one_acquisition() {
        let (source, calls, _) = CountingSource::new(Duration::from_millis(50));
        let oracle = Arc::new(TokenOracle::new(Box::new(source), Duration::from_secs(600)));
        let barrier = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let oracle = Arc::clone(&oracle);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    oracle.get_token().map(|token| token.value)
                })
            })
            .collect::<Vec<_>>();

        let values = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked"))
            .collect::<Result<Vec<String>>>()
            .expect("token acquisition failed");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(oracle.acquisitions(), 1);
        assert!(values.iter().all(|value| value == "tok-1"));
        assert_eq!(oracle.phase(), TokenPhase::Ready);
    }

    struct SlowFailingSource {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl TokenSource for SlowFailingSource {
        fn name(&self) -> &str {
            "browser"
        }

        fn acquire(&mut self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Err(GuestError::token("verification module never loaded"))
        }
    }

    #[test]
    fn concurrent_callers_share_one_failed_acquisition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let oracle = Arc::new(TokenOracle::new(
            Box::new(SlowFailingSource {
                calls: Arc::clone(&calls),
                delay: Duration::from_millis(200),
            }),
            Duration::from_secs(600),
        ));
        let barrier = Arc::new(Barrier::new(4));

        let started = Instant::now();
        let handles = (0..4)
            .map(|_| {
                let oracle = Arc::clone(&oracle);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    oracle.get_token()
                })
            })
            .collect::<Vec<_>>();
        let errors = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread panicked").expect_err("must fail"))
            .collect::<Vec<GuestError>>();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(oracle.acquisitions(), 1);
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(errors
            .iter()
            .all(|err| err.message() == "verification module never loaded"));

        // A later caller starts a fresh attempt.
        assert!(oracle.get_token().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn token_expires_after_validity_window() {
        let (source, calls, _) = CountingSource::new(Duration::ZERO);
        let clock = Arc::new(ManualClock::new());
        let oracle = TokenOracle::with_clock(Box::new(source), Duration::from_secs(60), clock.clone());

        assert_eq!(oracle.phase(), TokenPhase::Uninitialized);
        assert_eq!(oracle.get_token().expect("first").value, "tok-1");
        clock.advance(Duration::from_secs(59));
        assert_eq!(oracle.get_token().expect("cached").value, "tok-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(oracle.phase(), TokenPhase::Expired);
        assert_eq!(oracle.get_token().expect("refreshed").value, "tok-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let oracle = TokenOracle::new(
            Box::new(FailingSource {
                name: "browser",
                calls: Arc::clone(&calls),
            }),
            Duration::from_secs(60),
        );

        let err = oracle.get_token().expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::TokenAcquisition);
        assert!(err.message().contains("browser unreachable"));
        assert_eq!(oracle.phase(), TokenPhase::Uninitialized);

        assert!(oracle.get_token().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(oracle.acquisitions(), 2);
    }

    #[test]
    fn empty_token_is_rejected() {
        let oracle = TokenOracle::new(Box::new(FixedSource("   ")), Duration::from_secs(60));
        let err = oracle.get_token().expect_err("empty token");
        assert_eq!(err.kind(), ErrorKind::TokenAcquisition);
    }

    #[test]
    fn invalidate_forces_reacquisition() {
        let (source, calls, _) = CountingSource::new(Duration::ZERO);
        let oracle = TokenOracle::new(Box::new(source), Duration::from_secs(600));

        assert_eq!(oracle.get_token().expect("first").value, "tok-1");
        oracle.invalidate();
        assert_eq!(oracle.phase(), TokenPhase::Expired);
        assert_eq!(oracle.get_token().expect("second").value, "tok-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shutdown_closes_oracle_and_releases_source() {
        let (source, _, shut_down) = CountingSource::new(Duration::ZERO);
        let oracle = TokenOracle::new(Box::new(source), Duration::from_secs(600));
        oracle.get_token().expect("token");

        oracle.shutdown();
        assert!(shut_down.load(Ordering::SeqCst));
        assert_eq!(oracle.phase(), TokenPhase::Closed);
        let err = oracle.get_token().expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::TokenAcquisition);
    }

    #[test]
    fn drop_releases_source() {
        let (source, _, shut_down) = CountingSource::new(Duration::ZERO);
        {
            let _oracle = TokenOracle::new(Box::new(source), Duration::from_secs(600));
        }
        assert!(shut_down.load(Ordering::SeqCst));
    }

    #[test]
    fn fallback_uses_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut fallback = FallbackTokenSource::new(vec![
            Box::new(FailingSource {
                name: "browser",
                calls: Arc::clone(&calls),
            }),
            Box::new(FixedSource("endpoint-token")),
        ]);
        assert_eq!(fallback.acquire().expect("fallback"), "endpoint-token");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_lists_every_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut fallback = FallbackTokenSource::new(vec![
            Box::new(FailingSource {
                name: "browser",
                calls: Arc::clone(&calls),
            }),
            Box::new(FailingSource {
                name: "endpoints",
                calls: Arc::clone(&calls),
            }),
        ]);
        let err = fallback.acquire().expect_err("all fail");
        assert_eq!(err.kind(), ErrorKind::TokenAcquisition);
        assert!(err.message().contains("browser: browser unreachable"));
        assert!(err.message().contains("endpoints: endpoints unreachable"));
    }
}
