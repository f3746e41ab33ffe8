//! Minimal Chrome DevTools Protocol driver for a headless Chromium page.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use guestgen_contracts::BrowserConfig;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use tempfile::TempDir;
use tracing::{debug, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use super::browser::{BrowserError, BrowserLauncher, BrowserSession};

const DEVTOOLS_PORT_FILE: &str = "DevToolsActivePort";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const STARTUP_POLL: Duration = Duration::from_millis(100);
const TARGET_LIST_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(200);
const SETUP_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const GLOBAL_PROBE_INTERVAL_MS: u64 = 100;
const GLOBAL_PROBE_SLACK: Duration = Duration::from_secs(2);
const BUFFERED_EVENTS_MAX: usize = 128;

type CdpSocket = WebSocket<MaybeTlsStream<TcpStream>>;

pub struct CdpLauncher {
    config: BrowserConfig,
}

impl CdpLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

impl BrowserLauncher for CdpLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        CdpSession::launch(&self.config)
            .map(|session| Box::new(session) as Box<dyn BrowserSession>)
            .map_err(|err| BrowserError::Launch(error_chain_message(&err)))
    }
}

/// One browser process with one attached page target.
pub struct CdpSession {
    child: Option<Child>,
    profile: Option<TempDir>,
    socket: Option<CdpSocket>,
    next_id: u64,
    events: VecDeque<Value>,
}

impl CdpSession {
    pub fn launch(config: &BrowserConfig) -> anyhow::Result<Self> {
        let profile = tempfile::Builder::new()
            .prefix("guestgen-browser-")
            .tempdir()
            .context("failed to create browser profile directory")?;
        let mut child = spawn_browser(config, profile.path())?;

        let socket = match attach_page(&mut child, profile.path()) {
            Ok(socket) => socket,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        let mut session = Self {
            child: Some(child),
            profile: Some(profile),
            socket: Some(socket),
            next_id: 0,
            events: VecDeque::new(),
        };
        session
            .command("Page.enable", json!({}), SETUP_COMMAND_TIMEOUT)
            .map_err(|err| anyhow!("failed to enable page domain: {err}"))?;
        Ok(session)
    }

    fn command(&mut self, method: &str, params: Value, timeout: Duration) -> Result<Value, BrowserError> {
        self.next_id += 1;
        let id = self.next_id;
        let deadline = Instant::now() + timeout;
        let payload = json!({ "id": id, "method": method, "params": params });
        self.send(&payload)?;

        loop {
            let Some(message) = self.next_message(deadline)? else {
                return Err(BrowserError::Timeout(format!(
                    "{method} did not answer within {}ms",
                    timeout.as_millis()
                )));
            };
            match message.get("id").and_then(Value::as_u64) {
                Some(reply_id) if reply_id == id => return command_result(method, &message),
                Some(reply_id) => debug!(reply_id, "discarding stale devtools response"),
                None => self.buffer_event(message),
            }
        }
    }

    fn wait_event(&mut self, method: &str, deadline: Instant) -> Result<Value, BrowserError> {
        if let Some(pos) = self.events.iter().position(|event| event_method(event) == Some(method)) {
            if let Some(event) = self.events.remove(pos) {
                return Ok(event);
            }
        }
        loop {
            let Some(message) = self.next_message(deadline)? else {
                return Err(BrowserError::Timeout(format!("no {method} event before deadline")));
            };
            if event_method(&message) == Some(method) {
                return Ok(message);
            }
            if message.get("id").is_none() {
                self.buffer_event(message);
            }
        }
    }

    fn buffer_event(&mut self, event: Value) {
        if self.events.len() >= BUFFERED_EVENTS_MAX {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn send(&mut self, payload: &Value) -> Result<(), BrowserError> {
        let socket = self.socket_mut()?;
        websocket_send_json(socket, payload).map_err(|err| {
            let message = error_chain_message(&err);
            if is_anyhow_transport_error(&err) {
                BrowserError::Disconnected(message)
            } else {
                BrowserError::Script(message)
            }
        })
    }

    /// `Ok(None)` once `deadline` passes without a message.
    fn next_message(&mut self, deadline: Instant) -> Result<Option<Value>, BrowserError> {
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let socket = self.socket_mut()?;
            let message = match socket.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(err) => {
                    self.socket = None;
                    return Err(BrowserError::Disconnected(format!("devtools read failed: {err}")));
                }
            };
            let raw = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                WsMessage::Close(_) => {
                    self.socket = None;
                    return Err(BrowserError::Disconnected("devtools socket closed".to_string()));
                }
                _ => continue,
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => debug!("ignoring non-JSON devtools frame"),
            }
        }
    }

    fn socket_mut(&mut self) -> Result<&mut CdpSocket, BrowserError> {
        self.socket
            .as_mut()
            .ok_or_else(|| BrowserError::Disconnected("devtools socket is closed".to_string()))
    }
}

impl BrowserSession for CdpSession {
    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        self.events
            .retain(|event| event_method(event) != Some("Page.loadEventFired"));
        let result = self.command("Page.navigate", json!({ "url": url }), timeout)?;
        if let Some(error) = result
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|error| !error.is_empty())
        {
            return Err(BrowserError::Script(format!("navigation to {url} failed: {error}")));
        }
        self.wait_event("Page.loadEventFired", deadline)?;
        debug!(url, "page loaded");
        Ok(())
    }

    fn wait_for_global(&mut self, name: &str, timeout: Duration) -> Result<(), BrowserError> {
        let found = self.evaluate(&global_probe_script(name, timeout), timeout + GLOBAL_PROBE_SLACK)?;
        if found == Value::Bool(true) {
            Ok(())
        } else {
            Err(BrowserError::Timeout(format!(
                "window.{name} not defined after {}ms",
                timeout.as_millis()
            )))
        }
    }

    fn evaluate(&mut self, script: &str, timeout: Duration) -> Result<Value, BrowserError> {
        let result = self.command(
            "Runtime.evaluate",
            json!({
                "expression": script,
                "awaitPromise": true,
                "returnByValue": true,
            }),
            timeout,
        )?;
        evaluation_value(&result)
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                debug!(error = %err, "browser already exited");
            }
            if let Err(err) = child.wait() {
                warn!(error = %err, "failed to reap browser process");
            }
        }
        if let Some(profile) = self.profile.take() {
            if let Err(err) = profile.close() {
                warn!(error = %err, "failed to remove browser profile");
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.socket.is_none() {
            return false;
        }
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!(%status, "browser process exited");
                false
            }
            Some(Err(_)) | None => false,
        }
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_browser(config: &BrowserConfig, profile: &Path) -> anyhow::Result<Child> {
    let args = browser_args(profile, config.headless);
    let mut tried = Vec::new();
    for executable in config.executable_candidates() {
        match Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                debug!(executable = %executable.display(), "browser process started");
                return Ok(child);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tried.push(executable.display().to_string());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to start {}", executable.display()))
            }
        }
    }
    bail!("no browser executable found (tried {})", tried.join(", "))
}

pub fn browser_args(profile: &Path, headless: bool) -> Vec<String> {
    let mut args = Vec::new();
    if headless {
        args.push("--headless=new".to_string());
    }
    args.extend(
        [
            "--remote-debugging-port=0",
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-gpu",
            "--disable-extensions",
            "--disable-sync",
            "--disable-background-networking",
            "--disable-blink-features=AutomationControlled",
            "--mute-audio",
            "--window-size=1920,1080",
        ]
        .iter()
        .map(|arg| arg.to_string()),
    );
    args.push(format!("--user-data-dir={}", profile.display()));
    args.push("about:blank".to_string());
    args
}

fn attach_page(child: &mut Child, profile: &Path) -> anyhow::Result<CdpSocket> {
    let port = wait_for_devtools_port(child, &profile.join(DEVTOOLS_PORT_FILE))?;
    let ws_url = page_websocket_url(port)?;
    let (mut socket, _) = websocket_connect(ws_url.as_str())
        .with_context(|| format!("failed to connect devtools websocket {ws_url}"))?;
    set_socket_read_timeout(&mut socket, Some(SOCKET_POLL));
    Ok(socket)
}

fn wait_for_devtools_port(child: &mut Child, port_file: &Path) -> anyhow::Result<u16> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if let Some(port) = fs::read_to_string(port_file)
            .ok()
            .and_then(|contents| parse_devtools_port(&contents))
        {
            return Ok(port);
        }
        if let Some(status) = child.try_wait().context("failed to poll browser process")? {
            bail!("browser exited during startup ({status})");
        }
        if Instant::now() >= deadline {
            bail!(
                "browser did not publish a devtools port within {}s",
                STARTUP_TIMEOUT.as_secs()
            );
        }
        thread::sleep(STARTUP_POLL);
    }
}

/// First line of `DevToolsActivePort` is the port; the second is the browser target path.
pub fn parse_devtools_port(contents: &str) -> Option<u16> {
    contents
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
}

fn page_websocket_url(port: u16) -> anyhow::Result<String> {
    let client = HttpClient::builder()
        .timeout(TARGET_LIST_TIMEOUT)
        .build()
        .context("failed to build devtools http client")?;
    let list_url = format!("http://127.0.0.1:{port}/json/list");
    let deadline = Instant::now() + TARGET_LIST_TIMEOUT;
    loop {
        let targets: Value = client
            .get(&list_url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .with_context(|| format!("failed to list devtools targets at {list_url}"))?;
        if let Some(url) = select_page_target(&targets) {
            return Ok(url);
        }
        if Instant::now() >= deadline {
            bail!("browser exposed no page target");
        }
        thread::sleep(STARTUP_POLL);
    }
}

pub fn select_page_target(targets: &Value) -> Option<String> {
    targets.as_array()?.iter().find_map(|target| {
        if target.get("type").and_then(Value::as_str) != Some("page") {
            return None;
        }
        target
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    })
}

/// In-page promise resolving `true` once `window[name]` exists, `false` at the deadline.
pub fn global_probe_script(name: &str, timeout: Duration) -> String {
    let name = Value::String(name.to_string());
    let timeout_ms = timeout.as_millis();
    format!(
        r#"new Promise((resolve) => {{
  const deadline = Date.now() + {timeout_ms};
  const tick = () => {{
    if (typeof window[{name}] !== "undefined") {{ resolve(true); return; }}
    if (Date.now() >= deadline) {{ resolve(false); return; }}
    setTimeout(tick, {GLOBAL_PROBE_INTERVAL_MS});
  }};
  tick();
}})"#
    )
}

fn command_result(method: &str, message: &Value) -> Result<Value, BrowserError> {
    if let Some(error) = message.get("error") {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown devtools error");
        return Err(BrowserError::Script(format!("{method} failed: {detail}")));
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// Unwraps a `Runtime.evaluate` result, surfacing thrown exceptions.
pub fn evaluation_value(result: &Value) -> Result<Value, BrowserError> {
    if let Some(details) = result.get("exceptionDetails") {
        let description = details
            .get("exception")
            .and_then(|exception| exception.get("description"))
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("script threw");
        return Err(BrowserError::Script(description.to_string()));
    }
    Ok(result
        .get("result")
        .and_then(|remote| remote.get("value"))
        .cloned()
        .unwrap_or(Value::Null))
}

fn event_method(event: &Value) -> Option<&str> {
    event.get("method").and_then(Value::as_str)
}

fn websocket_send_json(socket: &mut CdpSocket, value: &Value) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value).context("failed to serialize devtools command")?;
    socket
        .send(WsMessage::Text(raw.into()))
        .context("failed to send devtools command")
}

fn set_socket_read_timeout(socket: &mut CdpSocket, timeout: Option<Duration>) {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

fn is_anyhow_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<tungstenite::Error>()
            .map(is_tungstenite_transport_error)
            .unwrap_or(false)
    })
}

fn is_tungstenite_transport_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io_err) => matches!(
            io_err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        ),
        tungstenite::Error::Tls(_) => true,
        _ => false,
    }
}

fn error_chain_message(err: &anyhow::Error) -> String {
    err.chain()
        .map(|entry| entry.to_string())
        .filter(|entry| !entry.trim().is_empty())
        .collect::<Vec<String>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use serde_json::json;

    use super::{
        browser_args, evaluation_value, global_probe_script, parse_devtools_port,
        select_page_target,
    };
    use crate::token::BrowserError;

    #[test]
    fn devtools_port_comes_from_first_line() {
        assert_eq!(
            parse_devtools_port("38217\n/devtools/browser/4c1e\n"),
            Some(38217)
        );
        assert_eq!(parse_devtools_port(""), None);
        assert_eq!(parse_devtools_port("0\n"), None);
        assert_eq!(parse_devtools_port("not-a-port"), None);
    }

    #[test]
    fn page_target_is_selected_over_workers() {
        let targets = json!([
            {"type": "service_worker", "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/sw"},
            {"type": "page", "webSocketDebuggerUrl": ""},
            {"type": "page", "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/AB"}
        ]);
        assert_eq!(
            select_page_target(&targets).as_deref(),
            Some("ws://127.0.0.1:1/devtools/page/AB")
        );
        assert_eq!(select_page_target(&json!({})), None);
    }

    #[test]
    fn evaluation_unwraps_value_and_exceptions() {
        let ok = json!({"result": {"type": "string", "value": "umid-123"}});
        assert_eq!(evaluation_value(&ok), Ok(json!("umid-123")));

        let undefined = json!({"result": {"type": "undefined"}});
        assert_eq!(evaluation_value(&undefined), Ok(serde_json::Value::Null));

        let thrown = json!({
            "result": {"type": "object"},
            "exceptionDetails": {"text": "Uncaught", "exception": {"description": "ReferenceError: AWSC is not defined"}}
        });
        assert_eq!(
            evaluation_value(&thrown),
            Err(BrowserError::Script(
                "ReferenceError: AWSC is not defined".to_string()
            ))
        );
    }

    #[test]
    fn probe_script_embeds_quoted_global_and_deadline() {
        let script = global_probe_script("AWSC", Duration::from_millis(1500));
        assert!(script.contains(r#"window["AWSC"]"#));
        assert!(script.contains("Date.now() + 1500"));
        assert!(script.contains("setTimeout(tick, 100)"));
    }

    #[test]
    fn launch_args_use_private_profile() {
        let args = browser_args(Path::new("/tmp/profile-x"), true);
        assert_eq!(args.first().map(String::as_str), Some("--headless=new"));
        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile-x".to_string()));
        assert!(!browser_args(Path::new("/tmp/p"), false).contains(&"--headless=new".to_string()));
    }
}
