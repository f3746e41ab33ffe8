use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://chat.qwen.ai";
pub const DEFAULT_MODEL: &str = "qwen3-max";
pub const DEFAULT_SIZE: &str = "1:1";
pub const SUPPORTED_SIZES: &[&str] = &["1:1", "16:9", "9:16", "4:3", "3:4"];
pub const PROTOCOL_VERSION: &str = "2.5.31";
pub const IMAGE_CHAT_TYPE: &str = "t2i";
pub const TOKEN_ENDPOINTS: &[&str] = &[
    "https://sg-wum.alibaba.com/w/wu.json",
    "https://ynuf.aliapp.org/w/wu.json",
];

const RETRY_ATTEMPTS_MAX: u32 = 10;
const BROWSER_CANDIDATES: &[&str] = &["google-chrome", "chromium", "chromium-browser"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Settings for the browser-driven token source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserConfig {
    /// Explicit executable; when unset the launcher tries `executable_candidates`.
    pub executable: Option<PathBuf>,
    pub navigation_timeout: Duration,
    pub global_timeout: Duration,
    pub attempt_timeout: Duration,
    pub verification_global: String,
    pub verification_app: String,
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            navigation_timeout: Duration::from_secs(30),
            global_timeout: Duration::from_secs(15),
            attempt_timeout: Duration::from_secs(10),
            verification_global: "AWSC".to_string(),
            verification_app: "chat.qwen.ai".to_string(),
            headless: true,
        }
    }
}

impl BrowserConfig {
    pub fn executable_candidates(&self) -> Vec<PathBuf> {
        match &self.executable {
            Some(path) => vec![path.clone()],
            None => BROWSER_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }

    /// In-page expression resolving to the verification token, or `null` on a miss.
    pub fn init_script(&self) -> String {
        let global = serde_json::Value::String(self.verification_global.clone());
        let app = serde_json::Value::String(self.verification_app.clone());
        let timeout_ms = self.attempt_timeout.as_millis().min(u128::from(u32::MAX));
        format!(
            r#"new Promise((resolve) => {{
  const host = window[{global}];
  if (!host || typeof host.use !== "function") {{ resolve(null); return; }}
  host.use("um", (state, um) => {{
    if (state !== "loaded" || !um) {{ resolve(null); return; }}
    um.init({{ appName: {app}, timeout: {timeout_ms} }}, (initState, result) => {{
      resolve(initState === "success" && result && result.tn ? String(result.tn) : null);
    }});
  }});
}})"#
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    pub base_url: String,
    pub default_model: String,
    pub supported_sizes: Vec<String>,
    pub default_size: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub token_validity: Duration,
    pub batch_pause: Duration,
    pub randomize_headers: bool,
    pub protocol_version: String,
    pub browser: BrowserConfig,
    pub token_endpoints: Vec<String>,
    pub endpoint_timeout: Duration,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            supported_sizes: SUPPORTED_SIZES.iter().map(|size| size.to_string()).collect(),
            default_size: DEFAULT_SIZE.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            token_validity: Duration::from_secs(10 * 60),
            batch_pause: Duration::from_millis(1000),
            randomize_headers: false,
            protocol_version: PROTOCOL_VERSION.to_string(),
            browser: BrowserConfig::default(),
            token_endpoints: TOKEN_ENDPOINTS.iter().map(|url| url.to_string()).collect(),
            endpoint_timeout: Duration::from_secs(5),
        }
    }
}

impl GuestConfig {
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Applies `GUESTGEN_*` overrides read through `lookup`; blank or unparsable
    /// values leave the current setting untouched.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(base_url) = read("GUESTGEN_BASE_URL") {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(model) = read("GUESTGEN_MODEL") {
            self.default_model = model;
        }
        if let Some(raw) = read("GUESTGEN_SIZES") {
            let sizes = raw
                .split(',')
                .map(str::trim)
                .filter(|size| !size.is_empty())
                .map(str::to_string)
                .collect::<Vec<String>>();
            if !sizes.is_empty() {
                self.supported_sizes = sizes;
            }
        }
        if let Some(size) = read("GUESTGEN_DEFAULT_SIZE") {
            self.default_size = size;
        }
        if let Some(ms) = read("GUESTGEN_TIMEOUT_MS").and_then(|raw| raw.parse::<u64>().ok()) {
            self.timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(attempts) =
            read("GUESTGEN_RETRY_ATTEMPTS").and_then(|raw| raw.parse::<u32>().ok())
        {
            self.retry.max_attempts = attempts.clamp(1, RETRY_ATTEMPTS_MAX);
        }
        if let Some(ms) = read("GUESTGEN_RETRY_DELAY_MS").and_then(|raw| raw.parse::<u64>().ok())
        {
            self.retry.delay = Duration::from_millis(ms);
        }
        if let Some(secs) =
            read("GUESTGEN_TOKEN_TTL_SECS").and_then(|raw| raw.parse::<u64>().ok())
        {
            self.token_validity = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = read("GUESTGEN_BATCH_PAUSE_MS").and_then(|raw| raw.parse::<u64>().ok())
        {
            self.batch_pause = Duration::from_millis(ms);
        }
        if let Some(flag) = read("GUESTGEN_RANDOMIZE_HEADERS").and_then(|raw| parse_flag(&raw)) {
            self.randomize_headers = flag;
        }
        if let Some(browser) = read("GUESTGEN_BROWSER") {
            self.browser.executable = Some(PathBuf::from(browser));
        }
        if let Some(global) = read("GUESTGEN_VERIFICATION_GLOBAL") {
            self.browser.verification_global = global;
        }
        self
    }

    pub fn session_url(&self) -> String {
        format!("{}/api/v2/chats/new", self.base_url)
    }

    /// Completion endpoint; the `chat_id` query pair is added, encoded, per request.
    pub fn completions_url(&self) -> String {
        format!("{}/api/v2/chat/completions", self.base_url)
    }

    pub fn landing_url(&self) -> String {
        format!("{}/", self.base_url)
    }

    pub fn guest_referer(&self) -> String {
        format!("{}/c/guest", self.base_url)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::GuestConfig;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<String, String>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_guest_service() {
        let config = GuestConfig::default();
        assert_eq!(config.base_url, "https://chat.qwen.ai");
        assert_eq!(config.default_model, "qwen3-max");
        assert_eq!(config.default_size, "1:1");
        assert_eq!(config.supported_sizes.len(), 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_millis(1000));
        assert_eq!(config.session_url(), "https://chat.qwen.ai/api/v2/chats/new");
        assert_eq!(
            config.completions_url(),
            "https://chat.qwen.ai/api/v2/chat/completions"
        );
        assert_eq!(config.guest_referer(), "https://chat.qwen.ai/c/guest");
    }

    #[test]
    fn overrides_apply_and_clamp() {
        let config = GuestConfig::default().with_overrides(lookup(&[
            ("GUESTGEN_BASE_URL", "http://127.0.0.1:9000/"),
            ("GUESTGEN_SIZES", " 1:1, 2:3 ,,"),
            ("GUESTGEN_RETRY_ATTEMPTS", "99"),
            ("GUESTGEN_BATCH_PAUSE_MS", "0"),
            ("GUESTGEN_RANDOMIZE_HEADERS", "yes"),
        ]));
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.supported_sizes, vec!["1:1", "2:3"]);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.batch_pause, Duration::ZERO);
        assert!(config.randomize_headers);
    }

    #[test]
    fn blank_and_garbage_overrides_are_ignored() {
        let config = GuestConfig::default().with_overrides(lookup(&[
            ("GUESTGEN_MODEL", "   "),
            ("GUESTGEN_TIMEOUT_MS", "soon"),
            ("GUESTGEN_RANDOMIZE_HEADERS", "maybe"),
        ]));
        assert_eq!(config, GuestConfig::default());
    }

    #[test]
    fn init_script_targets_configured_global() {
        let mut config = GuestConfig::default();
        config.browser.verification_global = "VerifyHost".to_string();
        let script = config.browser.init_script();
        assert!(script.contains(r#"window["VerifyHost"]"#));
        assert!(script.contains(r#"appName: "chat.qwen.ai""#));
        assert!(script.starts_with("new Promise"));
    }
}
