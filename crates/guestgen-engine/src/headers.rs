use guestgen_contracts::{GuestConfig, HeaderProfile, HeaderSet, RequestMetadata, VerificationToken};
use rand::Rng;

pub const FINGERPRINT_HEADER: &str = "bx-ua";
pub const TOKEN_HEADER: &str = "bx-umidtoken";
pub const VERSION_HEADER: &str = "bx-v";
pub const TIMEZONE_HEADER: &str = "timezone";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const FINGERPRINT_PREFIX: &str = "231!";
const FINGERPRINT_RANDOM_CHARS: usize = 13;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Randomness seam for header synthesis, so tests can pin draws with a seeded rng.
pub trait RandomSource {
    /// Uniform index in `0..len`; `len` is never zero.
    fn pick(&mut self, len: usize) -> usize;
}

impl<R: Rng + ?Sized> RandomSource for R {
    fn pick(&mut self, len: usize) -> usize {
        self.gen_range(0..len)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderOptions {
    pub include_chat_headers: bool,
    pub include_referer: bool,
}

impl HeaderOptions {
    pub fn session() -> Self {
        Self::default()
    }

    pub fn completion() -> Self {
        Self {
            include_chat_headers: true,
            include_referer: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeaderSynthesizer {
    profile: HeaderProfile,
    randomize: bool,
    protocol_version: String,
    guest_referer: String,
}

impl HeaderSynthesizer {
    pub fn new(config: &GuestConfig) -> Self {
        Self::with_profile(
            HeaderProfile::chrome_windows(&config.base_url),
            config.randomize_headers,
            &config.protocol_version,
            &config.guest_referer(),
        )
    }

    pub fn with_profile(
        profile: HeaderProfile,
        randomize: bool,
        protocol_version: &str,
        guest_referer: &str,
    ) -> Self {
        Self {
            profile,
            randomize,
            protocol_version: protocol_version.to_string(),
            guest_referer: guest_referer.to_string(),
        }
    }

    pub fn profile(&self) -> &HeaderProfile {
        &self.profile
    }

    pub fn randomizes(&self) -> bool {
        self.randomize
    }

    pub fn synthesize<R: RandomSource + ?Sized>(
        &self,
        metadata: &RequestMetadata,
        token: &VerificationToken,
        fingerprint: &str,
        options: HeaderOptions,
        rng: &mut R,
    ) -> HeaderSet {
        let mut headers = HeaderSet::new();
        for (name, value) in &self.profile.defaults {
            headers.insert(name, value.clone());
        }

        // One independent draw per field; combinations are not cross-checked.
        if self.randomize {
            for row in &self.profile.candidates {
                if row.values.is_empty() {
                    continue;
                }
                let idx = rng.pick(row.values.len());
                headers.insert(&row.name, row.values[idx].clone());
            }
        }

        headers.insert(FINGERPRINT_HEADER, fingerprint);
        headers.insert(TOKEN_HEADER, token.value.clone());
        headers.insert(VERSION_HEADER, self.protocol_version.clone());
        headers.insert(TIMEZONE_HEADER, metadata.timezone.clone());
        headers.insert(REQUEST_ID_HEADER, metadata.request_id.clone());

        if options.include_chat_headers {
            for (name, value) in &self.profile.chat_overlay {
                headers.insert(name, value.clone());
            }
        }

        if options.include_referer && !self.randomize {
            headers.insert("referer", self.guest_referer.clone());
        }

        headers
    }
}

/// Synthetic device signature: `231!` + 13 base-36 chars + epoch millis.
pub fn browser_fingerprint<R: Rng + ?Sized>(rng: &mut R, now_ms: i64) -> String {
    let random = (0..FINGERPRINT_RANDOM_CHARS)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect::<String>();
    format!("{FINGERPRINT_PREFIX}{random}{now_ms}")
}
