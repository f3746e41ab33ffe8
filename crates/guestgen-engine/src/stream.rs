//! Incremental decoder for the completion endpoint's streamed response.
//!
//! The wire format is newline-delimited text. Relevant lines carry a `data: `
//! prefix followed by a JSON object or the `[DONE]` sentinel. The service may
//! instead answer with a single JSON error object, which is detected while no
//! data line has been seen yet.
//!
//! Two outcome levels are kept apart: a line decodes into zero or more
//! [`StreamEvent`]s (malformed lines become `Unparseable` and are skipped),
//! while the stream as a whole resolves once into a [`DecodeOutcome`].

use std::io::{ErrorKind as IoErrorKind, Read};

use guestgen_contracts::{GuestError, StreamEvent};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const DEFAULT_CDN_HOST: &str = "cdn.qwenlm.ai";
pub const RATE_LIMITED_CODE: &str = "RateLimited";

const READ_CHUNK_BYTES: usize = 8 * 1024;
const PRELUDE_LIMIT_BYTES: usize = 64 * 1024;
const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg"];
const SECURE_URL_PREFIX: &str = "https://";

/// Stream-level resolution: the artifact URL or the failure that ended the stream.
pub type DecodeOutcome = Result<String, GuestError>;

/// Per-line result. Lines that fail to parse are still `Events`
/// (an `Unparseable` event) and never end the stream on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Ignored,
    Events(Vec<StreamEvent>),
}

impl LineOutcome {
    pub fn into_events(self) -> Vec<StreamEvent> {
        match self {
            Self::Ignored => Vec::new(),
            Self::Events(events) => events,
        }
    }
}

/// Permissive "looks like a hosted image" test: any one check suffices.
#[derive(Debug, Clone)]
pub struct ArtifactMatcher {
    cdn_host: String,
}

impl Default for ArtifactMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CDN_HOST)
    }
}

impl ArtifactMatcher {
    pub fn new(cdn_host: &str) -> Self {
        Self {
            cdn_host: cdn_host.to_string(),
        }
    }

    pub fn matches(&self, content: &str) -> bool {
        (!self.cdn_host.is_empty() && content.contains(&self.cdn_host))
            || IMAGE_EXTENSIONS.iter().any(|ext| content.contains(ext))
            || content.starts_with(SECURE_URL_PREFIX)
    }
}

/// Decodes one complete line (without its newline) into stream events.
///
/// Lines without the data prefix are `Ignored`.
pub fn decode_line(line: &str) -> LineOutcome {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        if !line.trim().is_empty() {
            debug!(line, "ignoring non-data stream line");
        }
        return LineOutcome::Ignored;
    };
    if payload.trim() == DONE_SENTINEL {
        return LineOutcome::Events(vec![StreamEvent::DoneMarker]);
    }
    let Ok(frame) = serde_json::from_str::<Value>(payload) else {
        return LineOutcome::Events(vec![StreamEvent::Unparseable(line.to_string())]);
    };

    let mut events = Vec::new();
    let choice = frame
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());
    if let Some(choice) = choice {
        for field in ["delta", "message"] {
            if let Some(content) = choice
                .get(field)
                .and_then(|part| part.get("content"))
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty())
            {
                events.push(StreamEvent::ContentFragment(content.to_string()));
            }
        }
    }
    if let Some((code, details)) = error_frame(&frame) {
        events.push(StreamEvent::ErrorFrame { code, details });
    }
    if let Some(choice) = choice {
        let finished = choice
            .get("delta")
            .and_then(|delta| delta.get("status"))
            .and_then(Value::as_str)
            == Some("finished");
        let stopped = choice.get("finish_reason").and_then(Value::as_str) == Some("stop");
        if finished || stopped {
            events.push(StreamEvent::FinishSignal);
        }
    }
    LineOutcome::Events(events)
}

/// `{success: false, data: {code, details}}` or `{error: {code, details|message}}`.
fn error_frame(frame: &Value) -> Option<(String, String)> {
    let body = if frame.get("success").and_then(Value::as_bool) == Some(false) {
        frame.get("data").cloned().unwrap_or(Value::Null)
    } else {
        frame.get("error").filter(|error| error.is_object())?.clone()
    };
    let code = body
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let details = body
        .get("details")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Some((code, details))
}

fn error_outcome(code: &str, details: &str) -> GuestError {
    if code == RATE_LIMITED_CODE {
        GuestError::rate_limited(details.to_string())
    } else {
        GuestError::protocol(format!("request failed: {details}"))
    }
}

#[derive(Debug)]
pub struct StreamDecoder {
    matcher: ArtifactMatcher,
    carry: Vec<u8>,
    prelude: Option<Vec<u8>>,
    artifact_url: Option<String>,
    last_error: Option<(String, String)>,
    outcome: Option<DecodeOutcome>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(ArtifactMatcher::default())
    }
}

impl StreamDecoder {
    pub fn new(matcher: ArtifactMatcher) -> Self {
        Self {
            matcher,
            carry: Vec::new(),
            prelude: Some(Vec::new()),
            artifact_url: None,
            last_error: None,
            outcome: None,
        }
    }

    pub fn artifact_url(&self) -> Option<&str> {
        self.artifact_url.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Consumes one chunk; returns the outcome once the stream has resolved.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<DecodeOutcome> {
        if self.outcome.is_some() {
            return self.outcome.clone();
        }

        if let Some(prelude) = self.prelude.as_mut() {
            prelude.extend_from_slice(chunk);
            if prelude.len() > PRELUDE_LIMIT_BYTES {
                debug!(bytes = prelude.len(), "body too large for an error object, no longer checking");
                self.prelude = None;
            } else if let Some((code, details)) = whole_body_error(prelude) {
                warn!(code = %code, details = %details, "service answered with an error body");
                return self.terminate(Err(error_outcome(&code, &details)));
            }
        }

        self.carry.extend_from_slice(chunk);
        while let Some(newline) = self.carry.iter().position(|byte| *byte == b'\n') {
            let raw = self.carry.drain(..=newline).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if let Some(outcome) = self.process_line(&line) {
                return Some(outcome);
            }
        }
        None
    }

    /// Resolves at end of input. The unterminated tail counts as a final line.
    pub fn finish(&mut self) -> DecodeOutcome {
        if let Some(outcome) = self.outcome.clone() {
            return outcome;
        }
        if !self.carry.is_empty() {
            let tail = String::from_utf8_lossy(&self.carry).into_owned();
            self.carry.clear();
            if let Some(outcome) = self.process_line(&tail) {
                return outcome;
            }
        }
        if let Some((code, details)) = self.prelude.as_deref().and_then(whole_body_error) {
            return self.resolve(Err(error_outcome(&code, &details)));
        }

        let outcome = match self.artifact_url.clone() {
            Some(url) => Ok(url),
            None => {
                let mut message = "stream ended without URL".to_string();
                if let Some((code, details)) = &self.last_error {
                    message.push_str(&format!(" (last error frame {code}: {details})"));
                }
                Err(GuestError::protocol(message))
            }
        };
        self.resolve(outcome)
    }

    fn process_line(&mut self, line: &str) -> Option<DecodeOutcome> {
        if line.starts_with(DATA_PREFIX) {
            self.prelude = None;
        }
        for event in decode_line(line).into_events() {
            match event {
                StreamEvent::ContentFragment(content) => {
                    if self.matcher.matches(&content) {
                        let url = content.trim().to_string();
                        info!(url = %url, "captured artifact url");
                        self.artifact_url = Some(url);
                    }
                }
                StreamEvent::DoneMarker => debug!("stream end sentinel received"),
                StreamEvent::Unparseable(raw) => warn!(line = %raw, "skipping malformed stream line"),
                StreamEvent::ErrorFrame { code, details } => {
                    warn!(code = %code, details = %details, "error frame in stream");
                    if code == RATE_LIMITED_CODE {
                        return self.terminate(Err(error_outcome(&code, &details)));
                    }
                    self.last_error = Some((code, details));
                }
                StreamEvent::FinishSignal => {
                    let outcome = match self.artifact_url.clone() {
                        Some(url) => Ok(url),
                        None => Err(GuestError::protocol("no URL found despite termination")),
                    };
                    return self.terminate(outcome);
                }
            }
        }
        None
    }

    fn terminate(&mut self, outcome: DecodeOutcome) -> Option<DecodeOutcome> {
        Some(self.resolve(outcome))
    }

    fn resolve(&mut self, outcome: DecodeOutcome) -> DecodeOutcome {
        self.carry.clear();
        self.prelude = None;
        self.outcome = Some(outcome.clone());
        outcome
    }
}

fn whole_body_error(body: &[u8]) -> Option<(String, String)> {
    if body.iter().rev().find(|byte| !byte.is_ascii_whitespace()) != Some(&b'}') {
        return None;
    }
    let value = serde_json::from_slice::<Value>(body).ok()?;
    if value.get("success").and_then(Value::as_bool) != Some(false) {
        return None;
    }
    error_frame(&value)
}

/// Pulls a whole stream through `decoder`; read failures supersede partial state.
pub fn decode_reader<R: Read>(mut reader: R, decoder: &mut StreamDecoder) -> DecodeOutcome {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return decoder.finish(),
            Ok(n) => {
                if let Some(outcome) = decoder.feed(&buf[..n]) {
                    return outcome;
                }
            }
            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(GuestError::transport(format!(
                    "stream read failed: {err}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};

    use guestgen_contracts::{ErrorKind, GuestError, StreamEvent};

    use super::{
        decode_line, decode_reader, ArtifactMatcher, DecodeOutcome, LineOutcome, StreamDecoder,
        PRELUDE_LIMIT_BYTES,
    };

    const URL: &str = "https://cdn.example.com/img/abc.png";

    fn sample_stream() -> String {
        [
            r#"data: {"choices":[{"delta":{"content":"图片生成中","phase":"image_gen"}}]}"#,
            &format!(r#"data: {{"choices":[{{"delta":{{"content":"{URL}"}}}}]}}"#),
            r#"data: {"choices":[{"delta":{"content":""},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
            "",
        ]
        .join("\n")
    }

    fn decode_chunks(chunks: &[&[u8]]) -> DecodeOutcome {
        let mut decoder = StreamDecoder::default();
        for chunk in chunks {
            if let Some(outcome) = decoder.feed(chunk) {
                return outcome;
            }
        }
        decoder.finish()
    }

    #[test]
    fn resolves_url_on_finish_reason() {
        assert_eq!(decode_chunks(&[sample_stream().as_bytes()]), Ok(URL.to_string()));
    }

    #[test]
    fn chunk_splitting_does_not_change_result() {
        let stream = sample_stream();
        let bytes = stream.as_bytes();
        let whole = decode_chunks(&[bytes]);
        for split in 0..=bytes.len() {
            let (left, right) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[left, right]), whole, "split at {split}");
        }
        let singles = bytes.chunks(1).collect::<Vec<&[u8]>>();
        assert_eq!(decode_chunks(&singles), whole);
        let sevens = bytes.chunks(7).collect::<Vec<&[u8]>>();
        assert_eq!(decode_chunks(&sevens), whole);
    }

    #[test]
    fn last_matching_url_wins() {
        let stream = [
            r#"data: {"choices":[{"delta":{"content":"https://cdn.qwenlm.ai/first.png"}}]}"#,
            r#"data: {"choices":[{"message":{"content":"https://cdn.qwenlm.ai/second.png"}}]}"#,
            "",
        ]
        .join("\n");
        assert_eq!(
            decode_chunks(&[stream.as_bytes()]),
            Ok("https://cdn.qwenlm.ai/second.png".to_string())
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let stream = [
            r#"data: {"choices":[{"delta":{"content":"https://cdn.qwenlm.ai/a.jpg"}}]}"#,
            "data: {not json",
            ": keep-alive",
            r#"data: {"choices":[{"delta":{"status":"finished"}}]}"#,
            "",
        ]
        .join("\n");
        assert_eq!(
            decode_chunks(&[stream.as_bytes()]),
            Ok("https://cdn.qwenlm.ai/a.jpg".to_string())
        );
    }

    #[test]
    fn finish_without_url_fails() {
        let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"thinking\"},\"finish_reason\":\"stop\"}]}\n";
        assert_eq!(
            decode_chunks(&[stream.as_bytes()]),
            Err(GuestError::protocol("no URL found despite termination"))
        );
    }

    #[test]
    fn end_of_input_without_url_fails() {
        let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"thinking\"}}]}\ndata: [DONE]\n";
        let outcome = decode_chunks(&[stream.as_bytes()]);
        assert_eq!(
            outcome,
            Err(GuestError::protocol("stream ended without URL"))
        );
    }

    #[test]
    fn end_of_input_with_url_succeeds() {
        let stream = format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{URL}\"}}}}]}}"
        );
        assert_eq!(decode_chunks(&[stream.as_bytes()]), Ok(URL.to_string()));
    }

    #[test]
    fn whole_body_rate_limit_error_is_detected_across_chunks() {
        let body = br#"{"success":false,"request_id":"r1","data":{"code":"RateLimited","details":"too many requests"}}"#;
        let (left, right) = body.split_at(20);
        let outcome = decode_chunks(&[left, right]);
        assert_eq!(outcome, Err(GuestError::rate_limited("too many requests")));
    }

    #[test]
    fn whole_body_generic_error_is_protocol() {
        let body = b"{\n  \"success\": false,\n  \"data\": {\"code\": \"Bad\", \"details\": \"nope\"}\n}";
        let outcome = decode_chunks(&[body]);
        assert_eq!(outcome, Err(GuestError::protocol("request failed: nope")));
    }

    #[test]
    fn in_stream_rate_limit_frame_terminates() {
        let stream = "data: {\"error\":{\"code\":\"RateLimited\",\"details\":\"wait\"}}\n";
        let outcome = decode_chunks(&[stream.as_bytes()]);
        assert!(outcome
            .as_ref()
            .err()
            .map(|err| err.kind() == ErrorKind::RateLimited)
            .unwrap_or(false));
    }

    #[test]
    fn other_error_frames_are_reported_when_no_url_arrives() {
        let stream = "data: {\"error\":{\"code\":\"Internal\",\"message\":\"boom\"}}\n";
        let outcome = decode_chunks(&[stream.as_bytes()]);
        assert_eq!(
            outcome,
            Err(GuestError::protocol(
                "stream ended without URL (last error frame Internal: boom)"
            ))
        );
    }

    #[test]
    fn feed_after_resolution_returns_same_outcome() {
        let mut decoder = StreamDecoder::default();
        let first = decoder.feed(sample_stream().as_bytes());
        assert_eq!(first, Some(Ok(URL.to_string())));
        assert!(decoder.is_terminal());
        assert_eq!(decoder.feed(b"data: garbage\n"), first);
        assert_eq!(decoder.finish(), Ok(URL.to_string()));
    }

    #[test]
    fn decode_line_classifies_frames() {
        assert_eq!(decode_line("event: ping"), LineOutcome::Ignored);
        assert_eq!(
            decode_line("data: [DONE]\r"),
            LineOutcome::Events(vec![StreamEvent::DoneMarker])
        );
        assert_eq!(
            decode_line("data: nope"),
            LineOutcome::Events(vec![StreamEvent::Unparseable("data: nope".to_string())])
        );
        assert_eq!(
            decode_line(r#"data: {"choices":[{"delta":{"content":"x","status":"finished"}}]}"#),
            LineOutcome::Events(vec![
                StreamEvent::ContentFragment("x".to_string()),
                StreamEvent::FinishSignal
            ])
        );
    }

    #[test]
    fn matcher_is_permissive() {
        let matcher = ArtifactMatcher::default();
        assert!(matcher.matches("https://example.org/x"));
        assert!(!matcher.matches("see https://example.org"));
        assert!(matcher.matches("relative/path/photo.jpeg"));
        assert!(matcher.matches("cdn.qwenlm.ai/output/1"));
        assert!(!matcher.matches("plain text"));
        assert!(!matcher.matches("http://insecure.example.org/page"));
    }

    #[test]
    fn oversized_prelude_stops_whole_body_check() {
        let mut decoder = StreamDecoder::default();
        let page = format!("<html>{}</html>\n", "x".repeat(PRELUDE_LIMIT_BYTES));
        for chunk in page.as_bytes().chunks(4096) {
            assert_eq!(decoder.feed(chunk), None);
        }
        assert!(decoder.prelude.is_none());

        let err = decoder.finish().expect_err("no url");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.message().contains("without URL"));
    }

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.served = true;
            let line = format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{URL}\"}}}}]}}\n");
            buf[..line.len()].copy_from_slice(line.as_bytes());
            Ok(line.len())
        }
    }

    #[test]
    fn transport_error_supersedes_partial_state() {
        let mut decoder = StreamDecoder::default();
        let outcome = decode_reader(FailingReader { served: false }, &mut decoder);
        assert_eq!(outcome.map_err(|err| err.kind()), Err(ErrorKind::Transport));
        assert_eq!(decoder.artifact_url(), Some(URL));
    }

    #[test]
    fn decode_reader_handles_full_stream() {
        let mut decoder = StreamDecoder::default();
        let outcome = decode_reader(Cursor::new(sample_stream().into_bytes()), &mut decoder);
        assert_eq!(outcome, Ok(URL.to_string()));
    }
}
