//! Guest-mode image generation engine.

pub mod headers;
pub mod http;
pub mod orchestrator;
pub mod session;
pub mod stream;
pub mod token;

pub use headers::{browser_fingerprint, HeaderOptions, HeaderSynthesizer, RandomSource};
pub use orchestrator::GenerationOrchestrator;
pub use session::SessionClient;
pub use stream::{decode_line, decode_reader, ArtifactMatcher, DecodeOutcome, LineOutcome, StreamDecoder};
pub use token::{
    build_token_source, BrowserTokenSource, Clock, EndpointTokenSource, FallbackTokenSource,
    ManualClock, SystemClock, TokenOracle, TokenPhase, TokenSource, TokenStrategy,
};
