//! Shared data model for the guest image-generation client.

pub mod config;
pub mod error;
pub mod events;
pub mod generation;
pub mod headers;
pub mod request;
pub mod sizes;
pub mod stream;
pub mod token;

pub use config::{BrowserConfig, GuestConfig, RetryPolicy};
pub use error::{ErrorKind, GuestError, Result};
pub use events::{EventLog, EventPayload};
pub use generation::{BatchOutcome, GenerationRequest, GenerationResult, SessionHandle};
pub use headers::{HeaderCandidates, HeaderProfile, HeaderSet};
pub use request::RequestMetadata;
pub use sizes::{SizeSelection, SizeSelector};
pub use stream::StreamEvent;
pub use token::VerificationToken;
