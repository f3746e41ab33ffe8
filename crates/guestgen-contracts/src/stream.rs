/// A parsed unit of the generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentFragment(String),
    DoneMarker,
    FinishSignal,
    ErrorFrame { code: String, details: String },
    Unparseable(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinishSignal)
    }
}
