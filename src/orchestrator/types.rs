use std::pin::Pin;

use futures::Stream;

/// Message shown when the input exceeds the token budget.
pub const MSG_TOO_LONG: &str = "Please select a smaller amount of text for this version.";

/// Message shown for any failure while initializing or generating.
pub const MSG_PROCESSING_FAILED: &str = "An error occurred. Please try again.";

/// One incremental state publication for a submitted call.
///
/// Consumers observe a strictly ordered sequence per call: zero or more
/// updates with `processing == true`, then exactly one terminal update with
/// `processing == false` carrying either the completed text or a user-facing
/// error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationUpdate {
    /// Accumulated output so far; the completed text on the terminal update
    pub text: String,
    /// True while more output may still arrive
    pub processing: bool,
    /// User-facing message when the call failed
    pub error: Option<String>,
}

impl GenerationUpdate {
    pub(crate) fn streaming(text: String) -> Self {
        Self {
            text,
            processing: true,
            error: None,
        }
    }

    pub(crate) fn completed(text: String) -> Self {
        Self {
            text,
            processing: false,
            error: None,
        }
    }

    pub(crate) fn failed(message: &str) -> Self {
        Self {
            text: String::new(),
            processing: false,
            error: Some(message.to_string()),
        }
    }

    /// True once the call has reached its final update.
    pub fn is_terminal(&self) -> bool {
        !self.processing
    }
}

/// Ordered stream of updates for one submitted call.
pub type UpdateStream = Pin<Box<dyn Stream<Item = GenerationUpdate> + Send>>;
