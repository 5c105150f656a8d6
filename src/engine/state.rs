use std::fmt;

/// Lifecycle of the inference engine.
///
/// The engine moves forward through `Uninitialized -> Initializing -> Ready`,
/// bounces between `Ready` and `Generating` while serving requests, and lands
/// in `Failed` when initialization breaks. `Failed` is retryable: a later
/// `initialize` starts over from scratch. `release` returns any state to
/// `Uninitialized`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    /// No weights loaded and no initialization underway
    Uninitialized,
    /// Provisioning the artifact or loading weights, with overall
    /// progress as a fraction in 0.0..=1.0
    Initializing(f32),
    /// Weights loaded, accepting generation requests
    Ready,
    /// A generation stream is in flight
    Generating,
    /// Initialization failed, with the reason
    Failed(String),
}

impl EngineState {
    /// True when the engine can accept a generation request right away.
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineState::Ready)
    }

    /// True while model weights are resident, whether idle or generating.
    pub fn is_loaded(&self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Generating)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "uninitialized"),
            EngineState::Initializing(fraction) => {
                write!(f, "initializing ({:.0}%)", fraction * 100.0)
            }
            EngineState::Ready => write!(f, "ready"),
            EngineState::Generating => write!(f, "generating"),
            EngineState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_covers_ready_and_generating() {
        assert!(!EngineState::Uninitialized.is_loaded());
        assert!(!EngineState::Initializing(0.3).is_loaded());
        assert!(EngineState::Ready.is_loaded());
        assert!(EngineState::Generating.is_loaded());
        assert!(!EngineState::Failed("boom".to_string()).is_loaded());
    }

    #[test]
    fn only_ready_accepts_requests() {
        assert!(EngineState::Ready.is_ready());
        assert!(!EngineState::Generating.is_ready());
    }

    #[test]
    fn display_includes_progress_and_reason() {
        assert_eq!(EngineState::Initializing(0.25).to_string(), "initializing (25%)");
        assert_eq!(
            EngineState::Failed("no space".to_string()).to_string(),
            "failed: no space"
        );
    }
}
