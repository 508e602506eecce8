use serde::{Deserialize, Serialize};

/// The complete context sent to a provider for one transformation call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatContext {
    /// Stage instructions (opaque to the engine).
    pub system_prompt: String,
    /// Accumulated prior output, included so later segments stay
    /// stylistically consistent with earlier ones. None for the first
    /// segment and for compression calls.
    pub history: Option<String>,
    /// The text to transform.
    pub input: String,
}

impl ChatContext {
    pub fn new(system_prompt: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: None,
            input: input.into(),
        }
    }

    pub fn with_history(mut self, history: impl Into<String>) -> Self {
        let history = history.into();
        self.history = if history.is_empty() { None } else { Some(history) };
        self
    }

    /// Create an empty context (useful for testing).
    pub fn empty() -> Self {
        Self {
            system_prompt: String::new(),
            history: None,
            input: String::new(),
        }
    }
}
