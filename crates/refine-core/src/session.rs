use serde::{Deserialize, Serialize};

/// Which rewriting pipeline a session runs. Each mode maps to a fixed,
/// ordered list of stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// Academic style polishing only.
    Polish,
    /// Polishing followed by an originality-enhancement rewrite.
    PolishEnhance,
    /// Emotion-oriented rewriting (single stage).
    Emotion,
}

impl ProcessingMode {
    /// The ordered stage pipeline for this mode. The first stage consumes the
    /// segment's source text; each later stage consumes the previous stage's
    /// output.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::Polish => &[Stage::Polish],
            Self::PolishEnhance => &[Stage::Polish, Stage::Enhance],
            Self::Emotion => &[Stage::EmotionRewrite],
        }
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polish => write!(f, "polish"),
            Self::PolishEnhance => write!(f, "polish_enhance"),
            Self::Emotion => write!(f, "emotion"),
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polish" => Ok(Self::Polish),
            "polish_enhance" => Ok(Self::PolishEnhance),
            "emotion" => Ok(Self::Emotion),
            other => Err(format!("unknown processing mode: {other}")),
        }
    }
}

/// One transformation step in a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Polish,
    Enhance,
    EmotionRewrite,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polish => write!(f, "polish"),
            Self::Enhance => write!(f, "enhance"),
            Self::EmotionRewrite => write!(f, "emotion_rewrite"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polish" => Ok(Self::Polish),
            "enhance" => Ok(Self::Enhance),
            "emotion_rewrite" => Ok(Self::EmotionRewrite),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Session lifecycle. `Stopped` is terminal and not retryable; only `Failed`
/// sessions accept a retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Per-segment lifecycle. `Done` and `Skipped` are both terminal and are
/// never reprocessed on resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Processing,
    Done,
    Skipped,
    Failed,
}

impl SegmentStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SegmentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown segment status: {other}")),
        }
    }
}
