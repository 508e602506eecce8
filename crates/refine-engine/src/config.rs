use std::time::Duration;

/// How stage output reaches clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Forward each upstream chunk as its own delta event.
    Streaming,
    /// One request, one delta carrying the full stage output.
    Buffered,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(Self::Streaming),
            "buffered" => Ok(Self::Buffered),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

/// Processing parameters shared by the admission controller, executor,
/// compressor and session runner.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Segments shorter than this (CJK-aware count) are classified as
    /// headings and skipped.
    pub skip_threshold: usize,
    /// Running history longer than this triggers a compression attempt.
    pub compression_threshold: usize,
    /// Admission ceiling: sessions processing at the same time.
    pub max_concurrent: usize,
    /// Paragraphs longer than this are split on sentence boundaries.
    pub segment_max_chars: usize,
    /// Hard cap on one stage call, streaming or buffered.
    pub stage_timeout: Duration,
    pub delivery: DeliveryMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            skip_threshold: 15,
            compression_threshold: 5000,
            max_concurrent: 5,
            segment_max_chars: 500,
            stage_timeout: Duration::from_secs(300),
            delivery: DeliveryMode::Buffered,
        }
    }
}
