use refine_core::session::Stage;

/// Stage instructions sent as the system prompt. The engine treats these as
/// opaque; deployments override them via configuration.
#[derive(Clone, Debug)]
pub struct StagePrompts {
    pub polish: String,
    pub enhance: String,
    pub emotion: String,
    pub compress: String,
}

impl Default for StagePrompts {
    fn default() -> Self {
        Self {
            polish: "Rewrite the following passage to improve clarity, flow and style. \
                     Preserve the meaning and approximate length. Reply with the rewritten \
                     passage only."
                .to_string(),
            enhance: "Rework the following passage so the phrasing is original while the \
                      meaning is unchanged. Vary sentence structure and word choice. Reply \
                      with the reworked passage only."
                .to_string(),
            emotion: "Rewrite the following passage with stronger emotional resonance, \
                      keeping the events and meaning intact. Reply with the rewritten \
                      passage only."
                .to_string(),
            compress: "Summarize the following text into a much shorter version that keeps \
                       the key narrative facts, names and tone, so it can serve as context \
                       for continuing the text. Reply with the summary only."
                .to_string(),
        }
    }
}

impl StagePrompts {
    pub fn for_stage(&self, stage: Stage) -> &str {
        match stage {
            Stage::Polish => &self.polish,
            Stage::Enhance => &self.enhance,
            Stage::EmotionRewrite => &self.emotion,
        }
    }
}
