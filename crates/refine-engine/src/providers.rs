use std::sync::Arc;

use refine_core::provider::TextProvider;
use refine_core::session::Stage;

/// Per-stage provider bindings. Each stage (and the history compressor) may
/// point at its own model; `uniform` binds everything to one provider.
#[derive(Clone)]
pub struct ProviderSet {
    polish: Arc<dyn TextProvider>,
    enhance: Arc<dyn TextProvider>,
    emotion: Arc<dyn TextProvider>,
    compression: Arc<dyn TextProvider>,
}

impl ProviderSet {
    pub fn uniform(provider: Arc<dyn TextProvider>) -> Self {
        Self {
            polish: provider.clone(),
            enhance: provider.clone(),
            emotion: provider.clone(),
            compression: provider,
        }
    }

    pub fn with_stage(mut self, stage: Stage, provider: Arc<dyn TextProvider>) -> Self {
        match stage {
            Stage::Polish => self.polish = provider,
            Stage::Enhance => self.enhance = provider,
            Stage::EmotionRewrite => self.emotion = provider,
        }
        self
    }

    pub fn with_compression(mut self, provider: Arc<dyn TextProvider>) -> Self {
        self.compression = provider;
        self
    }

    pub fn for_stage(&self, stage: Stage) -> &Arc<dyn TextProvider> {
        match stage {
            Stage::Polish => &self.polish,
            Stage::Enhance => &self.enhance,
            Stage::EmotionRewrite => &self.emotion,
        }
    }

    pub fn compression(&self) -> &Arc<dyn TextProvider> {
        &self.compression
    }
}
