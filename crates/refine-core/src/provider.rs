use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::context::ChatContext;
use crate::errors::UpstreamError;
use crate::stream::StreamEvent;

/// Options controlling generation behavior for one call.
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Trait implemented by each text-transformation backend.
///
/// `stream` and `complete` are the two delivery modes of the same
/// capability; which one a caller uses is a deployment configuration
/// decision, never per-call negotiation.
#[async_trait]
pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Open a streaming call. The returned stream yields incremental deltas
    /// and terminates with `Done` or `Error`.
    async fn stream(
        &self,
        context: &ChatContext,
        options: &CallOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, UpstreamError>;

    /// Buffered call: block until the full output is available.
    async fn complete(
        &self,
        context: &ChatContext,
        options: &CallOptions,
    ) -> Result<String, UpstreamError>;
}
