mod config;
pub mod mock;
mod provider;
pub mod sse;

pub use config::ProviderConfig;
pub use mock::{MockProvider, MockResponse};
pub use provider::OpenAiProvider;
