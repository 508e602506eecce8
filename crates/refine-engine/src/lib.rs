pub mod admission;
pub mod compressor;
mod config;
mod error;
pub mod executor;
pub mod prompts;
pub mod providers;
pub mod runner;

pub use config::{DeliveryMode, EngineConfig};
pub use error::EngineError;
