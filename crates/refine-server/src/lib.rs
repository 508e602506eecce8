pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod orchestrator;
pub mod rpc;
pub mod server;
pub mod wire;

pub use orchestrator::{EngineOrchestrator, SessionOrchestrator, SubmitOutcome, SubmitParams};
pub use server::{start, ServerConfig, ServerHandle};
