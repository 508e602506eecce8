pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod provider;
pub mod security;
pub mod session;
pub mod stream;
pub mod text;
