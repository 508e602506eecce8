mod database;
pub mod error;
mod row_helpers;
pub mod schema;
pub mod segments;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
