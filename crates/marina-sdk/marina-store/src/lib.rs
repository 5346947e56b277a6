mod error;
mod models;
mod schema;
mod store;

pub use error::StoreError;
pub use store::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;
