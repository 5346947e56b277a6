pub mod manager;
pub mod types;

pub use manager::{WalletError, WalletManager};
