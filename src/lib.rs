//! Host layer for the Marina wallet engine: persisted network config, a
//! password-gated wallet session, and the network status shown to the UI.

pub mod state;
pub mod wallet;

pub use marina_sdk::{Network, WalletConfig};
pub use state::{AppStateManager, NetworkStatus};
pub use wallet::types::{
    LiquidSendResult, SyncSummary, WalletAddress, WalletBalance, WalletStatus, WalletUtxo,
};
pub use wallet::{WalletError, WalletManager};
