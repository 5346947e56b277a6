pub mod account;
pub mod analyser;
pub mod blinder;
pub mod chain;
pub mod chain_watcher;
pub mod coin_selection;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod mnemonic;
pub mod network;
pub mod pset;
pub mod registry;
pub mod repository;
pub mod sdk;
mod serde_utils;
pub mod signer;
pub mod store;
pub mod taproot;
pub mod taxi;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod unblinder;
pub mod updater;

// Core types
pub use config::WalletConfig;
pub use error::{Error, Result};
pub use events::WalletEvent;
pub use network::Network;
pub use sdk::{MarinaSdk, SendResult};
pub use types::{
    AssetDetails, DataRecipient, LockedOutpoint, Recipient, ScriptDetails, TxDetails,
    UnblindedOutput, UnblindingData,
};

// Accounts
pub use account::{
    Account, AccountDetails, AccountFactory, AccountKind, AddressResult, ChainIndexes,
    ProgrammableParams, RestorationJson, SyncResult,
};

// Storage
pub use repository::WalletRepository;
pub use store::{KeyValueStore, MemoryStore};

// Chain access
pub use chain::{ChainSource, ElectrumChainSource};
pub use chain_watcher::{ChainEvent, ChainWatcherConfig, ChainWatcherHandle, spawn_chain_watcher};

// Transaction pipeline
pub use blinder::BlinderService;
pub use coin_selection::{CoinSelectionResult, Target};
pub use pset::builder::{PsetBuilder, PsetResult, TaxiPsetResult};
pub use signer::{SignerService, finalize_and_extract, finalize_to_hex};
pub use unblinder::Unblinder;
pub use updater::{UpdateReport, Updater};

// Scripts and contracts
pub use analyser::{ScriptAnalysis, analyse};
pub use contract::{Artifact, Contract};

// External services
pub use registry::{AssetRegistry, EsploraAssetRegistry};
pub use taxi::{HttpTaxiApi, TaxiApi, TopupResponse};

// Re-export LWK for app-layer use
pub use lwk_wollet;
