use std::fs;
use std::path::{Path, PathBuf};

use marina_sdk::{Network, WalletConfig};
use serde::Serialize;

use crate::wallet::{WalletError, WalletManager};

const CONFIG_FILE: &str = "wallet_config.json";

// ============================================================================
// Network status (sent to the host UI)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub network: String,
    pub is_mainnet: bool,
    pub electrum_url: String,
    pub policy_asset_id: String,
}

// ============================================================================
// App state manager
// ============================================================================

/// Owns the persisted [`WalletConfig`] and the wallet opened for its network.
pub struct AppStateManager {
    app_data_dir: PathBuf,
    config: Option<WalletConfig>,
    wallet: Option<WalletManager>,
}

impl AppStateManager {
    pub fn new(app_data_dir: PathBuf) -> Self {
        Self {
            app_data_dir,
            config: None,
            wallet: None,
        }
    }

    /// Load the saved config and open its wallet, if one was configured.
    pub fn initialize(&mut self) -> Result<(), WalletError> {
        if let Some(config) = load_config(&self.app_data_dir) {
            self.open(config)?;
        }
        Ok(())
    }

    pub fn is_first_launch(&self) -> bool {
        !self.app_data_dir.join(CONFIG_FILE).exists()
    }

    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    pub fn network(&self) -> Option<Network> {
        self.config.as_ref().map(|c| c.network)
    }

    /// Switch networks, keeping any endpoint overrides that were saved for
    /// the same network.
    pub fn set_network(&mut self, network: Network) -> Result<NetworkStatus, WalletError> {
        let config = match self.config.take() {
            Some(existing) if existing.network == network => existing,
            _ => WalletConfig {
                data_dir: self.app_data_dir.clone(),
                ..WalletConfig::for_network(network)
            },
        };
        self.set_config(config)
    }

    /// Persist `config` and reopen the wallet for it.
    pub fn set_config(&mut self, config: WalletConfig) -> Result<NetworkStatus, WalletError> {
        save_config(&self.app_data_dir, &config)?;
        self.open(config)?;
        Ok(self.network_status())
    }

    fn open(&mut self, mut config: WalletConfig) -> Result<(), WalletError> {
        config.data_dir = self.app_data_dir.clone();
        self.wallet = Some(WalletManager::open(config.clone())?);
        self.config = Some(config);
        Ok(())
    }

    pub fn wallet(&self) -> Option<&WalletManager> {
        self.wallet.as_ref()
    }

    pub fn wallet_mut(&mut self) -> Option<&mut WalletManager> {
        self.wallet.as_mut()
    }

    pub fn network_status(&self) -> NetworkStatus {
        match &self.config {
            Some(config) => NetworkStatus {
                network: config.network.as_str().to_string(),
                is_mainnet: config.network.is_mainnet(),
                electrum_url: config.electrum_url().to_string(),
                policy_asset_id: config.network.policy_asset().to_string(),
            },
            None => NetworkStatus {
                network: "unknown".into(),
                is_mainnet: false,
                electrum_url: String::new(),
                policy_asset_id: String::new(),
            },
        }
    }
}

// --- Persistence helpers ---

fn load_config(dir: &Path) -> Option<WalletConfig> {
    let contents = fs::read_to_string(dir.join(CONFIG_FILE)).ok()?;
    match serde_json::from_str(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("state: ignoring unreadable {CONFIG_FILE}: {e}");
            None
        }
    }
}

fn save_config(dir: &Path, config: &WalletConfig) -> Result<(), WalletError> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(config).map_err(marina_sdk::Error::from)?;
    fs::write(dir.join(CONFIG_FILE), json)?;
    Ok(())
}
