use std::fs;
use std::str::FromStr;
use std::sync::Arc;

use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::{Address, AssetId, OutPoint};
use marina_sdk::account::default_account_name;
use marina_sdk::{MarinaSdk, Recipient, WalletConfig, finalize_and_extract};
use marina_store::SqliteStore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::types::{
    LiquidSendResult, SyncSummary, WalletAddress, WalletBalance, WalletStatus, WalletUtxo,
};

const WALLET_DB_FILE: &str = "wallet.sqlite";

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Wallet already exists for this network")]
    AlreadyExists,

    #[error("Invalid mnemonic")]
    InvalidMnemonic,

    #[error("Wallet not unlocked")]
    NotUnlocked,

    #[error("Wrong password")]
    WrongPassword,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("Storage error: {0}")]
    Storage(#[from] marina_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sdk(marina_sdk::Error),
}

impl From<marina_sdk::Error> for WalletError {
    fn from(e: marina_sdk::Error) -> Self {
        match e {
            marina_sdk::Error::InvalidPassword => WalletError::WrongPassword,
            marina_sdk::Error::Mnemonic(_) => WalletError::InvalidMnemonic,
            other => WalletError::Sdk(other),
        }
    }
}

/// Host-side wallet session: owns the engine and holds the password while
/// the wallet is unlocked.
pub struct WalletManager {
    sdk: MarinaSdk,
    password: Option<Zeroizing<String>>,
}

impl WalletManager {
    /// Open the SQLite-backed wallet under `<data_dir>/<network>/`.
    pub fn open(config: WalletConfig) -> Result<Self, WalletError> {
        let dir = config.data_dir.join(config.network.as_str());
        fs::create_dir_all(&dir)?;
        let db_path = dir.join(WALLET_DB_FILE);
        let store = Arc::new(SqliteStore::open(&db_path.to_string_lossy())?);
        Ok(Self::with_sdk(MarinaSdk::connect(config, store)?))
    }

    pub fn with_sdk(sdk: MarinaSdk) -> Self {
        Self {
            sdk,
            password: None,
        }
    }

    pub fn sdk(&self) -> &MarinaSdk {
        &self.sdk
    }

    /// Get the policy asset ID (L-BTC) for the current network.
    pub fn policy_asset_id(&self) -> String {
        self.sdk.network().policy_asset().to_string()
    }

    pub fn status(&self) -> Result<WalletStatus, WalletError> {
        Ok(if !self.sdk.is_initialized()? {
            WalletStatus::NotCreated
        } else if self.password.is_none() {
            WalletStatus::Locked
        } else {
            WalletStatus::Unlocked
        })
    }

    fn password(&self) -> Result<&str, WalletError> {
        self.password
            .as_deref()
            .map(String::as_str)
            .ok_or(WalletError::NotUnlocked)
    }

    /// Create a new wallet with a random mnemonic, encrypt with password.
    /// Returns the mnemonic string for user backup.
    pub fn create_wallet(&mut self, password: &str) -> Result<Zeroizing<String>, WalletError> {
        if self.sdk.is_initialized()? {
            return Err(WalletError::AlreadyExists);
        }
        let mnemonic = self.sdk.create_wallet(password)?;
        self.password = Some(Zeroizing::new(password.to_string()));
        Ok(mnemonic)
    }

    /// Restore wallet from existing mnemonic, encrypt with password, and
    /// rediscover its history.
    pub fn restore_wallet(
        &mut self,
        mnemonic: &str,
        password: &str,
    ) -> Result<SyncSummary, WalletError> {
        if self.sdk.is_initialized()? {
            return Err(WalletError::AlreadyExists);
        }
        self.sdk.initialize(mnemonic, password)?;
        self.password = Some(Zeroizing::new(password.to_string()));
        self.sync()
    }

    /// Unlock existing wallet with password.
    pub fn unlock(&mut self, password: &str) -> Result<(), WalletError> {
        self.sdk.verify_password(password)?;
        self.password = Some(Zeroizing::new(password.to_string()));
        Ok(())
    }

    /// Lock the wallet (drop the password from memory).
    pub fn lock(&mut self) {
        self.password = None;
    }

    /// Scan the default account and apply any new transactions.
    pub fn sync(&mut self) -> Result<SyncSummary, WalletError> {
        self.password()?;
        let account = default_account_name(self.sdk.network());
        let scan = self.sdk.sync_account(account)?;
        let report = self.sdk.update()?;
        Ok(SyncSummary {
            transactions: scan.txids.len(),
            next_receive_index: scan.next.external,
            next_change_index: scan.next.internal,
            unblind_errors: report.unblind_errors.len(),
        })
    }

    /// Get current balance as a map of asset_id hex -> satoshis.
    pub fn balance(&self) -> Result<WalletBalance, WalletError> {
        let assets = self
            .sdk
            .balances(None)?
            .into_iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(asset, amount)| (asset.to_string(), amount))
            .collect();
        Ok(WalletBalance { assets })
    }

    /// Get a fresh receive address of the default account.
    pub fn address(&self) -> Result<WalletAddress, WalletError> {
        self.password()?;
        let result = self
            .sdk
            .get_next_address(default_account_name(self.sdk.network()), None)?;
        Ok(WalletAddress {
            index: result.index,
            address: result.address.to_string(),
            derivation_path: result.derivation_path,
        })
    }

    pub fn utxos(&self) -> Result<Vec<WalletUtxo>, WalletError> {
        Ok(self
            .sdk
            .utxos(None)?
            .iter()
            .filter_map(WalletUtxo::from_output)
            .collect())
    }

    fn parse_address(&self, address: &str) -> Result<Address, WalletError> {
        let address =
            Address::from_str(address).map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        if address.params != self.sdk.network().address_params() {
            return Err(WalletError::InvalidAddress(format!(
                "{address} is not a {} address",
                self.sdk.network()
            )));
        }
        Ok(address)
    }

    /// Send `amount_sat` of `asset` (L-BTC when `None`) to a Liquid address.
    pub fn send(
        &mut self,
        address: &str,
        amount_sat: u64,
        asset: Option<&str>,
    ) -> Result<LiquidSendResult, WalletError> {
        let password = Zeroizing::new(self.password()?.to_string());
        let address = self.parse_address(address)?;
        let asset = match asset {
            Some(hex) => {
                AssetId::from_str(hex).map_err(|e| WalletError::InvalidAsset(e.to_string()))?
            }
            None => self.sdk.network().policy_asset(),
        };

        let sent = self.sdk.send(
            &password,
            &[Recipient {
                address,
                asset,
                value: amount_sat,
            }],
            &[],
        )?;
        Ok(LiquidSendResult {
            txid: sent.txid.to_string(),
            fee_sat: sent.fee_amount,
        })
    }

    pub fn send_lbtc(
        &mut self,
        address: &str,
        amount_sat: u64,
    ) -> Result<LiquidSendResult, WalletError> {
        self.send(address, amount_sat, None)
    }

    /// Sweep the whole L-BTC balance to `address`. A failed sweep unlocks
    /// the outputs it selected.
    pub fn send_all(&mut self, address: &str) -> Result<LiquidSendResult, WalletError> {
        let password = Zeroizing::new(self.password()?.to_string());
        let address = self.parse_address(address)?;
        let built = self
            .sdk
            .create_send_all_pset(&address, self.sdk.network().policy_asset(), None)?;
        let outcome = self.sign_and_broadcast(&password, built.pset);
        self.release(&built.selected);
        let txid = outcome?;
        Ok(LiquidSendResult {
            txid,
            fee_sat: built.fee_amount,
        })
    }

    fn sign_and_broadcast(
        &self,
        password: &str,
        pset: PartiallySignedTransaction,
    ) -> Result<String, WalletError> {
        let mut pset = self.sdk.blind_pset(pset)?;
        self.sdk.sign_pset(password, &mut pset)?;
        let tx = finalize_and_extract(pset)?;
        Ok(self.sdk.broadcast(&tx)?.to_string())
    }

    fn release(&self, outpoints: &[OutPoint]) {
        if let Err(e) = self.sdk.unlock_outpoints(outpoints) {
            log::warn!("wallet: failed to unlock {} outpoints: {e}", outpoints.len());
        }
    }
}
