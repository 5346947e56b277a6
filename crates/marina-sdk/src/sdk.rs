use std::collections::HashMap;
use std::sync::Arc;

use lwk_common::Signer;
use lwk_signer::SwSigner;
use lwk_wollet::elements::encode::serialize_hex;
use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::{Address, AssetId, OutPoint, Script, Transaction, Txid};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::account::{
    AccountDetails, AccountFactory, AccountKind, AddressResult, ChainIndexes, MAIN_ACCOUNT,
    MAIN_ACCOUNT_TEST, ProgrammableParams, RestorationJson, SyncResult, default_derivation_path,
};
use crate::blinder::BlinderService;
use crate::chain::{ChainSource, ElectrumChainSource};
use crate::chain_watcher::{ChainEvent, ChainWatcherConfig, ChainWatcherHandle, spawn_chain_watcher};
use crate::config::WalletConfig;
use crate::error::{Error, Result};
use crate::events::WalletEvent;
use crate::mnemonic::{EncryptedMnemonic, parse_mnemonic};
use crate::network::Network;
use crate::pset::builder::{PsetBuilder, PsetResult, TaxiPsetResult};
use crate::registry::{AssetRegistry, EsploraAssetRegistry};
use crate::repository::WalletRepository;
use crate::signer::{SignerService, finalize_and_extract};
use crate::store::KeyValueStore;
use crate::taxi::{HttpTaxiApi, TaxiApi};
use crate::types::{AssetDetails, DataRecipient, Recipient, UnblindedOutput};
use crate::unblinder::Unblinder;
use crate::updater::{UpdateReport, Updater};

/// Outcome of a completed send.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub txid: Txid,
    pub fee_amount: u64,
    pub tx_hex: String,
}

/// Wallet engine bound to one network, one store and one chain source.
pub struct MarinaSdk {
    config: WalletConfig,
    repo: Arc<WalletRepository>,
    chain: Arc<dyn ChainSource>,
    unblinder: Arc<Unblinder>,
    taxi: Option<Arc<dyn TaxiApi>>,
}

impl MarinaSdk {
    pub fn new(
        config: WalletConfig,
        store: Arc<dyn KeyValueStore>,
        chain: Arc<dyn ChainSource>,
        registry: Option<Arc<dyn AssetRegistry>>,
    ) -> Self {
        let repo = Arc::new(WalletRepository::new(store));
        let unblinder = Arc::new(Unblinder::new(Arc::clone(&repo), registry));
        Self {
            config,
            repo,
            chain,
            unblinder,
            taxi: None,
        }
    }

    /// Engine wired to the configured Electrum, Esplora and taxi endpoints.
    pub fn connect(config: WalletConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let chain = Arc::new(ElectrumChainSource::with_timeout(
            config.electrum_url(),
            config.request_timeout,
        ));
        let registry: Arc<dyn AssetRegistry> = Arc::new(EsploraAssetRegistry::new(
            config.esplora_url(),
            config.request_timeout,
        )?);
        let taxi = match config.taxi_url() {
            Some(url) => Some(Arc::new(HttpTaxiApi::new(url, config.request_timeout)?) as Arc<dyn TaxiApi>),
            None => None,
        };
        log::info!(
            "sdk: {} via {} (taxi: {})",
            config.network,
            config.electrum_url(),
            config.taxi_url().unwrap_or("none")
        );
        let mut sdk = Self::new(config, store, chain, Some(registry));
        sdk.taxi = taxi;
        Ok(sdk)
    }

    pub fn with_taxi(mut self, taxi: Arc<dyn TaxiApi>) -> Self {
        self.taxi = Some(taxi);
        self
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<WalletRepository> {
        &self.repo
    }

    pub fn chain(&self) -> &Arc<dyn ChainSource> {
        &self.chain
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.repo.subscribe()
    }

    // ── Bootstrap ───────────────────────────────────────────────────────

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.repo.encrypted_mnemonic()?.is_some())
    }

    /// Generate a fresh mnemonic and initialize the wallet with it.
    pub fn create_wallet(&self, password: &str) -> Result<Zeroizing<String>> {
        let (_, mnemonic) = SwSigner::random(self.network().is_mainnet())
            .map_err(|e| Error::Signer(e.to_string()))?;
        let phrase = Zeroizing::new(mnemonic.to_string());
        self.initialize(&phrase, password)?;
        Ok(phrase)
    }

    /// Initialize from an existing mnemonic and rediscover the default
    /// account's history.
    pub fn restore_wallet(&self, mnemonic: &str, password: &str) -> Result<SyncResult> {
        self.initialize(mnemonic, password)?;
        let name = crate::account::default_account_name(self.network());
        let result = self.sync_account(name)?;
        self.update()?;
        Ok(result)
    }

    /// Store the encrypted mnemonic and master blinding key, then create the
    /// default accounts.
    pub fn initialize(&self, mnemonic: &str, password: &str) -> Result<()> {
        if self.is_initialized()? {
            return Err(Error::Storage("wallet already initialized".into()));
        }
        let phrase = parse_mnemonic(mnemonic)?.to_string();
        let signer = SwSigner::new(&phrase, self.network().is_mainnet())
            .map_err(|e| Error::Signer(e.to_string()))?;
        let master_blinding_key = signer
            .slip77_master_blinding_key()
            .map_err(|e| Error::Signer(e.to_string()))?;

        self.repo
            .set_encrypted_mnemonic(&EncryptedMnemonic::encrypt(&phrase, password)?)?;
        self.repo
            .set_master_blinding_key(&master_blinding_key.to_string())?;

        let factory = AccountFactory::with_signer(Arc::clone(&self.repo), signer)?;
        factory.create_account_at(
            MAIN_ACCOUNT,
            AccountKind::Plain,
            &default_derivation_path(Network::Liquid),
            &[Network::Liquid],
        )?;
        factory.create_account_at(
            MAIN_ACCOUNT_TEST,
            AccountKind::Plain,
            &default_derivation_path(Network::LiquidTestnet),
            &[Network::LiquidTestnet, Network::LiquidRegtest],
        )?;
        log::info!("sdk: wallet initialized on {}", self.network());
        Ok(())
    }

    fn unlock_signer(&self, password: &str) -> Result<SwSigner> {
        let encrypted = self
            .repo
            .encrypted_mnemonic()?
            .ok_or_else(|| Error::Signer("no mnemonic stored".into()))?;
        let mnemonic = encrypted.decrypt(password)?;
        SwSigner::new(&mnemonic, self.network().is_mainnet())
            .map_err(|e| Error::Signer(e.to_string()))
    }

    /// Succeeds only when `password` opens the stored mnemonic.
    pub fn verify_password(&self, password: &str) -> Result<()> {
        self.unlock_signer(password).map(|_| ())
    }

    // ── Accounts ────────────────────────────────────────────────────────

    fn watch_only(&self) -> Result<Arc<AccountFactory>> {
        Ok(Arc::new(AccountFactory::new(Arc::clone(&self.repo))?))
    }

    pub fn create_account(
        &self,
        password: &str,
        name: &str,
        kind: AccountKind,
        networks: &[Network],
    ) -> Result<AccountDetails> {
        let factory = AccountFactory::with_signer(Arc::clone(&self.repo), self.unlock_signer(password)?)?;
        factory.create_account(name, kind, networks)
    }

    pub fn accounts(&self) -> Result<Vec<AccountDetails>> {
        let mut out = Vec::new();
        for name in self.repo.account_names()? {
            if let Some(details) = self.repo.account(&name)? {
                out.push(details);
            }
        }
        Ok(out)
    }

    pub fn get_next_address(
        &self,
        account: &str,
        params: Option<&ProgrammableParams>,
    ) -> Result<AddressResult> {
        self.watch_only()?
            .make(self.network(), account)?
            .get_next_address(false, params)
    }

    pub fn get_next_change_address(
        &self,
        account: &str,
        params: Option<&ProgrammableParams>,
    ) -> Result<AddressResult> {
        self.watch_only()?
            .make(self.network(), account)?
            .get_next_address(true, params)
    }

    /// Rediscover `account`'s used scripts from index zero.
    pub fn sync_account(&self, account: &str) -> Result<SyncResult> {
        self.sync_account_from(account, None)
    }

    pub fn sync_account_from(
        &self,
        account: &str,
        start: Option<ChainIndexes>,
    ) -> Result<SyncResult> {
        self.watch_only()?.make(self.network(), account)?.sync(
            self.chain.as_ref(),
            self.config.gap_limit,
            start,
        )
    }

    pub fn restoration_json(&self, account: &str) -> Result<RestorationJson> {
        self.watch_only()?
            .make(self.network(), account)?
            .restoration_json()
    }

    pub fn restore_account_from_json(
        &self,
        account: &str,
        json: &RestorationJson,
    ) -> Result<SyncResult> {
        let result = self
            .watch_only()?
            .make(self.network(), account)?
            .restore_from_json(self.chain.as_ref(), json)?;
        self.update()?;
        Ok(result)
    }

    // ── Chain state ─────────────────────────────────────────────────────

    pub fn updater(&self) -> Updater {
        Updater::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.chain),
            Arc::clone(&self.unblinder),
            self.network(),
        )
    }

    pub fn unblinder(&self) -> &Arc<Unblinder> {
        &self.unblinder
    }

    /// Fetch and apply every recorded transaction not stored yet.
    pub fn update(&self) -> Result<UpdateReport> {
        self.updater().update_all()
    }

    pub fn balances(&self, accounts: Option<&[String]>) -> Result<HashMap<AssetId, u64>> {
        self.repo.balances(self.network(), accounts)
    }

    pub fn utxos(&self, accounts: Option<&[String]>) -> Result<Vec<UnblindedOutput>> {
        self.repo.utxos(self.network(), accounts)
    }

    pub fn asset(&self, asset: &AssetId) -> Result<AssetDetails> {
        if let Some(details) = self.repo.asset(asset)? {
            return Ok(details);
        }
        self.unblinder.ensure_asset(asset);
        Ok(self
            .repo
            .asset(asset)?
            .unwrap_or_else(|| AssetDetails::unknown(*asset)))
    }

    /// Start an Electrum subscription relay covering every wallet script.
    pub fn watch(
        &self,
    ) -> Result<(
        ChainWatcherHandle,
        tokio::sync::mpsc::UnboundedReceiver<ChainEvent>,
    )> {
        let mut config = ChainWatcherConfig::new(self.config.electrum_url());
        config.request_timeout = self.config.request_timeout;
        let (handle, events) = spawn_chain_watcher(config)?;
        for script in self.repo.wallet_scripts(self.network())? {
            let bytes = hex::decode(&script).map_err(|e| Error::Storage(e.to_string()))?;
            handle.watch(Script::from(bytes));
        }
        Ok((handle, events))
    }

    // ── Sending ─────────────────────────────────────────────────────────

    pub fn pset_builder(&self) -> Result<PsetBuilder> {
        let builder = PsetBuilder::new(
            Arc::clone(&self.repo),
            self.watch_only()?,
            Arc::clone(&self.chain),
            self.network(),
        )
        .with_lock_ttl(self.config.lock_ttl);
        Ok(match &self.taxi {
            Some(taxi) => builder.with_taxi(Arc::clone(taxi)),
            None => builder,
        })
    }

    pub fn create_regular_pset(
        &self,
        recipients: &[Recipient],
        data: &[DataRecipient],
        accounts: Option<&[String]>,
    ) -> Result<PsetResult> {
        self.pset_builder()?
            .create_regular_pset(recipients, data, accounts)
    }

    pub fn create_send_all_pset(
        &self,
        address: &Address,
        asset: AssetId,
        accounts: Option<&[String]>,
    ) -> Result<PsetResult> {
        self.pset_builder()?
            .create_send_all_pset(address, asset, accounts)
    }

    pub fn create_taxi_pset(
        &self,
        taxi_asset: AssetId,
        recipients: &[Recipient],
        data: &[DataRecipient],
        accounts: Option<&[String]>,
    ) -> Result<TaxiPsetResult> {
        self.pset_builder()?
            .create_taxi_pset(taxi_asset, recipients, data, accounts)
    }

    pub fn blinder(&self) -> BlinderService {
        BlinderService::new(Arc::clone(&self.repo))
    }

    pub fn blind_pset(&self, pset: PartiallySignedTransaction) -> Result<PartiallySignedTransaction> {
        self.blinder().blind_pset(pset)
    }

    pub fn signer(&self, password: &str) -> Result<SignerService> {
        Ok(SignerService::new(
            Arc::clone(&self.repo),
            self.unlock_signer(password)?,
            self.network(),
        ))
    }

    pub fn sign_pset(&self, password: &str, pset: &mut PartiallySignedTransaction) -> Result<usize> {
        self.signer(password)?.sign_pset(pset)
    }

    /// Broadcast `tx` and apply it to the local state right away.
    pub fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid = self.chain.broadcast_transaction(&serialize_hex(tx))?;
        if txid != tx.txid() {
            log::warn!("sdk: chain source returned txid {txid}, expected {}", tx.txid());
        }
        self.updater().apply(&[(txid, None)])?;
        Ok(txid)
    }

    pub fn lock_outpoints(&self, outpoints: &[OutPoint]) -> Result<()> {
        self.repo.lock_outpoints(outpoints, self.config.lock_ttl)
    }

    pub fn unlock_outpoints(&self, outpoints: &[OutPoint]) -> Result<()> {
        self.repo.unlock_outpoints(outpoints)
    }

    /// Build, blind, sign, finalize and broadcast a payment.
    ///
    /// The selected outpoints are unlocked once the attempt ends. After a
    /// successful broadcast they are already spent in the UTXO set; after a
    /// failed blind, sign or broadcast they are spendable again right away
    /// instead of waiting out the lock TTL.
    pub fn send(
        &self,
        password: &str,
        recipients: &[Recipient],
        data: &[DataRecipient],
    ) -> Result<SendResult> {
        let signer = self.signer(password)?;
        let built = self.create_regular_pset(recipients, data, None)?;
        let outcome = self.finish(&signer, built.pset);
        self.repo.unlock_outpoints(&built.selected)?;
        let (txid, tx_hex) = outcome?;
        log::info!("sdk: sent {txid} paying fee {}", built.fee_amount);
        Ok(SendResult {
            txid,
            fee_amount: built.fee_amount,
            tx_hex,
        })
    }

    fn finish(
        &self,
        signer: &SignerService,
        pset: PartiallySignedTransaction,
    ) -> Result<(Txid, String)> {
        let mut pset = self.blind_pset(pset)?;
        signer.sign_pset(&mut pset)?;
        let tx = finalize_and_extract(pset)?;
        let tx_hex = serialize_hex(&tx);
        Ok((self.broadcast(&tx)?, tx_hex))
    }
}
