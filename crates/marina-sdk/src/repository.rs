//! Typed storage schema over a `KeyValueStore`.
//!
//! Every entity has its own `StoreKey` variant; keys are rendered to strings
//! only when they cross the store boundary. Writes publish `WalletEvent`s.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lwk_wollet::elements::{AssetId, OutPoint, Script, TxOut, Txid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::account::{AccountDetails, ChainIndexes};
use crate::error::{Error, Result};
use crate::events::WalletEvent;
use crate::mnemonic::EncryptedMnemonic;
use crate::network::Network;
use crate::serde_utils::{consensus_hex, display_fromstr};
use crate::store::KeyValueStore;
use crate::types::{
    AssetDetails, LockedOutpoint, ScriptDetails, TxDetails, UnblindedOutput, UnblindingData,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    EncryptedMnemonic,
    MasterBlindingKey,
    AccountNames,
    Account(String),
    Scripts(Network),
    Script(String),
    TxIds(Network),
    Transaction(Txid),
    Utxos(Network),
    SpentOutpoints(Network),
    BlindingData(OutPoint),
    Locks,
    Asset(AssetId),
}

impl StoreKey {
    fn prefix(&self) -> &'static str {
        match self {
            StoreKey::EncryptedMnemonic => "mnemonic",
            StoreKey::MasterBlindingKey => "masterblindingkey",
            StoreKey::AccountNames => "accounts",
            StoreKey::Account(_) => "account",
            StoreKey::Scripts(_) => "scripts",
            StoreKey::Script(_) => "script",
            StoreKey::TxIds(_) => "txids",
            StoreKey::Transaction(_) => "tx",
            StoreKey::Utxos(_) => "utxos",
            StoreKey::SpentOutpoints(_) => "spent",
            StoreKey::BlindingData(_) => "blinding",
            StoreKey::Locks => "locks",
            StoreKey::Asset(_) => "asset",
        }
    }

    fn params(&self) -> Vec<String> {
        match self {
            StoreKey::EncryptedMnemonic
            | StoreKey::MasterBlindingKey
            | StoreKey::AccountNames
            | StoreKey::Locks => vec![],
            StoreKey::Account(name) => vec![name.clone()],
            StoreKey::Scripts(n)
            | StoreKey::TxIds(n)
            | StoreKey::Utxos(n)
            | StoreKey::SpentOutpoints(n) => {
                vec![n.as_str().to_string()]
            }
            StoreKey::Script(hex) => vec![hex.clone()],
            StoreKey::Transaction(txid) => vec![txid.to_string()],
            StoreKey::BlindingData(outpoint) => {
                vec![outpoint.txid.to_string(), outpoint.vout.to_string()]
            }
            StoreKey::Asset(asset) => vec![asset.to_string()],
        }
    }

    /// `<entityPrefix>#<param1>/<param2>/...`, or the bare prefix.
    pub fn render(&self) -> String {
        let params = self.params();
        if params.is_empty() {
            self.prefix().to_string()
        } else {
            format!("{}#{}", self.prefix(), params.join("/"))
        }
    }
}

/// Unspent wallet output as persisted; blinding data lives under its own key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct UtxoEntry {
    #[serde(with = "display_fromstr")]
    outpoint: OutPoint,
    #[serde(with = "consensus_hex")]
    txout: TxOut,
}

pub fn script_key(script: &Script) -> String {
    hex::encode(script.as_bytes())
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct WalletRepository {
    store: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<WalletEvent>,
    /// Guards account index read-modify-write.
    account_lock: Mutex<()>,
    /// Guards list-valued entries (script index, txids, utxos, locks).
    list_lock: Mutex<()>,
    /// Held across coin selection and outpoint locking.
    selection_lock: Mutex<()>,
}

impl WalletRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            events,
            account_lock: Mutex::new(()),
            list_lock: Mutex::new(()),
            selection_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: WalletEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn guard<'a>(lock: &'a Mutex<()>) -> Result<MutexGuard<'a, ()>> {
        lock.lock().map_err(|_| Error::MutexPoisoned)
    }

    pub(crate) fn selection_guard(&self) -> Result<MutexGuard<'_, ()>> {
        Self::guard(&self.selection_lock)
    }

    // ── Raw typed access ────────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, key: &StoreKey) -> Result<Option<T>> {
        let rendered = key.render();
        let mut values = self
            .store
            .get(std::slice::from_ref(&rendered))
            .map_err(Error::Storage)?;
        match values.remove(&rendered) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn get_many<T: DeserializeOwned>(&self, keys: &[StoreKey]) -> Result<HashMap<StoreKey, T>> {
        let rendered: Vec<String> = keys.iter().map(StoreKey::render).collect();
        let values = self.store.get(&rendered).map_err(Error::Storage)?;
        let mut out = HashMap::new();
        for (key, raw_key) in keys.iter().zip(rendered.iter()) {
            if let Some(raw) = values.get(raw_key) {
                out.insert(key.clone(), serde_json::from_str(raw)?);
            }
        }
        Ok(out)
    }

    fn set_entries(&self, entries: Vec<(StoreKey, String)>) -> Result<()> {
        let map = entries.into_iter().map(|(k, v)| (k.render(), v)).collect();
        self.store.set(map).map_err(Error::Storage)
    }

    fn set<T: Serialize>(&self, key: StoreKey, value: &T) -> Result<()> {
        self.set_entries(vec![(key, serde_json::to_string(value)?)])
    }

    fn remove(&self, keys: &[StoreKey]) -> Result<()> {
        let rendered: Vec<String> = keys.iter().map(StoreKey::render).collect();
        self.store.remove(&rendered).map_err(Error::Storage)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear().map_err(Error::Storage)?;
        self.publish(WalletEvent::Reset);
        Ok(())
    }

    // ── Secrets ─────────────────────────────────────────────────────────

    pub fn encrypted_mnemonic(&self) -> Result<Option<EncryptedMnemonic>> {
        self.get(&StoreKey::EncryptedMnemonic)
    }

    pub fn set_encrypted_mnemonic(&self, encrypted: &EncryptedMnemonic) -> Result<()> {
        self.set(StoreKey::EncryptedMnemonic, encrypted)
    }

    pub fn master_blinding_key(&self) -> Result<Option<String>> {
        self.get(&StoreKey::MasterBlindingKey)
    }

    pub fn set_master_blinding_key(&self, key_hex: &str) -> Result<()> {
        self.set(StoreKey::MasterBlindingKey, &key_hex)
    }

    // ── Accounts ────────────────────────────────────────────────────────

    pub fn account_names(&self) -> Result<Vec<String>> {
        Ok(self.get(&StoreKey::AccountNames)?.unwrap_or_default())
    }

    pub fn account(&self, name: &str) -> Result<Option<AccountDetails>> {
        self.get(&StoreKey::Account(name.to_string()))
    }

    /// Persist `details`, registering the name on first save.
    pub fn save_account(&self, details: &AccountDetails) -> Result<()> {
        let _guard = Self::guard(&self.account_lock)?;
        let mut names = self.account_names()?;
        let mut entries = vec![(
            StoreKey::Account(details.name.clone()),
            serde_json::to_string(details)?,
        )];
        if !names.contains(&details.name) {
            names.push(details.name.clone());
            entries.push((StoreKey::AccountNames, serde_json::to_string(&names)?));
        }
        self.set_entries(entries)?;
        self.publish(WalletEvent::AccountUpdated {
            name: details.name.clone(),
        });
        Ok(())
    }

    /// Read-modify-write of one account's indexes for `network`, as a single
    /// critical section. `f` may veto the update by returning an error.
    pub fn update_account_indexes<R>(
        &self,
        name: &str,
        network: Network,
        f: impl FnOnce(&mut ChainIndexes) -> Result<R>,
    ) -> Result<R> {
        let _guard = Self::guard(&self.account_lock)?;
        let mut details = self
            .account(name)?
            .ok_or_else(|| Error::AccountNotFound(name.to_string()))?;
        let indexes = details.next_key_index.entry(network).or_default();
        let result = f(indexes)?;
        self.set(StoreKey::Account(name.to_string()), &details)?;
        self.publish(WalletEvent::AccountUpdated {
            name: name.to_string(),
        });
        Ok(result)
    }

    // ── Scripts ─────────────────────────────────────────────────────────

    pub fn add_script(&self, script: &Script, details: &ScriptDetails) -> Result<()> {
        self.add_scripts(&[(script.clone(), details.clone())])
    }

    pub fn add_scripts(&self, scripts: &[(Script, ScriptDetails)]) -> Result<()> {
        let _guard = Self::guard(&self.list_lock)?;
        let mut indexes: HashMap<Network, Vec<String>> = HashMap::new();
        let mut entries = Vec::new();
        let mut added = Vec::new();

        for (script, details) in scripts {
            let hex = script_key(script);
            let index = match indexes.entry(details.network) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(self.wallet_scripts(details.network)?)
                }
            };
            if !index.contains(&hex) {
                index.push(hex.clone());
                added.push((details.network, hex.clone()));
            }
            entries.push((StoreKey::Script(hex), serde_json::to_string(details)?));
        }
        for (network, index) in indexes {
            entries.push((StoreKey::Scripts(network), serde_json::to_string(&index)?));
        }
        self.set_entries(entries)?;

        for (network, script) in added {
            self.publish(WalletEvent::ScriptAdded { network, script });
        }
        Ok(())
    }

    pub fn wallet_scripts(&self, network: Network) -> Result<Vec<String>> {
        Ok(self.get(&StoreKey::Scripts(network))?.unwrap_or_default())
    }

    pub fn script_details(&self, script: &Script) -> Result<Option<ScriptDetails>> {
        self.get(&StoreKey::Script(script_key(script)))
    }

    /// Details for each of `scripts` that belongs to the wallet, keyed by hex.
    pub fn scripts_details(&self, scripts: &[Script]) -> Result<HashMap<String, ScriptDetails>> {
        let keys: Vec<StoreKey> = scripts
            .iter()
            .map(|s| StoreKey::Script(script_key(s)))
            .collect();
        Ok(self
            .get_many::<ScriptDetails>(&keys)?
            .into_iter()
            .filter_map(|(k, v)| match k {
                StoreKey::Script(hex) => Some((hex, v)),
                _ => None,
            })
            .collect())
    }

    /// Scripts of `accounts` on `network`, with their details.
    pub fn account_scripts(
        &self,
        network: Network,
        accounts: &[String],
    ) -> Result<Vec<(Script, ScriptDetails)>> {
        let hexes = self.wallet_scripts(network)?;
        let keys: Vec<StoreKey> = hexes.iter().cloned().map(StoreKey::Script).collect();
        let details = self.get_many::<ScriptDetails>(&keys)?;

        let mut out = Vec::new();
        for hex in hexes {
            if let Some(d) = details.get(&StoreKey::Script(hex.clone())) {
                if accounts.iter().any(|a| a == &d.account_name) {
                    let bytes = hex::decode(&hex).map_err(|e| Error::Storage(e.to_string()))?;
                    out.push((Script::from(bytes), d.clone()));
                }
            }
        }
        Ok(out)
    }

    // ── Transactions ────────────────────────────────────────────────────

    pub fn txids(&self, network: Network) -> Result<Vec<Txid>> {
        let raw: Vec<String> = self.get(&StoreKey::TxIds(network))?.unwrap_or_default();
        raw.iter()
            .map(|s| s.parse().map_err(|e| Error::Storage(format!("bad txid {s}: {e}"))))
            .collect()
    }

    /// Record `txids`; returns those that were not yet known.
    pub fn add_txids(&self, network: Network, txids: &[Txid]) -> Result<Vec<Txid>> {
        let _guard = Self::guard(&self.list_lock)?;
        let mut known = self.txids(network)?;
        let known_set: HashSet<Txid> = known.iter().copied().collect();
        let mut added = Vec::new();
        for txid in txids {
            if !known_set.contains(txid) && !added.contains(txid) {
                added.push(*txid);
            }
        }
        if added.is_empty() {
            return Ok(added);
        }
        known.extend(added.iter().copied());
        let raw: Vec<String> = known.iter().map(|t| t.to_string()).collect();
        self.set(StoreKey::TxIds(network), &raw)?;
        for txid in &added {
            self.publish(WalletEvent::TransactionAdded {
                network,
                txid: *txid,
            });
        }
        Ok(added)
    }

    pub fn transaction(&self, txid: &Txid) -> Result<Option<TxDetails>> {
        self.get(&StoreKey::Transaction(*txid))
    }

    pub fn transactions(&self, txids: &[Txid]) -> Result<HashMap<Txid, TxDetails>> {
        let keys: Vec<StoreKey> = txids.iter().copied().map(StoreKey::Transaction).collect();
        Ok(self
            .get_many::<TxDetails>(&keys)?
            .into_iter()
            .filter_map(|(k, v)| match k {
                StoreKey::Transaction(txid) => Some((txid, v)),
                _ => None,
            })
            .collect())
    }

    pub fn set_transactions(&self, txs: &[(Txid, TxDetails)]) -> Result<()> {
        let entries = txs
            .iter()
            .map(|(txid, d)| Ok((StoreKey::Transaction(*txid), serde_json::to_string(d)?)))
            .collect::<Result<Vec<_>>>()?;
        self.set_entries(entries)
    }

    // ── UTXOs ───────────────────────────────────────────────────────────

    fn utxo_entries(&self, network: Network) -> Result<Vec<UtxoEntry>> {
        Ok(self.get(&StoreKey::Utxos(network))?.unwrap_or_default())
    }

    /// Outpoints consumed by any transaction the wallet has applied.
    pub fn spent_outpoints(&self, network: Network) -> Result<HashSet<OutPoint>> {
        let raw: Vec<String> = self
            .get(&StoreKey::SpentOutpoints(network))?
            .unwrap_or_default();
        raw.iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| Error::Storage(format!("bad outpoint {s}: {e}")))
            })
            .collect()
    }

    /// Add spendable outputs and spend `spent` ones in a single write.
    ///
    /// Spends are remembered, so an output whose outpoint was consumed by an
    /// earlier batch is never added back.
    pub fn apply_utxo_changes(
        &self,
        network: Network,
        added: &[(OutPoint, TxOut)],
        spent: &[OutPoint],
    ) -> Result<()> {
        let _guard = Self::guard(&self.list_lock)?;
        let mut entries = self.utxo_entries(network)?;
        let before: HashSet<OutPoint> = entries.iter().map(|e| e.outpoint).collect();
        let mut spent_set = self.spent_outpoints(network)?;
        let spent_before = spent_set.len();
        spent_set.extend(spent.iter().copied());

        for (outpoint, txout) in added {
            let known = entries.iter().any(|e| e.outpoint == *outpoint);
            if !known && !spent_set.contains(outpoint) {
                entries.push(UtxoEntry {
                    outpoint: *outpoint,
                    txout: txout.clone(),
                });
            }
        }
        entries.retain(|e| !spent_set.contains(&e.outpoint));

        let after: HashSet<OutPoint> = entries.iter().map(|e| e.outpoint).collect();
        let mut writes = vec![(StoreKey::Utxos(network), serde_json::to_string(&entries)?)];
        if spent_set.len() != spent_before {
            let mut raw: Vec<String> = spent_set.iter().map(|o| o.to_string()).collect();
            raw.sort();
            writes.push((StoreKey::SpentOutpoints(network), serde_json::to_string(&raw)?));
        }
        self.set_entries(writes)?;

        for outpoint in after.difference(&before) {
            self.publish(WalletEvent::UtxoAdded {
                network,
                outpoint: *outpoint,
            });
        }
        for outpoint in before.difference(&after) {
            self.publish(WalletEvent::UtxoSpent {
                network,
                outpoint: *outpoint,
            });
        }
        Ok(())
    }

    /// Unspent outputs on `network`, optionally restricted to `accounts`.
    pub fn utxos(
        &self,
        network: Network,
        accounts: Option<&[String]>,
    ) -> Result<Vec<UnblindedOutput>> {
        let entries = self.utxo_entries(network)?;
        let owners = match accounts {
            Some(_) => {
                let scripts: Vec<Script> =
                    entries.iter().map(|e| e.txout.script_pubkey.clone()).collect();
                Some(self.scripts_details(&scripts)?)
            }
            None => None,
        };
        let outpoints: Vec<OutPoint> = entries.iter().map(|e| e.outpoint).collect();
        let blinding = self.blinding_data(&outpoints)?;

        Ok(entries
            .into_iter()
            .filter(|e| match (accounts, &owners) {
                (Some(names), Some(owners)) => owners
                    .get(&script_key(&e.txout.script_pubkey))
                    .is_some_and(|d| names.iter().any(|n| n == &d.account_name)),
                _ => true,
            })
            .map(|e| UnblindedOutput {
                blinding_data: blinding.get(&e.outpoint).copied(),
                outpoint: e.outpoint,
                txout: e.txout,
            })
            .collect())
    }

    pub fn update_outpoint_blinding_data(&self, data: &[(OutPoint, UnblindingData)]) -> Result<()> {
        let entries = data
            .iter()
            .map(|(o, d)| Ok((StoreKey::BlindingData(*o), serde_json::to_string(d)?)))
            .collect::<Result<Vec<_>>>()?;
        self.set_entries(entries)
    }

    pub fn blinding_data(&self, outpoints: &[OutPoint]) -> Result<HashMap<OutPoint, UnblindingData>> {
        let keys: Vec<StoreKey> = outpoints.iter().copied().map(StoreKey::BlindingData).collect();
        Ok(self
            .get_many::<UnblindingData>(&keys)?
            .into_iter()
            .filter_map(|(k, v)| match k {
                StoreKey::BlindingData(o) => Some((o, v)),
                _ => None,
            })
            .collect())
    }

    /// Per-asset sums over unspent, unblinded outputs.
    pub fn balances(
        &self,
        network: Network,
        accounts: Option<&[String]>,
    ) -> Result<HashMap<AssetId, u64>> {
        let mut out: HashMap<AssetId, u64> = HashMap::new();
        for utxo in self.utxos(network, accounts)? {
            if let Some(data) = utxo.blinding_data {
                let sum = out.entry(data.asset).or_default();
                *sum = sum.saturating_add(data.value);
            }
        }
        Ok(out)
    }

    // ── Locks ───────────────────────────────────────────────────────────

    /// Active locks; expired entries are pruned from the store.
    pub fn locked_outpoints(&self) -> Result<Vec<LockedOutpoint>> {
        let _guard = Self::guard(&self.list_lock)?;
        let locks: Vec<LockedOutpoint> = self.get(&StoreKey::Locks)?.unwrap_or_default();
        let now = now_ms();
        let (active, expired): (Vec<_>, Vec<_>) =
            locks.into_iter().partition(|l| !l.is_expired(now));
        if !expired.is_empty() {
            self.set(StoreKey::Locks, &active)?;
            self.publish(WalletEvent::OutpointsUnlocked(
                expired.iter().map(|l| l.outpoint).collect(),
            ));
        }
        Ok(active)
    }

    pub fn lock_outpoints(&self, outpoints: &[OutPoint], ttl: Duration) -> Result<()> {
        if outpoints.is_empty() {
            return Ok(());
        }
        let _guard = Self::guard(&self.list_lock)?;
        let mut locks: Vec<LockedOutpoint> = self.get(&StoreKey::Locks)?.unwrap_or_default();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let until = now_ms().saturating_add(ttl_ms);
        locks.retain(|l| !outpoints.contains(&l.outpoint));
        locks.extend(outpoints.iter().map(|o| LockedOutpoint {
            outpoint: *o,
            until,
        }));
        self.set(StoreKey::Locks, &locks)?;
        self.publish(WalletEvent::OutpointsLocked(outpoints.to_vec()));
        Ok(())
    }

    pub fn unlock_outpoints(&self, outpoints: &[OutPoint]) -> Result<()> {
        let _guard = Self::guard(&self.list_lock)?;
        let mut locks: Vec<LockedOutpoint> = self.get(&StoreKey::Locks)?.unwrap_or_default();
        let before = locks.len();
        locks.retain(|l| !outpoints.contains(&l.outpoint));
        if locks.len() != before {
            self.set(StoreKey::Locks, &locks)?;
            self.publish(WalletEvent::OutpointsUnlocked(outpoints.to_vec()));
        }
        Ok(())
    }

    // ── Assets ──────────────────────────────────────────────────────────

    pub fn asset(&self, asset: &AssetId) -> Result<Option<AssetDetails>> {
        self.get(&StoreKey::Asset(*asset))
    }

    pub fn add_asset(&self, details: &AssetDetails) -> Result<()> {
        self.set(StoreKey::Asset(details.asset_hash), details)?;
        self.publish(WalletEvent::AssetAdded {
            asset: details.asset_hash,
        });
        Ok(())
    }

    pub fn remove_assets(&self, assets: &[AssetId]) -> Result<()> {
        let keys: Vec<StoreKey> = assets.iter().copied().map(StoreKey::Asset).collect();
        self.remove(&keys)
    }
}
