//! Deterministic accounts: key derivation, address generation, chain scanning
//! with a gap limit, and restoration of programmable accounts.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use lwk_common::Signer;
use lwk_signer::SwSigner;
use lwk_wollet::elements::bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use lwk_wollet::elements::bitcoin::secp256k1::Secp256k1;
use lwk_wollet::elements::secp256k1_zkp::{self, XOnlyPublicKey};
use lwk_wollet::elements::{Address, Script, Txid};
use lwk_wollet::elements_miniscript::confidential::slip77::MasterBlindingKey;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain::ChainSource;
use crate::contract::{Artifact, Contract, ContractArgument};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::repository::WalletRepository;
use crate::types::{ContractDetails, ScriptDetails};

pub const MAIN_ACCOUNT: &str = "mainAccount";
pub const MAIN_ACCOUNT_TEST: &str = "mainAccountTest";

const EXTERNAL_CHAIN: u32 = 0;
const INTERNAL_CHAIN: u32 = 1;

/// Name of the default account for `network`.
pub fn default_account_name(network: Network) -> &'static str {
    if network.is_mainnet() {
        MAIN_ACCOUNT
    } else {
        MAIN_ACCOUNT_TEST
    }
}

/// BIP84-style base path of the default account.
pub fn default_derivation_path(network: Network) -> String {
    format!("m/84'/{}'/0'", network.coin_type())
}

/// SLIP-13 path for a custom account: `m/13'/a'/b'/c'/d'` from
/// `SHA256(LE32(0) || name)`.
pub fn slip13_path(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(0u32.to_le_bytes());
    hasher.update(name.as_bytes());
    let hash = hasher.finalize();

    let parts: Vec<String> = hash[..16]
        .chunks(4)
        .map(|c| {
            let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]) & 0x7fff_ffff;
            format!("{n}'")
        })
        .collect();
    format!("m/13'/{}", parts.join("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Single-key P2WPKH scripts.
    Plain,
    /// Ionio taproot scripts built from an artifact.
    Programmable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStrategy {
    /// ECDSA over the segwit v0 sighash.
    Ecdsa,
    /// Schnorr over the BIP341 leaf sighash, with automatic leaf selection.
    TaprootScriptPath,
}

impl AccountKind {
    pub fn signing_strategy(self) -> SigningStrategy {
        match self {
            AccountKind::Plain => SigningStrategy::Ecdsa,
            AccountKind::Programmable => SigningStrategy::TaprootScriptPath,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIndexes {
    pub external: u32,
    pub internal: u32,
}

impl ChainIndexes {
    pub fn get(&self, is_internal: bool) -> u32 {
        if is_internal { self.internal } else { self.external }
    }

    pub fn get_mut(&mut self, is_internal: bool) -> &mut u32 {
        if is_internal {
            &mut self.internal
        } else {
            &mut self.external
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    pub name: String,
    pub kind: AccountKind,
    pub base_derivation_path: String,
    pub master_xpub: String,
    pub next_key_index: HashMap<Network, ChainIndexes>,
    pub networks: Vec<Network>,
}

/// Artifact and named constructor arguments for a programmable address.
#[derive(Debug, Clone)]
pub struct ProgrammableParams {
    pub artifact: Artifact,
    pub arguments: HashMap<String, ContractArgument>,
}

#[derive(Debug, Clone)]
pub struct AddressResult {
    pub address: Address,
    pub script: Script,
    pub derivation_path: String,
    pub index: u32,
    pub is_internal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub txids: Vec<Txid>,
    pub next: ChainIndexes,
}

/// One regenerable script of a programmable account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorationEntry {
    pub artifact: Artifact,
    pub constructor_params: Vec<ContractArgument>,
    pub index: u32,
    pub is_change: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorationJson {
    pub entries: Vec<RestorationEntry>,
}

fn parse_path(path: &str) -> Result<DerivationPath> {
    path.parse()
        .map_err(|e| Error::Derivation(format!("bad derivation path {path}: {e}")))
}

/// Parse `<base>/<chain>/<index>` back into `(is_internal, index)`.
fn chain_and_index(base: &str, path: &str) -> Option<(bool, u32)> {
    let rest = path.strip_prefix(base)?.strip_prefix('/')?;
    let (chain, index) = rest.split_once('/')?;
    let is_internal = match chain {
        "0" => false,
        "1" => true,
        _ => return None,
    };
    Some((is_internal, index.parse().ok()?))
}

// ── Factory ─────────────────────────────────────────────────────────

/// Loads accounts from the repository, creating them when key material is held.
pub struct AccountFactory {
    repo: Arc<WalletRepository>,
    master_blinding_key: MasterBlindingKey,
    signer: Option<SwSigner>,
}

impl AccountFactory {
    /// Watch-only factory: can only load accounts that already exist.
    pub fn new(repo: Arc<WalletRepository>) -> Result<Self> {
        let key_hex = repo
            .master_blinding_key()?
            .ok_or_else(|| Error::Storage("master blinding key not set".into()))?;
        let master_blinding_key = MasterBlindingKey::from_str(&key_hex)
            .map_err(|e| Error::Storage(format!("bad master blinding key: {e}")))?;
        Ok(Self {
            repo,
            master_blinding_key,
            signer: None,
        })
    }

    pub fn with_signer(repo: Arc<WalletRepository>, signer: SwSigner) -> Result<Self> {
        let mut factory = Self::new(repo)?;
        factory.signer = Some(signer);
        Ok(factory)
    }

    pub fn repository(&self) -> &Arc<WalletRepository> {
        &self.repo
    }

    fn derive_xpub(&self, base_path: &str) -> Result<Xpub> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::Signer("no key material to derive a new account".into()))?;
        signer
            .derive_xpub(&parse_path(base_path)?)
            .map_err(|e| Error::Derivation(format!("{e:?}")))
    }

    /// Create and persist an account at `base_path`.
    pub fn create_account_at(
        &self,
        name: &str,
        kind: AccountKind,
        base_path: &str,
        networks: &[Network],
    ) -> Result<AccountDetails> {
        if self.repo.account(name)?.is_some() {
            return Err(Error::AccountExists(name.to_string()));
        }
        let xpub = self.derive_xpub(base_path)?;
        let details = AccountDetails {
            name: name.to_string(),
            kind,
            base_derivation_path: base_path.to_string(),
            master_xpub: xpub.to_string(),
            next_key_index: networks
                .iter()
                .map(|n| (*n, ChainIndexes::default()))
                .collect(),
            networks: networks.to_vec(),
        };
        self.repo.save_account(&details)?;
        log::info!("account: created {name} ({kind:?}) at {base_path}");
        Ok(details)
    }

    /// Create a custom account at its SLIP-13 path.
    pub fn create_account(
        &self,
        name: &str,
        kind: AccountKind,
        networks: &[Network],
    ) -> Result<AccountDetails> {
        self.create_account_at(name, kind, &slip13_path(name), networks)
    }

    /// Load `name` for `network`, creating a default account when possible.
    pub fn make(&self, network: Network, name: &str) -> Result<Account> {
        let details = match self.repo.account(name)? {
            Some(d) => d,
            None if self.signer.is_some() => {
                let path = if name == default_account_name(network) {
                    default_derivation_path(network)
                } else {
                    slip13_path(name)
                };
                // Networks sharing a coin type share the account.
                let networks: Vec<Network> = Network::ALL
                    .into_iter()
                    .filter(|n| n.coin_type() == network.coin_type())
                    .collect();
                self.create_account_at(name, AccountKind::Plain, &path, &networks)?
            }
            None => return Err(Error::AccountNotFound(name.to_string())),
        };
        if !details.networks.contains(&network) {
            return Err(Error::AccountNetwork(name.to_string(), network.as_str()));
        }
        let xpub = Xpub::from_str(&details.master_xpub)
            .map_err(|e| Error::Derivation(format!("bad account xpub: {e}")))?;

        Ok(Account {
            details,
            network,
            xpub,
            repo: Arc::clone(&self.repo),
            master_blinding_key: self.master_blinding_key,
        })
    }
}

// ── Account ─────────────────────────────────────────────────────────

pub struct Account {
    details: AccountDetails,
    network: Network,
    xpub: Xpub,
    repo: Arc<WalletRepository>,
    master_blinding_key: MasterBlindingKey,
}

/// A derived script, not yet persisted.
struct DerivedScript {
    index: u32,
    script: Script,
    address: Address,
    details: ScriptDetails,
}

impl Account {
    pub fn name(&self) -> &str {
        &self.details.name
    }

    pub fn kind(&self) -> AccountKind {
        self.details.kind
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn details(&self) -> &AccountDetails {
        &self.details
    }

    pub fn derivation_path(&self, is_internal: bool, index: u32) -> String {
        let chain = if is_internal { INTERNAL_CHAIN } else { EXTERNAL_CHAIN };
        format!("{}/{chain}/{index}", self.details.base_derivation_path)
    }

    /// Child public key at `<chain>/<index>` below the account xpub.
    pub fn derive_public_key(&self, is_internal: bool, index: u32) -> Result<secp256k1_zkp::PublicKey> {
        let chain = if is_internal { INTERNAL_CHAIN } else { EXTERNAL_CHAIN };
        let path = [
            ChildNumber::from_normal_idx(chain).map_err(|e| Error::Derivation(e.to_string()))?,
            ChildNumber::from_normal_idx(index).map_err(|e| Error::Derivation(e.to_string()))?,
        ];
        let secp = Secp256k1::verification_only();
        let child = self
            .xpub
            .derive_pub(&secp, &path)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        Ok(child.public_key)
    }

    pub fn derive_xonly_key(&self, is_internal: bool, index: u32) -> Result<XOnlyPublicKey> {
        Ok(self.derive_public_key(is_internal, index)?.x_only_public_key().0)
    }

    fn blinding_keys(
        &self,
        script: &Script,
    ) -> (secp256k1_zkp::SecretKey, secp256k1_zkp::PublicKey) {
        let secp = secp256k1_zkp::Secp256k1::new();
        let sk = self.master_blinding_key.blinding_private_key(script);
        (sk, secp256k1_zkp::PublicKey::from_secret_key(&secp, &sk))
    }

    fn derive_script(
        &self,
        is_internal: bool,
        index: u32,
        params: Option<&ProgrammableParams>,
    ) -> Result<DerivedScript> {
        let derivation_path = self.derivation_path(is_internal, index);
        let params_addr = self.network.address_params();

        let (script, contract) = match (self.details.kind, params) {
            (AccountKind::Plain, None) => {
                let pk = lwk_wollet::elements::bitcoin::PublicKey::new(
                    self.derive_public_key(is_internal, index)?,
                );
                (Address::p2wpkh(&pk, None, params_addr).script_pubkey(), None)
            }
            (AccountKind::Programmable, Some(params)) => {
                let key = self.derive_xonly_key(is_internal, index)?;
                let contract =
                    Contract::with_named_arguments(params.artifact.clone(), &params.arguments, &key)?;
                let details = ContractDetails {
                    artifact: contract.artifact().clone(),
                    constructor_params: contract.arguments().to_vec(),
                };
                (contract.script_pubkey(), Some(details))
            }
            _ => return Err(Error::UnsupportedAccountType(self.details.name.clone())),
        };

        let (blinding_sk, blinding_pk) = self.blinding_keys(&script);
        let address = Address::from_script(&script, Some(blinding_pk), params_addr)
            .ok_or_else(|| Error::InvalidAddress("script has no address form".into()))?;

        Ok(DerivedScript {
            index,
            address,
            details: ScriptDetails {
                network: self.network,
                account_name: self.details.name.clone(),
                derivation_path: Some(derivation_path),
                blinding_private_key: Some(hex::encode(blinding_sk.secret_bytes())),
                contract,
            },
            script,
        })
    }

    /// Derive, persist and return the next unused address of a chain.
    ///
    /// Index read-modify-write happens under the repository account lock.
    pub fn get_next_address(
        &self,
        is_internal: bool,
        params: Option<&ProgrammableParams>,
    ) -> Result<AddressResult> {
        let derived = self
            .repo
            .update_account_indexes(&self.details.name, self.network, |indexes| {
                let index = indexes.get(is_internal);
                let derived = self.derive_script(is_internal, index, params)?;
                self.repo.add_script(&derived.script, &derived.details)?;
                *indexes.get_mut(is_internal) = index
                    .checked_add(1)
                    .ok_or_else(|| Error::Derivation("address index overflow".into()))?;
                Ok(derived)
            })?;

        log::debug!(
            "account: {} next {} address at index {}",
            self.details.name,
            if is_internal { "internal" } else { "external" },
            derived.index
        );

        Ok(AddressResult {
            derivation_path: derived
                .details
                .derivation_path
                .clone()
                .unwrap_or_default(),
            address: derived.address,
            script: derived.script,
            index: derived.index,
            is_internal,
        })
    }

    /// Scan both chains for history, stopping each after `gap_limit`
    /// consecutive unused scripts.
    ///
    /// History lookups run concurrently per batch; nothing is persisted unless the
    /// whole scan succeeds, and stored counters are never lowered.
    pub fn sync(
        &self,
        chain: &dyn ChainSource,
        gap_limit: u32,
        start: Option<ChainIndexes>,
    ) -> Result<SyncResult> {
        if self.details.kind == AccountKind::Programmable {
            return Err(Error::AccountSyncUnsupported(self.details.name.clone()));
        }
        let gap_limit = gap_limit.max(1);
        let start = start.unwrap_or_default();

        let mut result = SyncResult::default();
        let mut to_persist = Vec::new();

        for is_internal in [false, true] {
            let first = start.get(is_internal);
            let mut next_index = first;
            let mut last_used: Option<u32> = None;
            let mut unused_streak = 0u32;
            let mut cursor = first;
            let mut derived_chain = Vec::new();

            'scan: loop {
                let batch: Vec<DerivedScript> = (cursor..cursor.saturating_add(gap_limit))
                    .map(|i| self.derive_script(is_internal, i, None))
                    .collect::<Result<_>>()?;
                let histories = batch
                    .par_iter()
                    .map(|d| chain.get_history(&d.script))
                    .collect::<Result<Vec<_>>>()?;

                for (derived, history) in batch.into_iter().zip(histories) {
                    if history.is_empty() {
                        unused_streak += 1;
                    } else {
                        unused_streak = 0;
                        last_used = Some(derived.index);
                        for entry in history {
                            if !result.txids.contains(&entry.txid) {
                                result.txids.push(entry.txid);
                            }
                        }
                    }
                    derived_chain.push(derived);
                    if unused_streak >= gap_limit {
                        break 'scan;
                    }
                }
                cursor = cursor.saturating_add(gap_limit);
            }

            if let Some(used) = last_used {
                next_index = used + 1;
            }
            *result.next.get_mut(is_internal) = next_index;
            to_persist.extend(derived_chain.into_iter().filter(|d| d.index < next_index));
        }

        let scripts: Vec<(Script, ScriptDetails)> = to_persist
            .into_iter()
            .map(|d| (d.script, d.details))
            .collect();
        self.repo.add_scripts(&scripts)?;
        self.repo.add_txids(self.network, &result.txids)?;
        let next = result.next;
        self.repo
            .update_account_indexes(&self.details.name, self.network, |indexes| {
                indexes.external = indexes.external.max(next.external);
                indexes.internal = indexes.internal.max(next.internal);
                Ok(())
            })?;

        log::info!(
            "sync: {} on {} found {} txs, next indexes {}/{}",
            self.details.name,
            self.network,
            result.txids.len(),
            next.external,
            next.internal
        );
        Ok(result)
    }

    /// Export the artifact and constructor parameters of every script of a
    /// programmable account.
    pub fn restoration_json(&self) -> Result<RestorationJson> {
        if self.details.kind != AccountKind::Programmable {
            return Err(Error::UnsupportedAccountType(self.details.name.clone()));
        }
        let scripts = self
            .repo
            .account_scripts(self.network, std::slice::from_ref(&self.details.name))?;

        let mut entries: Vec<RestorationEntry> = scripts
            .into_iter()
            .filter_map(|(_, details)| {
                let contract = details.contract?;
                let (is_change, index) = chain_and_index(
                    &self.details.base_derivation_path,
                    details.derivation_path.as_deref()?,
                )?;
                Some(RestorationEntry {
                    artifact: contract.artifact,
                    constructor_params: contract.constructor_params,
                    index,
                    is_change,
                })
            })
            .collect();
        entries.sort_by_key(|e| (e.is_change, e.index));
        Ok(RestorationJson { entries })
    }

    /// Regenerate the scripts described by `json` and record their history
    /// without scanning.
    pub fn restore_from_json(
        &self,
        chain: &dyn ChainSource,
        json: &RestorationJson,
    ) -> Result<SyncResult> {
        if self.details.kind != AccountKind::Programmable {
            return Err(Error::UnsupportedAccountType(self.details.name.clone()));
        }

        let mut scripts = Vec::with_capacity(json.entries.len());
        let mut next = ChainIndexes::default();
        for entry in &json.entries {
            let contract = Contract::new(entry.artifact.clone(), entry.constructor_params.clone())
                .map_err(|e| Error::Restoration(e.to_string()))?;
            let script = contract.script_pubkey();
            let (blinding_sk, _) = self.blinding_keys(&script);
            scripts.push((
                script,
                ScriptDetails {
                    network: self.network,
                    account_name: self.details.name.clone(),
                    derivation_path: Some(self.derivation_path(entry.is_change, entry.index)),
                    blinding_private_key: Some(hex::encode(blinding_sk.secret_bytes())),
                    contract: Some(ContractDetails {
                        artifact: entry.artifact.clone(),
                        constructor_params: entry.constructor_params.clone(),
                    }),
                },
            ));
            let after = entry
                .index
                .checked_add(1)
                .ok_or_else(|| Error::Derivation("address index overflow".into()))?;
            let slot = next.get_mut(entry.is_change);
            *slot = (*slot).max(after);
        }

        let histories = scripts
            .par_iter()
            .map(|(script, _)| chain.get_history(script))
            .collect::<Result<Vec<_>>>()?;
        let mut txids = Vec::new();
        for entry in histories.into_iter().flatten() {
            if !txids.contains(&entry.txid) {
                txids.push(entry.txid);
            }
        }

        self.repo.add_scripts(&scripts)?;
        self.repo.add_txids(self.network, &txids)?;
        self.repo
            .update_account_indexes(&self.details.name, self.network, |indexes| {
                indexes.external = indexes.external.max(next.external);
                indexes.internal = indexes.internal.max(next.internal);
                Ok(())
            })?;

        log::info!(
            "account: restored {} scripts for {}",
            scripts.len(),
            self.details.name
        );
        Ok(SyncResult { txids, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths() {
        assert_eq!(default_derivation_path(Network::Liquid), "m/84'/1776'/0'");
        assert_eq!(default_derivation_path(Network::LiquidTestnet), "m/84'/1'/0'");
        assert_eq!(default_account_name(Network::Liquid), MAIN_ACCOUNT);
        assert_eq!(default_account_name(Network::LiquidRegtest), MAIN_ACCOUNT_TEST);
    }

    #[test]
    fn slip13_path_shape() {
        let path = slip13_path("myAccount");
        assert!(path.starts_with("m/13'/"));
        assert_eq!(path.split('/').count(), 6);
        assert!(parse_path(&path).is_ok());
        assert_eq!(path, slip13_path("myAccount"));
        assert_ne!(path, slip13_path("otherAccount"));
    }

    #[test]
    fn chain_and_index_parsing() {
        assert_eq!(chain_and_index("m/1'", "m/1'/0/5"), Some((false, 5)));
        assert_eq!(chain_and_index("m/1'", "m/1'/1/0"), Some((true, 0)));
        assert_eq!(chain_and_index("m/1'", "m/2'/1/0"), None);
        assert_eq!(chain_and_index("m/1'", "m/1'/7/0"), None);
    }

    #[test]
    fn signing_strategy_dispatch() {
        assert_eq!(AccountKind::Plain.signing_strategy(), SigningStrategy::Ecdsa);
        assert_eq!(
            AccountKind::Programmable.signing_strategy(),
            SigningStrategy::TaprootScriptPath
        );
    }
}
