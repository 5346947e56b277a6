//! Keeps the stored transactions and UTXO set in step with the chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lwk_wollet::elements::encode;
use lwk_wollet::elements::{OutPoint, Script, Transaction, TxOut, Txid};

use crate::chain::ChainSource;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::repository::{WalletRepository, script_key};
use crate::types::{TxDetails, UnblindingData};
use crate::unblinder::Unblinder;

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub transactions: usize,
    pub utxos_added: usize,
    pub utxos_spent: usize,
    /// Wallet outputs that could not be unblinded, with the reason.
    pub unblind_errors: Vec<(OutPoint, String)>,
}

pub struct Updater {
    repo: Arc<WalletRepository>,
    chain: Arc<dyn ChainSource>,
    unblinder: Arc<Unblinder>,
    network: Network,
}

fn parse_tx(raw: &str) -> Result<Transaction> {
    let bytes = hex::decode(raw).map_err(|e| Error::Chain(format!("bad tx hex: {e}")))?;
    encode::deserialize(&bytes).map_err(|e| Error::Chain(format!("bad tx: {e}")))
}

fn confirmed_height(height: i32) -> Option<u32> {
    u32::try_from(height).ok().filter(|h| *h > 0)
}

impl Updater {
    pub fn new(
        repo: Arc<WalletRepository>,
        chain: Arc<dyn ChainSource>,
        unblinder: Arc<Unblinder>,
        network: Network,
    ) -> Self {
        Self {
            repo,
            chain,
            unblinder,
            network,
        }
    }

    fn utxo_set(&self) -> Result<HashSet<OutPoint>> {
        Ok(self
            .repo
            .utxos(self.network, None)?
            .into_iter()
            .map(|u| u.outpoint)
            .collect())
    }

    /// Process every recorded txid whose transaction is not stored yet.
    pub fn update_all(&self) -> Result<UpdateReport> {
        let txids = self.repo.txids(self.network)?;
        let stored = self.repo.transactions(&txids)?;
        let missing: Vec<(Txid, Option<u32>)> = txids
            .into_iter()
            .filter(|t| !stored.contains_key(t))
            .map(|t| (t, None))
            .collect();
        self.apply(&missing)
    }

    /// Pull the history of one script, typically after a watcher notification.
    /// Known transactions whose height moved only get their height refreshed.
    pub fn update_script(&self, script: &Script) -> Result<UpdateReport> {
        let history = self.chain.get_history(script)?;
        let stored = self
            .repo
            .transactions(&history.iter().map(|h| h.txid).collect::<Vec<_>>())?;

        let mut moved: Vec<(Txid, TxDetails)> = Vec::new();
        let mut pending: Vec<(Txid, Option<u32>)> = Vec::new();
        for entry in &history {
            let height = confirmed_height(entry.height);
            match stored.get(&entry.txid) {
                Some(details) if details.height == height => {}
                Some(details) => moved.push((
                    entry.txid,
                    TxDetails {
                        hex: details.hex.clone(),
                        height,
                    },
                )),
                None => pending.push((entry.txid, height)),
            }
        }

        if !moved.is_empty() {
            self.repo.set_transactions(&moved)?;
            log::debug!("updater: {} txs changed height", moved.len());
        }
        let mut report = self.apply(&pending)?;
        report.transactions += moved.len();
        Ok(report)
    }

    /// Fetch, store and apply `txs`: wallet outputs are unblinded and added to
    /// the UTXO set, spent outpoints are removed.
    pub fn apply(&self, txs: &[(Txid, Option<u32>)]) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        if txs.is_empty() {
            return Ok(report);
        }

        let ids: Vec<Txid> = txs.iter().map(|(t, _)| *t).collect();
        let raw = self.chain.fetch_transactions(&ids)?;
        let heights: HashMap<Txid, Option<u32>> = txs.iter().copied().collect();

        let mut details = Vec::with_capacity(raw.len());
        let mut parsed = Vec::with_capacity(raw.len());
        for (txid, hex) in ids.iter().zip(raw) {
            parsed.push(parse_tx(&hex)?);
            details.push((
                *txid,
                TxDetails {
                    hex,
                    height: heights.get(txid).copied().flatten(),
                },
            ));
        }

        let scripts: Vec<Script> = parsed
            .iter()
            .flat_map(|tx| tx.output.iter().map(|o| o.script_pubkey.clone()))
            .collect();
        let owned = self.repo.scripts_details(&scripts)?;

        let mut added: Vec<(OutPoint, TxOut)> = Vec::new();
        let mut spent: Vec<OutPoint> = Vec::new();
        for tx in &parsed {
            let txid = tx.txid();
            for input in &tx.input {
                spent.push(input.previous_output);
            }
            for (vout, output) in tx.output.iter().enumerate() {
                if output.script_pubkey.is_empty() {
                    continue;
                }
                if owned.contains_key(&script_key(&output.script_pubkey)) {
                    added.push((OutPoint::new(txid, vout as u32), output.clone()));
                }
            }
        }

        let mut blinding: Vec<(OutPoint, UnblindingData)> = Vec::new();
        for outcome in self.unblinder.unblind(&added) {
            match outcome.result {
                Ok(data) => blinding.push((outcome.outpoint, data)),
                Err(e) => {
                    log::warn!("updater: cannot unblind {}: {e}", outcome.outpoint);
                    report.unblind_errors.push((outcome.outpoint, e.to_string()));
                }
            }
        }

        self.repo.set_transactions(&details)?;
        self.repo.update_outpoint_blinding_data(&blinding)?;
        let before = self.utxo_set()?;
        self.repo.apply_utxo_changes(self.network, &added, &spent)?;
        let after = self.utxo_set()?;
        self.repo.add_txids(self.network, &ids)?;

        report.transactions = details.len();
        report.utxos_added = after.difference(&before).count();
        report.utxos_spent = before.difference(&after).count();
        log::info!(
            "updater: {} txs, +{} / -{} utxos on {}",
            report.transactions,
            report.utxos_added,
            report.utxos_spent,
            self.network
        );
        Ok(report)
    }
}
