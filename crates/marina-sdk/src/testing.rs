//! Test utilities: an in-memory chain source, a fixed mnemonic, and funding
//! transaction helpers, so wallet flows can be exercised without a network.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value as ConfValue, ValueBlindingFactor,
};
use lwk_wollet::elements::encode::{self, serialize_hex};
use lwk_wollet::elements::pset::Input;
use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::secp256k1_zkp::Secp256k1;
use lwk_wollet::elements::{
    AssetId, LockTime, OutPoint, Script, Sequence, Transaction, TxIn, TxOut, TxOutWitness, Txid,
};

use crate::chain::{ChainSource, HistoryEntry, UnspentEntry};
use crate::error::{Error, Result};
use crate::pset::{fee_output, new_pset, payment_output};
use crate::repository::script_key;
use crate::taxi::{TaxiApi, TaxiBlindingData, Topup, TopupRequest, TopupResponse};

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const TEST_PASSWORD: &str = "correct horse battery staple";

/// 0.1 sat/vB, the Liquid default.
pub const TEST_RELAY_FEE: f64 = 0.000001;

pub fn explicit_txout(asset: AssetId, amount: u64, script: &Script) -> TxOut {
    TxOut {
        asset: Asset::Explicit(asset),
        value: ConfValue::Explicit(amount),
        nonce: Nonce::Null,
        script_pubkey: script.clone(),
        witness: TxOutWitness::default(),
    }
}

/// Confidential output with random blinding factors and no nonce, so no
/// wallet key unblinds it.
pub fn opaque_confidential_txout(asset: AssetId, amount: u64, script: &Script) -> TxOut {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let asset = Asset::new_confidential(&secp, asset, AssetBlindingFactor::new(&mut rng));
    let value = match asset.commitment() {
        Some(generator) => {
            ConfValue::new_confidential(&secp, amount, generator, ValueBlindingFactor::new(&mut rng))
        }
        None => ConfValue::Explicit(amount),
    };
    TxOut {
        asset,
        value,
        nonce: Nonce::Null,
        script_pubkey: script.clone(),
        witness: TxOutWitness::default(),
    }
}

/// Transaction spending a dummy outpoint derived from `seed` into `outputs`.
pub fn funding_tx(seed: u8, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), 0),
            is_pegin: false,
            script_sig: Script::new(),
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            asset_issuance: Default::default(),
            witness: Default::default(),
        }],
        output: outputs,
    }
}

#[derive(Default)]
struct MockState {
    txs: HashMap<Txid, Transaction>,
    heights: HashMap<Txid, i32>,
    /// Script hex to txids touching it, in insertion order.
    history: HashMap<String, Vec<Txid>>,
    broadcasted: Vec<Txid>,
}

/// Deterministic in-memory `ChainSource`.
pub struct MockChainSource {
    state: Mutex<MockState>,
    relay_fee: f64,
    failing: AtomicBool,
    rejecting: AtomicBool,
    history_calls: AtomicUsize,
}

impl Default for MockChainSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainSource {
    pub fn new() -> Self {
        Self::with_relay_fee(TEST_RELAY_FEE)
    }

    pub fn with_relay_fee(relay_fee: f64) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            relay_fee,
            failing: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
            history_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|_| Error::MutexPoisoned)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Chain("mock chain source is failing".into()));
        }
        Ok(())
    }

    /// Make every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Refuse broadcasts while every query keeps working.
    pub fn set_rejecting_broadcasts(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Record `tx` as confirmed at `height` (0 = mempool), indexing every
    /// output script and every spent script it touches.
    pub fn add_transaction(&self, tx: &Transaction, height: i32) -> Txid {
        let txid = tx.txid();
        let Ok(mut state) = self.state.lock() else {
            return txid;
        };
        let mut scripts: Vec<String> = tx
            .output
            .iter()
            .filter(|o| !o.script_pubkey.is_empty())
            .map(|o| script_key(&o.script_pubkey))
            .collect();
        for input in &tx.input {
            let prev = state
                .txs
                .get(&input.previous_output.txid)
                .and_then(|p| p.output.get(input.previous_output.vout as usize));
            if let Some(prev) = prev {
                scripts.push(script_key(&prev.script_pubkey));
            }
        }
        for script in scripts {
            let entry = state.history.entry(script).or_default();
            if !entry.contains(&txid) {
                entry.push(txid);
            }
        }
        state.txs.insert(txid, tx.clone());
        state.heights.insert(txid, height);
        txid
    }

    pub fn broadcasted(&self) -> Vec<Txid> {
        self.state
            .lock()
            .map(|s| s.broadcasted.clone())
            .unwrap_or_default()
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.state.lock().ok()?.txs.get(txid).cloned()
    }
}

impl ChainSource for MockChainSource {
    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>> {
        self.check()?;
        let state = self.state()?;
        txids
            .iter()
            .map(|txid| {
                state
                    .txs
                    .get(txid)
                    .map(serialize_hex)
                    .ok_or_else(|| Error::Query(format!("transaction {txid} not found")))
            })
            .collect()
    }

    fn list_unspents(&self, script: &Script) -> Result<Vec<UnspentEntry>> {
        self.check()?;
        let state = self.state()?;
        let key = script_key(script);
        let spent: Vec<OutPoint> = state
            .txs
            .values()
            .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
            .collect();
        let mut out = Vec::new();
        for txid in state.history.get(&key).into_iter().flatten() {
            let Some(tx) = state.txs.get(txid) else {
                continue;
            };
            for (vout, output) in tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, vout as u32);
                if output.script_pubkey == *script && !spent.contains(&outpoint) {
                    out.push(UnspentEntry {
                        txid: *txid,
                        vout: vout as u32,
                        height: state.heights.get(txid).copied().unwrap_or(0),
                    });
                }
            }
        }
        Ok(out)
    }

    fn get_history(&self, script: &Script) -> Result<Vec<HistoryEntry>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let state = self.state()?;
        Ok(state
            .history
            .get(&script_key(script))
            .into_iter()
            .flatten()
            .map(|txid| HistoryEntry {
                txid: *txid,
                height: state.heights.get(txid).copied().unwrap_or(0),
            })
            .collect())
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid> {
        self.check()?;
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(Error::Broadcast("mock chain source rejected the transaction".into()));
        }
        let bytes = hex::decode(tx_hex).map_err(|e| Error::Broadcast(e.to_string()))?;
        let tx: Transaction =
            encode::deserialize(&bytes).map_err(|e| Error::Broadcast(e.to_string()))?;
        let txid = self.add_transaction(&tx, 0);
        self.state()?.broadcasted.push(txid);
        Ok(txid)
    }

    fn get_relay_fee(&self) -> Result<f64> {
        self.check()?;
        Ok(self.relay_fee)
    }
}

/// L-BTC the mock sponsor puts into every partial PSET.
pub const SPONSOR_INPUT_VALUE: u64 = 10_000;

/// Network fee paid by the mock sponsor.
pub const SPONSOR_FEE: u64 = 500;

/// Deterministic fee sponsor: one explicit L-BTC input, its change, the fee,
/// and an output collecting `asset_amount` of the requested asset.
pub struct MockTaxiApi {
    policy_asset: AssetId,
    asset_amount: u64,
    send_blinding_data: bool,
    requests: Mutex<Vec<TopupRequest>>,
}

impl MockTaxiApi {
    pub fn new(policy_asset: AssetId, asset_amount: u64) -> Self {
        Self {
            policy_asset,
            asset_amount,
            send_blinding_data: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with no input blinding data.
    pub fn without_blinding_data(mut self) -> Self {
        self.send_blinding_data = false;
        self
    }

    pub fn sponsor_outpoint() -> OutPoint {
        OutPoint::new(Txid::from_byte_array([0xee; 32]), 0)
    }

    pub fn sponsor_script() -> Script {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend_from_slice(&[0x5a; 20]);
        Script::from(bytes)
    }

    pub fn requests(&self) -> Vec<TopupRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl TaxiApi for MockTaxiApi {
    fn topup(&self, request: &TopupRequest) -> Result<TopupResponse> {
        self.requests
            .lock()
            .map_err(|_| Error::MutexPoisoned)?
            .push(request.clone());

        let script = Self::sponsor_script();
        let sponsor = Self::sponsor_outpoint();
        let mut pset = new_pset();
        pset.add_input(Input {
            previous_txid: sponsor.txid,
            previous_output_index: sponsor.vout,
            witness_utxo: Some(explicit_txout(
                self.policy_asset,
                SPONSOR_INPUT_VALUE,
                &script,
            )),
            ..Default::default()
        });
        pset.add_output(payment_output(
            script.clone(),
            self.policy_asset,
            SPONSOR_INPUT_VALUE - SPONSOR_FEE,
            None,
            0,
        ));
        pset.add_output(payment_output(
            script,
            request.asset_hash,
            self.asset_amount,
            None,
            0,
        ));
        pset.add_output(fee_output(self.policy_asset, SPONSOR_FEE));

        let in_blinding_data = if self.send_blinding_data {
            vec![TaxiBlindingData {
                asset: self.policy_asset,
                value: SPONSOR_INPUT_VALUE,
                asset_blinder: [0; 32],
                value_blinder: [0; 32],
            }]
        } else {
            Vec::new()
        };

        Ok(TopupResponse {
            topup: Topup {
                partial: pset.to_string(),
                topup_id: "mock-topup".into(),
            },
            asset_amount: self.asset_amount,
            asset_spread: 0,
            expiry: 0,
            in_blinding_data,
        })
    }
}
