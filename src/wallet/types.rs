use serde::Serialize;
use std::collections::HashMap;

use marina_sdk::UnblindedOutput;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    NotCreated,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    /// Map of asset_id hex -> satoshi amount
    pub assets: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddress {
    pub index: u32,
    pub address: String,
    pub derivation_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletUtxo {
    pub txid: String,
    pub vout: u32,
    pub asset_id: String,
    pub value: u64,
}

impl WalletUtxo {
    /// `None` for outputs the wallet could not unblind.
    pub fn from_output(utxo: &UnblindedOutput) -> Option<Self> {
        let data = utxo.blinding_data?;
        Some(Self {
            txid: utxo.outpoint.txid.to_string(),
            vout: utxo.outpoint.vout,
            asset_id: data.asset.to_string(),
            value: data.value,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidSendResult {
    pub txid: String,
    pub fee_sat: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub transactions: usize,
    pub next_receive_index: u32,
    pub next_change_index: u32,
    pub unblind_errors: usize,
}
