use lwk_wollet::elements::confidential::{AssetBlindingFactor, ValueBlindingFactor};
use lwk_wollet::elements::{Address, AssetId, OutPoint, Script, TxOut, TxOutSecrets, Txid};
use serde::{Deserialize, Serialize};

use crate::contract::{Artifact, ContractArgument};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::serde_utils::{consensus_hex, display_fromstr, hex32};

/// Plaintext value and asset of a (possibly confidential) output.
///
/// Explicit outputs carry all-zero blinding factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblindingData {
    pub value: u64,
    #[serde(with = "display_fromstr")]
    pub asset: AssetId,
    #[serde(with = "hex32")]
    pub asset_blinding_factor: [u8; 32],
    #[serde(with = "hex32")]
    pub value_blinding_factor: [u8; 32],
}

impl UnblindingData {
    pub fn explicit(asset: AssetId, value: u64) -> Self {
        Self {
            value,
            asset,
            asset_blinding_factor: [0u8; 32],
            value_blinding_factor: [0u8; 32],
        }
    }

    pub fn from_secrets(secrets: &TxOutSecrets) -> Self {
        let mut abf = [0u8; 32];
        abf.copy_from_slice(secrets.asset_bf.into_inner().as_ref());
        let mut vbf = [0u8; 32];
        vbf.copy_from_slice(secrets.value_bf.into_inner().as_ref());
        Self {
            value: secrets.value,
            asset: secrets.asset,
            asset_blinding_factor: abf,
            value_blinding_factor: vbf,
        }
    }

    pub fn to_secrets(&self) -> Result<TxOutSecrets> {
        Ok(TxOutSecrets {
            asset: self.asset,
            asset_bf: AssetBlindingFactor::from_slice(&self.asset_blinding_factor)
                .map_err(|e| Error::Blinding(format!("asset blinding factor: {e}")))?,
            value: self.value,
            value_bf: ValueBlindingFactor::from_slice(&self.value_blinding_factor)
                .map_err(|e| Error::Blinding(format!("value blinding factor: {e}")))?,
        })
    }

    pub fn is_explicit(&self) -> bool {
        self.asset_blinding_factor == [0u8; 32] && self.value_blinding_factor == [0u8; 32]
    }
}

/// A wallet output together with its unblinded secrets, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblindedOutput {
    #[serde(with = "display_fromstr")]
    pub outpoint: OutPoint,
    #[serde(with = "consensus_hex")]
    pub txout: TxOut,
    pub blinding_data: Option<UnblindingData>,
}

impl UnblindedOutput {
    pub fn txid(&self) -> Txid {
        self.outpoint.txid
    }

    pub fn vout(&self) -> u32 {
        self.outpoint.vout
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.txout.script_pubkey
    }

    pub fn asset(&self) -> Option<AssetId> {
        self.blinding_data.map(|d| d.asset)
    }

    pub fn value(&self) -> Option<u64> {
        self.blinding_data.map(|d| d.value)
    }
}

/// Programmable-script parameters attached to a wallet script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDetails {
    pub artifact: Artifact,
    pub constructor_params: Vec<ContractArgument>,
}

/// Metadata persisted for every wallet-owned locking script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDetails {
    pub network: Network,
    pub account_name: String,
    pub derivation_path: Option<String>,
    pub blinding_private_key: Option<String>,
    pub contract: Option<ContractDetails>,
}

/// An outpoint temporarily excluded from coin selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedOutpoint {
    #[serde(with = "display_fromstr")]
    pub outpoint: OutPoint,
    /// Expiry as unix milliseconds.
    pub until: i64,
}

impl LockedOutpoint {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.until <= now_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDetails {
    #[serde(with = "display_fromstr")]
    pub asset_hash: AssetId,
    pub name: String,
    pub ticker: String,
    pub precision: u8,
}

impl AssetDetails {
    /// Metadata used when the registry cannot describe an asset.
    pub fn unknown(asset_hash: AssetId) -> Self {
        let hex = asset_hash.to_string();
        Self {
            asset_hash,
            name: "Unknown".to_string(),
            ticker: hex.chars().take(4).collect::<String>().to_uppercase(),
            precision: 8,
        }
    }
}

/// Transaction details stored after a chain fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDetails {
    pub hex: String,
    pub height: Option<u32>,
}

/// Payment to an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub asset: AssetId,
    pub value: u64,
}

/// Unspendable `OP_RETURN` output carrying arbitrary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecipient {
    pub data: Vec<u8>,
    pub asset: AssetId,
    pub value: u64,
}
