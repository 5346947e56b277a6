//! Recovery of plaintext value and asset from wallet outputs.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use lwk_wollet::elements::secp256k1_zkp::{All, Secp256k1, SecretKey};
use lwk_wollet::elements::{AssetId, OutPoint, TxOut};
use lwk_wollet::elements_miniscript::confidential::slip77::MasterBlindingKey;

use crate::error::{Error, Result};
use crate::registry::AssetRegistry;
use crate::repository::WalletRepository;
use crate::types::{AssetDetails, UnblindingData};

/// Outcome of unblinding one output; failures do not affect the others.
#[derive(Debug)]
pub struct UnblindOutcome {
    pub outpoint: OutPoint,
    pub result: Result<UnblindingData>,
}

pub struct Unblinder {
    repo: Arc<WalletRepository>,
    registry: Option<Arc<dyn AssetRegistry>>,
    secp: Secp256k1<All>,
}

/// No commitments and no proofs.
pub fn is_explicit(txout: &TxOut) -> bool {
    txout.asset.is_explicit()
        && txout.value.is_explicit()
        && txout.witness.rangeproof.is_none()
        && txout.witness.surjection_proof.is_none()
        && txout.nonce.is_null()
}

impl Unblinder {
    pub fn new(repo: Arc<WalletRepository>, registry: Option<Arc<dyn AssetRegistry>>) -> Self {
        Self {
            repo,
            registry,
            secp: Secp256k1::new(),
        }
    }

    /// Blinding key for a script: the one persisted with the script, or the
    /// SLIP-77 derivation from the master blinding key.
    fn blinding_key(&self, txout: &TxOut) -> Result<SecretKey> {
        let stored = self
            .repo
            .script_details(&txout.script_pubkey)?
            .and_then(|d| d.blinding_private_key);
        if let Some(hex_key) = stored {
            return SecretKey::from_str(&hex_key)
                .map_err(|e| Error::Unblind(format!("bad stored blinding key: {e}")));
        }
        let master = self
            .repo
            .master_blinding_key()?
            .ok_or_else(|| Error::Unblind("no blinding key for script".into()))?;
        let master = MasterBlindingKey::from_str(&master)
            .map_err(|e| Error::Unblind(format!("bad master blinding key: {e}")))?;
        Ok(master.blinding_private_key(&txout.script_pubkey))
    }

    pub fn unblind_output(&self, txout: &TxOut) -> Result<UnblindingData> {
        if is_explicit(txout) {
            match (txout.asset.explicit(), txout.value.explicit()) {
                (Some(asset), Some(value)) => return Ok(UnblindingData::explicit(asset, value)),
                _ => return Err(Error::Unblind("explicit output without value".into())),
            }
        }
        let key = self.blinding_key(txout)?;
        let secrets = txout
            .unblind(&self.secp, key)
            .map_err(|e| Error::Unblind(e.to_string()))?;
        Ok(UnblindingData::from_secrets(&secrets))
    }

    /// Unblind each output independently, then make sure every recovered asset
    /// has metadata.
    pub fn unblind(&self, outputs: &[(OutPoint, TxOut)]) -> Vec<UnblindOutcome> {
        let outcomes: Vec<UnblindOutcome> = outputs
            .iter()
            .map(|(outpoint, txout)| UnblindOutcome {
                outpoint: *outpoint,
                result: self.unblind_output(txout),
            })
            .collect();

        let assets: HashSet<AssetId> = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|d| d.asset))
            .collect();
        for asset in assets {
            self.ensure_asset(&asset);
        }
        outcomes
    }

    /// Store metadata for an unseen asset, falling back to a placeholder.
    pub fn ensure_asset(&self, asset: &AssetId) {
        match self.repo.asset(asset) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                log::warn!("unblinder: asset lookup for {asset} failed: {e}");
                return;
            }
        }
        let details = match &self.registry {
            Some(registry) => registry.fetch_asset(asset).unwrap_or_else(|e| {
                log::debug!("unblinder: registry has no {asset}: {e}");
                AssetDetails::unknown(*asset)
            }),
            None => AssetDetails::unknown(*asset),
        };
        if let Err(e) = self.repo.add_asset(&details) {
            log::warn!("unblinder: storing asset {asset} failed: {e}");
        }
    }
}
