use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lwk_wollet::elements::pset::{Output, PartiallySignedTransaction};
use lwk_wollet::elements::secp256k1_zkp;
use lwk_wollet::elements::{OutPoint, TxOutSecrets};
use rand::thread_rng;

use crate::error::{Error, Result};
use crate::repository::WalletRepository;
use crate::types::UnblindingData;
use crate::unblinder::is_explicit;

/// Attaches commitments and proofs to the outputs this wallet can blind.
pub struct BlinderService {
    repo: Arc<WalletRepository>,
}

fn needs_blinding(output: &Output) -> bool {
    output.blinding_key.is_some() && output.amount_comm.is_none() && output.asset_comm.is_none()
}

fn fully_blinded(output: &Output) -> bool {
    output.amount_comm.is_some()
        && output.asset_comm.is_some()
        && output.value_rangeproof.is_some()
        && output.asset_surjection_proof.is_some()
}

fn partially_blinded(output: &Output) -> bool {
    let parts = [
        output.amount_comm.is_some(),
        output.asset_comm.is_some(),
        output.value_rangeproof.is_some(),
        output.asset_surjection_proof.is_some(),
    ];
    parts.iter().any(|p| *p) && !parts.iter().all(|p| *p)
}

impl BlinderService {
    pub fn new(repo: Arc<WalletRepository>) -> Self {
        Self { repo }
    }

    /// Secrets of every input the wallet knows: owned scripts, persisted
    /// blinding data (sponsor inputs), and explicit previous outputs.
    fn input_secrets(&self, pset: &PartiallySignedTransaction) -> Result<HashMap<usize, TxOutSecrets>> {
        let outpoints: Vec<OutPoint> = pset
            .inputs()
            .iter()
            .map(|i| OutPoint::new(i.previous_txid, i.previous_output_index))
            .collect();
        let stored = self.repo.blinding_data(&outpoints)?;
        let scripts: Vec<_> = pset
            .inputs()
            .iter()
            .filter_map(|i| i.witness_utxo.as_ref().map(|u| u.script_pubkey.clone()))
            .collect();
        let owned_scripts = self.repo.scripts_details(&scripts)?;

        let mut secrets = HashMap::new();
        for (index, (input, outpoint)) in pset.inputs().iter().zip(&outpoints).enumerate() {
            if let Some(data) = stored.get(outpoint) {
                secrets.insert(index, data.to_secrets()?);
                continue;
            }
            let Some(utxo) = input.witness_utxo.as_ref() else {
                continue;
            };
            if is_explicit(utxo) {
                if let (Some(asset), Some(value)) = (utxo.asset.explicit(), utxo.value.explicit()) {
                    secrets.insert(index, UnblindingData::explicit(asset, value).to_secrets()?);
                }
                continue;
            }
            if owned_scripts.contains_key(&hex::encode(utxo.script_pubkey.as_bytes())) {
                return Err(Error::Blinding(format!(
                    "missing unblinding data for wallet input {index} ({outpoint})"
                )));
            }
        }
        Ok(secrets)
    }

    /// Blind every output whose blinder index is a known input. Performs the
    /// final pass when no other party is left to blind.
    pub fn blind_pset(&self, mut pset: PartiallySignedTransaction) -> Result<PartiallySignedTransaction> {
        let pending: Vec<usize> = pset
            .outputs()
            .iter()
            .enumerate()
            .filter(|(_, o)| needs_blinding(o))
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Ok(pset);
        }

        let secrets = self.input_secrets(&pset)?;
        let owned: HashSet<usize> = secrets.keys().copied().collect();
        let is_last = pending.iter().all(|&i| {
            pset.outputs()[i]
                .blinder_index
                .is_some_and(|b| owned.contains(&(b as usize)))
        });

        let secp = secp256k1_zkp::Secp256k1::new();
        let mut rng = thread_rng();
        if is_last {
            pset.blind_last(&mut rng, &secp, &secrets)
                .map_err(|e| Error::Blinding(format!("{e:?}")))?;
        } else {
            pset.blind_non_last(&mut rng, &secp, &secrets)
                .map_err(|e| Error::Blinding(format!("{e:?}")))?;
        }

        for (index, output) in pset.outputs().iter().enumerate() {
            if partially_blinded(output) {
                return Err(Error::PartialBlinding(index));
            }
            if is_last && output.blinding_key.is_some() && !fully_blinded(output) {
                return Err(Error::PartialBlinding(index));
            }
        }

        log::debug!(
            "blinder: blinded {} outputs ({} pass)",
            pending.len(),
            if is_last { "final" } else { "non-final" }
        );
        Ok(pset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blinding_state_classification() {
        let mut output = Output::default();
        assert!(!needs_blinding(&output));
        assert!(!partially_blinded(&output));

        output.blinding_key = Some(
            "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
                .parse()
                .unwrap(),
        );
        assert!(needs_blinding(&output));
        assert!(!fully_blinded(&output));
    }
}
