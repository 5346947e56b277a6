//! Input signing (ECDSA for plain accounts, Schnorr script-path for
//! programmable ones) and final witness assembly.

use std::collections::HashMap;
use std::sync::Arc;

use lwk_signer::SwSigner;
use lwk_wollet::elements::bitcoin;
use lwk_wollet::elements::bitcoin::bip32::DerivationPath;
use lwk_wollet::elements::encode::serialize_hex;
use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::pset::{Input, PartiallySignedTransaction};
use lwk_wollet::elements::schnorr::SchnorrSig;
use lwk_wollet::elements::secp256k1_zkp::{self, All, Keypair, Message, Secp256k1, SecretKey};
use lwk_wollet::elements::sighash::{Prevouts, SighashCache};
use lwk_wollet::elements::taproot::{LeafVersion, TapLeafHash};
use lwk_wollet::elements::{Address, EcdsaSighashType, SchnorrSighashType, Script, Transaction, TxOut};

use crate::account::{AccountKind, SigningStrategy};
use crate::analyser::{analyse, find_auto_spendable_leaf};
use crate::contract::Contract;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::repository::{WalletRepository, script_key};
use crate::types::ScriptDetails;

pub struct SignerService {
    repo: Arc<WalletRepository>,
    signer: SwSigner,
    network: Network,
    secp: Secp256k1<All>,
}

impl SignerService {
    pub fn new(repo: Arc<WalletRepository>, signer: SwSigner, network: Network) -> Self {
        Self {
            repo,
            signer,
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Unlock the stored mnemonic with `password`.
    pub fn from_password(
        repo: Arc<WalletRepository>,
        password: &str,
        network: Network,
    ) -> Result<Self> {
        let encrypted = repo
            .encrypted_mnemonic()?
            .ok_or_else(|| Error::Signer("no mnemonic stored".into()))?;
        let mnemonic = encrypted.decrypt(password)?;
        let signer = SwSigner::new(&mnemonic, network.is_mainnet())
            .map_err(|e| Error::Signer(e.to_string()))?;
        Ok(Self::new(repo, signer, network))
    }

    fn secret_key(&self, path: &str) -> Result<SecretKey> {
        let path: DerivationPath = path
            .parse()
            .map_err(|e| Error::Signer(format!("bad derivation path {path}: {e}")))?;
        let derived = self
            .signer
            .derive_xprv(&path)
            .map_err(|e| Error::Signer(format!("{e:?}")))?;
        SecretKey::from_slice(&derived.private_key.secret_bytes())
            .map_err(|e| Error::Signer(e.to_string()))
    }

    /// Sign every wallet-owned input; returns how many inputs were signed.
    ///
    /// Inputs whose script the wallet does not know are left untouched.
    pub fn sign_pset(&self, pset: &mut PartiallySignedTransaction) -> Result<usize> {
        let tx = pset
            .extract_tx()
            .map_err(|e| Error::Pset(format!("extract unsigned tx: {e}")))?;

        let scripts: Vec<Script> = pset
            .inputs()
            .iter()
            .filter_map(|i| i.witness_utxo.as_ref().map(|u| u.script_pubkey.clone()))
            .collect();
        let owned = self.repo.scripts_details(&scripts)?;
        if owned.is_empty() {
            return Ok(0);
        }
        let prevouts: Option<Vec<TxOut>> =
            pset.inputs().iter().map(|i| i.witness_utxo.clone()).collect();

        let mut kinds: HashMap<String, AccountKind> = HashMap::new();
        let mut cache = SighashCache::new(&tx);
        let mut signed = 0;

        for (index, input) in pset.inputs_mut().iter_mut().enumerate() {
            let Some(utxo) = input.witness_utxo.clone() else {
                continue;
            };
            let Some(details) = owned.get(&script_key(&utxo.script_pubkey)) else {
                continue;
            };
            let Some(path) = details.derivation_path.as_deref() else {
                log::debug!("signer: input {index} has no derivation path, skipping");
                continue;
            };

            let kind = match kinds.get(&details.account_name) {
                Some(kind) => *kind,
                None => {
                    let account = self
                        .repo
                        .account(&details.account_name)?
                        .ok_or_else(|| Error::AccountNotFound(details.account_name.clone()))?;
                    kinds.insert(details.account_name.clone(), account.kind);
                    account.kind
                }
            };
            let secret = self.secret_key(path)?;

            let did_sign = match kind.signing_strategy() {
                SigningStrategy::Ecdsa => {
                    self.sign_ecdsa(&mut cache, index, input, &utxo, &secret)?;
                    true
                }
                SigningStrategy::TaprootScriptPath => {
                    let prevouts = prevouts.as_deref().ok_or_else(|| {
                        Error::Signer("taproot signing needs every input's witness utxo".into())
                    })?;
                    self.sign_taproot(&mut cache, index, input, details, prevouts, &secret)?
                }
            };
            if did_sign {
                signed += 1;
            }
        }

        log::debug!("signer: signed {signed}/{} inputs", pset.n_inputs());
        Ok(signed)
    }

    fn sign_ecdsa(
        &self,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        input: &mut Input,
        utxo: &TxOut,
        secret: &SecretKey,
    ) -> Result<()> {
        let pubkey = bitcoin::PublicKey::new(secp256k1_zkp::PublicKey::from_secret_key(
            &self.secp, secret,
        ));
        let params = self.network.address_params();
        if Address::p2wpkh(&pubkey, None, params).script_pubkey() != utxo.script_pubkey {
            return Err(Error::UnsupportedAccountType(format!(
                "input {index} is not a P2WPKH of its derived key"
            )));
        }

        let script_code = Address::p2pkh(&pubkey, None, params).script_pubkey();
        let sighash =
            cache.segwitv0_sighash(index, &script_code, utxo.value, EcdsaSighashType::All);
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = self.secp.sign_ecdsa(&msg, secret);

        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(EcdsaSighashType::All as u8);
        input.partial_sigs.insert(pubkey, sig_bytes);
        Ok(())
    }

    /// Attach an auto-spendable leaf when none is present, then sign every
    /// attached leaf that checks the wallet key.
    fn sign_taproot(
        &self,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        input: &mut Input,
        details: &ScriptDetails,
        prevouts: &[TxOut],
        secret: &SecretKey,
    ) -> Result<bool> {
        let contract_details = details.contract.as_ref().ok_or_else(|| {
            Error::UnsupportedAccountType(format!("input {index} has no contract details"))
        })?;
        let keypair = Keypair::from_secret_key(&self.secp, secret);
        let (xonly, _) = keypair.x_only_public_key();

        if input.tap_scripts.is_empty() {
            let contract = Contract::new(
                contract_details.artifact.clone(),
                contract_details.constructor_params.clone(),
            )?;
            let Some(leaf) = find_auto_spendable_leaf(contract.leaves(), &xonly)? else {
                log::warn!("signer: input {index} has no leaf the wallet can spend alone");
                return Ok(false);
            };
            let control_block = contract
                .taproot()
                .control_block(&leaf.script)
                .ok_or_else(|| Error::Signer("leaf missing from tap tree".into()))?;
            input
                .tap_scripts
                .insert(control_block, (leaf.script.clone(), LeafVersion::default()));
        }

        let genesis_hash = self.network.genesis_hash();
        let mut signed = false;
        for (script, version) in input.tap_scripts.values() {
            let analysis = analyse(script)?;
            if !analysis.needs.iter().any(|n| n.xonly() == Some(xonly)) {
                continue;
            }
            let leaf_hash = TapLeafHash::from_script(script, *version);
            let sighash = cache
                .taproot_script_spend_signature_hash(
                    index,
                    &Prevouts::All(prevouts),
                    leaf_hash,
                    SchnorrSighashType::All,
                    genesis_hash,
                )
                .map_err(|e| Error::Signer(format!("taproot sighash: {e}")))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &keypair);
            input.tap_script_sigs.insert(
                (xonly, leaf_hash),
                SchnorrSig {
                    sig,
                    hash_ty: SchnorrSighashType::All,
                },
            );
            signed = true;
        }
        Ok(signed)
    }
}

/// Final witness for one input from its attached signatures.
fn final_witness(index: usize, input: &Input) -> Result<Vec<Vec<u8>>> {
    if let Some((control_block, (script, version))) = input.tap_scripts.iter().next() {
        let leaf_hash = TapLeafHash::from_script(script, *version);
        let needs = analyse(script)?.needs;
        let mut witness = Vec::with_capacity(needs.len() + 2);
        for need in needs.iter().rev() {
            let key = need
                .xonly()
                .ok_or_else(|| Error::Finalize(format!("input {index}: bad key in leaf")))?;
            let sig = input.tap_script_sigs.get(&(key, leaf_hash)).ok_or_else(|| {
                Error::Finalize(format!("input {index}: missing signature for {key}"))
            })?;
            witness.push(sig.to_vec());
        }
        witness.push(script.to_bytes());
        witness.push(control_block.serialize());
        return Ok(witness);
    }

    let (pubkey, sig) = input
        .partial_sigs
        .iter()
        .next()
        .ok_or_else(|| Error::Finalize(format!("input {index} has no signatures")))?;
    Ok(vec![sig.clone(), pubkey.to_bytes()])
}

/// Build final witnesses and extract the network transaction. Inputs that
/// already carry a final witness are kept as they are.
pub fn finalize_and_extract(mut pset: PartiallySignedTransaction) -> Result<Transaction> {
    for (index, input) in pset.inputs_mut().iter_mut().enumerate() {
        if input.final_script_witness.is_some() {
            continue;
        }
        input.final_script_witness = Some(final_witness(index, input)?);
    }
    pset.extract_tx()
        .map_err(|e| Error::Finalize(format!("extract: {e}")))
}

/// [`finalize_and_extract`] serialized as hex.
pub fn finalize_to_hex(pset: PartiallySignedTransaction) -> Result<String> {
    Ok(serialize_hex(&finalize_and_extract(pset)?))
}
