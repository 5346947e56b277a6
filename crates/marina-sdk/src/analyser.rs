//! Static analysis of tapscript leaves: which keys must sign, and whether the
//! script inspects the spending transaction.

use std::collections::HashMap;

use lwk_wollet::elements::script::Instruction;
use lwk_wollet::elements::secp256k1_zkp::XOnlyPublicKey;
use lwk_wollet::elements::Script;

use crate::contract::ContractLeaf;
use crate::error::{Error, Result};
use crate::taproot::TaprootSpend;

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKSIGADD: u8 = 0xba;

/// Elements introspection opcodes: input/output/tx inspection, current input
/// index push and tx weight.
const INTROSPECTION_OPCODES: std::ops::RangeInclusive<u8> = 0xc7..=0xd6;

/// A public key whose signature the script checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureNeed {
    pub pubkey: Vec<u8>,
}

impl SignatureNeed {
    /// The key as x-only, if it is a 32-byte or compressed 33-byte key.
    pub fn xonly(&self) -> Option<XOnlyPublicKey> {
        match self.pubkey.len() {
            32 => XOnlyPublicKey::from_slice(&self.pubkey).ok(),
            33 => XOnlyPublicKey::from_slice(&self.pubkey[1..]).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptAnalysis {
    pub needs: Vec<SignatureNeed>,
    pub has_introspection: bool,
}

/// Decompile `script` and classify its signature and introspection needs.
pub fn analyse(script: &Script) -> Result<ScriptAnalysis> {
    let mut analysis = ScriptAnalysis::default();
    let mut previous: Option<Instruction<'_>> = None;

    for (position, instruction) in script.instructions().enumerate() {
        let instruction = instruction.map_err(|e| Error::ScriptDecode(format!("{e:?}")))?;
        if let Instruction::Op(op) = instruction {
            let code = op.into_u8();
            if INTROSPECTION_OPCODES.contains(&code) {
                analysis.has_introspection = true;
            }
            if matches!(code, OP_CHECKSIG | OP_CHECKSIGVERIFY | OP_CHECKSIGADD) {
                match previous {
                    None => return Err(Error::InvalidScriptPosition(position)),
                    Some(Instruction::PushBytes(bytes)) if bytes.len() == 32 || bytes.len() == 33 => {
                        analysis.needs.push(SignatureNeed {
                            pubkey: bytes.to_vec(),
                        });
                    }
                    // Key supplied by the witness; not a wallet signature need.
                    Some(_) => {}
                }
            }
        }
        previous = Some(instruction);
    }

    Ok(analysis)
}

/// Analyse every leaf of a taproot tree, keyed by the leaf script hex.
pub fn analyse_tapscript_tree(spend: &TaprootSpend) -> Result<HashMap<String, ScriptAnalysis>> {
    let mut out = HashMap::new();
    for script in spend.leaves() {
        out.insert(hex::encode(script.as_bytes()), analyse(script)?);
    }
    Ok(out)
}

/// A leaf the wallet can satisfy on its own: exactly one signature, by the
/// wallet key, no introspection, and no function inputs besides signatures.
pub fn is_auto_spendable(leaf: &ContractLeaf, wallet_key: &XOnlyPublicKey) -> Result<bool> {
    let analysis = analyse(&leaf.script)?;
    Ok(analysis.needs.len() == 1
        && analysis.needs[0].xonly().as_ref() == Some(wallet_key)
        && !analysis.has_introspection
        && leaf.only_signature_inputs())
}

/// First auto-spendable leaf among `leaves`.
pub fn find_auto_spendable_leaf<'a>(
    leaves: &'a [ContractLeaf],
    wallet_key: &XOnlyPublicKey,
) -> Result<Option<&'a ContractLeaf>> {
    for leaf in leaves {
        if is_auto_spendable(leaf, wallet_key)? {
            return Ok(Some(leaf));
        }
    }
    Ok(None)
}
