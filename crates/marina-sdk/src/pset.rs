pub mod builder;
pub mod size;

use lwk_wollet::elements::bitcoin;
use lwk_wollet::elements::opcodes::all::OP_RETURN;
use lwk_wollet::elements::pset::{Input, Output, PartiallySignedTransaction, PsbtSighashType};
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::secp256k1_zkp::PublicKey;
use lwk_wollet::elements::{AssetId, EcdsaSighashType, Script};

use crate::types::UnblindedOutput;

/// Create a new empty PSET v2.
pub(crate) fn new_pset() -> PartiallySignedTransaction {
    PartiallySignedTransaction::new_v2()
}

/// Wallet input spending `utxo` with `SIGHASH_ALL`.
pub(crate) fn wallet_input(utxo: &UnblindedOutput) -> Input {
    Input {
        previous_txid: utxo.outpoint.txid,
        previous_output_index: utxo.outpoint.vout,
        witness_utxo: Some(utxo.txout.clone()),
        sighash_type: Some(PsbtSighashType::from_u32(EcdsaSighashType::All as u32)),
        ..Default::default()
    }
}

/// Output paying `amount` of `asset` to `script`; confidential when a blinding
/// key is given, in which case `blinder_index` names the input that blinds it.
pub(crate) fn payment_output(
    script: Script,
    asset: AssetId,
    amount: u64,
    blinding_key: Option<PublicKey>,
    blinder_index: u32,
) -> Output {
    Output {
        script_pubkey: script,
        amount: Some(amount),
        asset: Some(asset),
        blinding_key: blinding_key.map(|inner| bitcoin::PublicKey {
            inner,
            compressed: true,
        }),
        blinder_index: blinding_key.map(|_| blinder_index),
        ..Default::default()
    }
}

/// Unspendable data carrier.
pub(crate) fn data_output(data: &[u8], asset: AssetId, amount: u64) -> Output {
    let script = Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(data)
        .into_script();
    payment_output(script, asset, amount, None, 0)
}

/// Explicit fee output (empty script).
pub(crate) fn fee_output(asset: AssetId, amount: u64) -> Output {
    payment_output(Script::new(), asset, amount, None, 0)
}

/// Copy of `pset` with output `index` dropped.
pub(crate) fn without_output(
    pset: &PartiallySignedTransaction,
    index: usize,
) -> PartiallySignedTransaction {
    let mut out = new_pset();
    for input in pset.inputs() {
        out.add_input(input.clone());
    }
    for (i, output) in pset.outputs().iter().enumerate() {
        if i != index {
            out.add_output(output.clone());
        }
    }
    out
}

pub(crate) fn is_fee_output(output: &Output) -> bool {
    output.script_pubkey.is_empty()
}

/// Fee amount of a built PSET, if it has a fee output.
pub fn fee_amount(pset: &PartiallySignedTransaction) -> Option<u64> {
    pset.outputs()
        .iter()
        .find(|o| is_fee_output(o))
        .and_then(|o| o.amount)
}
