//! Deterministic transaction size and fee model.
//!
//! Estimates are a pure function of the PSET's input and output shapes, with
//! a planned explicit fee output always accounted for.

use lwk_wollet::elements::pset::{Input, Output, PartiallySignedTransaction};

/// Version + locktime + segwit flag.
const TX_FIXED_SIZE: usize = 9;
/// Previous txid + vout + sequence.
const INPUT_FIXED_SIZE: usize = 40;
const EXPLICIT_ASSET_SIZE: usize = 33;
const EXPLICIT_VALUE_SIZE: usize = 9;
const CONFIDENTIAL_VALUE_SIZE: usize = 33;
const NULL_NONCE_SIZE: usize = 1;
const CONFIDENTIAL_NONCE_SIZE: usize = 33;
const RANGEPROOF_SIZE: usize = 4174;
const ECDSA_SIG_SIZE: usize = 72;
const SCHNORR_SIG_SIZE: usize = 65;
const COMPRESSED_PUBKEY_SIZE: usize = 33;
/// `<xonly> OP_CHECKSIG` under a single-level tree, used when no leaf is attached yet.
const DEFAULT_LEAF_SCRIPT_SIZE: usize = 34;
const DEFAULT_CONTROL_BLOCK_SIZE: usize = 65;
/// Empty rangeproof and surjection proof of the fee output.
const FEE_OUTPUT_WITNESS_SIZE: usize = 2;

pub fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn var_slice_len(n: usize) -> usize {
    varint_len(n) + n
}

fn is_v1_p2tr(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == 0x51 && script[1] == 0x20
}

/// Output that is or will be confidential.
fn is_confidential(output: &Output) -> bool {
    output.blinding_key.is_some() || output.amount_comm.is_some()
}

fn output_base_size(output: &Output) -> usize {
    let script = var_slice_len(output.script_pubkey.len());
    if is_confidential(output) {
        EXPLICIT_ASSET_SIZE + CONFIDENTIAL_VALUE_SIZE + CONFIDENTIAL_NONCE_SIZE + script
    } else {
        EXPLICIT_ASSET_SIZE + EXPLICIT_VALUE_SIZE + NULL_NONCE_SIZE + script
    }
}

fn surjection_proof_size(n_inputs: usize) -> usize {
    2 + n_inputs.div_ceil(8) + 32 * (n_inputs + 1)
}

fn output_witness_size(output: &Output, n_inputs: usize) -> usize {
    if is_confidential(output) {
        var_slice_len(surjection_proof_size(n_inputs)) + var_slice_len(RANGEPROOF_SIZE)
    } else {
        2
    }
}

fn fee_output_base_size() -> usize {
    EXPLICIT_ASSET_SIZE + EXPLICIT_VALUE_SIZE + NULL_NONCE_SIZE + var_slice_len(0)
}

fn stack_size(items: &[usize]) -> usize {
    varint_len(items.len()) + items.iter().map(|n| var_slice_len(*n)).sum::<usize>()
}

/// Script witness of an input once finalized.
fn input_script_witness_size(input: &Input) -> usize {
    if let Some(witness) = &input.final_script_witness {
        return stack_size(&witness.iter().map(Vec::len).collect::<Vec<_>>());
    }
    let script = input
        .witness_utxo
        .as_ref()
        .map(|u| u.script_pubkey.as_bytes())
        .unwrap_or_default();
    if is_v1_p2tr(script) {
        match input.tap_scripts.iter().next() {
            Some((control_block, (leaf, _))) => stack_size(&[
                SCHNORR_SIG_SIZE,
                leaf.len(),
                control_block.serialize().len(),
            ]),
            None => stack_size(&[
                SCHNORR_SIG_SIZE,
                DEFAULT_LEAF_SCRIPT_SIZE,
                DEFAULT_CONTROL_BLOCK_SIZE,
            ]),
        }
    } else {
        stack_size(&[ECDSA_SIG_SIZE, COMPRESSED_PUBKEY_SIZE])
    }
}

/// Issuance rangeproofs, script witness, and pegin witness.
fn input_witness_size(input: &Input) -> usize {
    1 + 1 + input_script_witness_size(input) + 1
}

fn input_script_sig_size(input: &Input) -> usize {
    var_slice_len(input.final_script_sig.as_ref().map_or(0, |s| s.len()))
}

/// Virtual size of `pset` plus one explicit fee output.
pub fn estimate_vsize(pset: &PartiallySignedTransaction) -> usize {
    let inputs = pset.inputs();
    let outputs = pset.outputs();

    let base = TX_FIXED_SIZE
        + varint_len(inputs.len())
        + inputs
            .iter()
            .map(|i| INPUT_FIXED_SIZE + input_script_sig_size(i))
            .sum::<usize>()
        + varint_len(outputs.len() + 1)
        + outputs.iter().map(output_base_size).sum::<usize>()
        + fee_output_base_size();

    let witness = inputs.iter().map(input_witness_size).sum::<usize>()
        + outputs
            .iter()
            .map(|o| output_witness_size(o, inputs.len()))
            .sum::<usize>()
        + FEE_OUTPUT_WITNESS_SIZE;

    let weight = base * 3 + (base + witness);
    (weight + 3).div_ceil(4)
}

/// Relay fee (BTC per kvB) to sat per byte, doubled for margin.
fn sat_per_byte(relay_fee: f64) -> f64 {
    relay_fee * 2.0 * 1e8 / 1000.0
}

pub fn fee_for_vsize(vsize: usize, relay_fee: f64) -> u64 {
    (vsize as f64 * sat_per_byte(relay_fee)).ceil() as u64
}

pub fn estimate_fee(pset: &PartiallySignedTransaction, relay_fee: f64) -> u64 {
    fee_for_vsize(estimate_vsize(pset), relay_fee)
}

/// Relay fee (BTC per kvB) as millisatoshi per byte.
pub fn millisat_per_byte(relay_fee: f64) -> u64 {
    (relay_fee * 1e8).round() as u64
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::{AssetId, Script, TxOut, Txid};

    use super::*;

    fn input(script: Script) -> Input {
        Input {
            previous_txid: Txid::from_byte_array([1; 32]),
            previous_output_index: 0,
            witness_utxo: Some(TxOut {
                script_pubkey: script,
                ..TxOut::new_fee(1, AssetId::from_slice(&[2; 32]).unwrap())
            }),
            ..Default::default()
        }
    }

    fn p2wpkh_script() -> Script {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend([7u8; 20]);
        Script::from(bytes)
    }

    #[test]
    fn varint_boundaries() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(0xfc), 1);
        assert_eq!(varint_len(0xfd), 3);
        assert_eq!(varint_len(0x1_0000), 5);
    }

    #[test]
    fn empty_pset_counts_the_fee_output() {
        let pset = PartiallySignedTransaction::new_v2();
        // base = 9 + 1 + 1 + 44 = 55, witness = 2
        assert_eq!(estimate_vsize(&pset), (55 * 4 + 2 + 3usize).div_ceil(4));
    }

    #[test]
    fn estimate_is_deterministic_and_grows_with_inputs() {
        let mut pset = PartiallySignedTransaction::new_v2();
        pset.add_input(input(p2wpkh_script()));
        let one = estimate_vsize(&pset);
        assert_eq!(one, estimate_vsize(&pset.clone()));

        pset.add_input(input(p2wpkh_script()));
        assert!(estimate_vsize(&pset) > one);
    }

    #[test]
    fn confidential_outputs_cost_more() {
        let mut explicit = PartiallySignedTransaction::new_v2();
        explicit.add_output(Output {
            script_pubkey: p2wpkh_script(),
            amount: Some(1),
            ..Default::default()
        });
        let mut confidential = explicit.clone();
        confidential.outputs_mut()[0].blinding_key = Some(
            "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
                .parse()
                .unwrap(),
        );
        assert!(estimate_vsize(&confidential) > estimate_vsize(&explicit) + 1000);
    }

    #[test]
    fn fee_rounds_up() {
        // 0.000001 BTC/kvB doubled = 0.2 sat/B
        assert_eq!(fee_for_vsize(11, 0.000001), 3);
        assert_eq!(fee_for_vsize(101, 0.000001), 21);
        assert_eq!(millisat_per_byte(0.000001), 100);
    }
}
