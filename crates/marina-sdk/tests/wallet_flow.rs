//! Send-path integration tests: coin selection, fees, blinding, signing and
//! broadcast against the in-memory chain source.

use std::sync::Arc;
use std::time::Duration;

use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::pset::{Input, Output, PartiallySignedTransaction};
use lwk_wollet::elements::{AssetId, OutPoint, Script, Txid};
use marina_sdk::account::MAIN_ACCOUNT_TEST;
use marina_sdk::pset::size::{estimate_fee, millisat_per_byte};
use marina_sdk::testing::{
    MockChainSource, MockTaxiApi, SPONSOR_INPUT_VALUE, TEST_MNEMONIC, TEST_PASSWORD,
    TEST_RELAY_FEE, explicit_txout, funding_tx, opaque_confidential_txout,
};
use marina_sdk::{Error, MarinaSdk, MemoryStore, Network, Recipient, WalletConfig, finalize_and_extract};

// ── Helpers ─────────────────────────────────────────────────────────────

const NETWORK: Network = Network::LiquidRegtest;

fn policy() -> AssetId {
    NETWORK.policy_asset()
}

fn wallet_with_config(config: WalletConfig) -> (MarinaSdk, Arc<MockChainSource>) {
    let chain = Arc::new(MockChainSource::new());
    let sdk = MarinaSdk::new(config, Arc::new(MemoryStore::new()), chain.clone(), None);
    sdk.initialize(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
    (sdk, chain)
}

fn wallet() -> (MarinaSdk, Arc<MockChainSource>) {
    wallet_with_config(WalletConfig::for_network(NETWORK))
}

/// Pay `amount` of `asset` to a fresh receive address and apply it.
fn fund(sdk: &MarinaSdk, chain: &MockChainSource, seed: u8, asset: AssetId, amount: u64) -> OutPoint {
    let addr = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap();
    let tx = funding_tx(seed, vec![explicit_txout(asset, amount, &addr.script)]);
    let txid = chain.add_transaction(&tx, 1);
    sdk.updater().apply(&[(txid, Some(1))]).unwrap();
    OutPoint::new(txid, 0)
}

fn other_asset() -> AssetId {
    "0000000000000000000000000000000000000000000000000000000000000abc"
        .parse()
        .unwrap()
}

fn foreign_script() -> Script {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[0x42; 20]);
    Script::from(bytes)
}

fn fully_blinded(output: &Output) -> bool {
    output.amount_comm.is_some()
        && output.asset_comm.is_some()
        && output.value_rangeproof.is_some()
        && output.asset_surjection_proof.is_some()
}

/// Wallet pset paying 30_000 L-BTC to itself out of a 100_000 funding.
fn self_payment(sdk: &MarinaSdk, chain: &MockChainSource) -> PartiallySignedTransaction {
    fund(sdk, chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
    sdk.create_regular_pset(
        &[Recipient {
            address: dest,
            asset: policy(),
            value: 30_000,
        }],
        &[],
        None,
    )
    .unwrap()
    .pset
}

// ── Tests ───────────────────────────────────────────────────────────────

#[test]
fn funding_is_visible_in_balances() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 50_000);
    fund(&sdk, &chain, 2, policy(), 25_000);

    let balances = sdk.balances(None).unwrap();
    assert_eq!(balances.get(&policy()), Some(&75_000));
    assert_eq!(sdk.utxos(None).unwrap().len(), 2);
}

#[test]
fn send_all_single_utxo() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let result = sdk.create_send_all_pset(&dest, policy(), None).unwrap();

    assert_eq!(result.pset.n_inputs(), 1);
    assert_eq!(result.pset.n_outputs(), 2);
    assert!(result.fee_amount > 0);
    let dest_amount = result.pset.outputs()[0].amount.unwrap();
    assert_eq!(dest_amount + result.fee_amount, 100_000_000);
    assert_eq!(result.pset.outputs()[1].amount, Some(result.fee_amount));
    assert!(result.pset.outputs()[1].script_pubkey.is_empty());
}

#[test]
fn send_all_without_funds_fails() {
    let (sdk, _) = wallet();
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
    let err = sdk.create_send_all_pset(&dest, policy(), None).unwrap_err();
    assert!(matches!(err, Error::CoinSelection { selected_amount: 0, .. }));
}

#[test]
fn regular_pset_covers_targets_and_fee() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 40_000);
    fund(&sdk, &chain, 2, policy(), 60_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let result = sdk
        .create_regular_pset(
            &[Recipient {
                address: dest,
                asset: policy(),
                value: 70_000,
            }],
            &[],
            None,
        )
        .unwrap();

    let pset = &result.pset;
    assert_eq!(pset.n_inputs(), 2);
    let outputs: u64 = pset.outputs().iter().filter_map(|o| o.amount).sum();
    assert_eq!(outputs, 100_000);
    assert_eq!(pset.outputs()[0].amount, Some(70_000));
    let fee_output = pset.outputs().last().unwrap();
    assert!(fee_output.script_pubkey.is_empty());
    assert_eq!(fee_output.amount, Some(result.fee_amount));
}

#[test]
fn insufficient_funds_reports_target() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 10_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let err = sdk
        .create_regular_pset(
            &[Recipient {
                address: dest,
                asset: policy(),
                value: 20_000,
            }],
            &[],
            None,
        )
        .unwrap_err();
    match err {
        Error::CoinSelection {
            target,
            selected_amount,
        } => {
            assert_eq!(target.asset, policy());
            assert_eq!(target.amount, 20_000);
            assert_eq!(selected_amount, 10_000);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn non_policy_asset_fee_is_reselected() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, other_asset(), 5_000);
    fund(&sdk, &chain, 2, policy(), 10_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let result = sdk
        .create_regular_pset(
            &[Recipient {
                address: dest,
                asset: other_asset(),
                value: 5_000,
            }],
            &[],
            None,
        )
        .unwrap();

    assert_eq!(result.pset.n_inputs(), 2);
    assert_eq!(result.selected.len(), 2);
    let policy_out: u64 = result
        .pset
        .outputs()
        .iter()
        .filter(|o| o.asset == Some(policy()))
        .filter_map(|o| o.amount)
        .sum();
    assert_eq!(policy_out, 10_000);
}

#[test]
fn locked_outpoints_are_not_reselected() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let first = sdk.create_send_all_pset(&dest, policy(), None).unwrap();
    let err = sdk.create_send_all_pset(&dest, policy(), None).unwrap_err();
    assert!(matches!(err, Error::CoinSelection { .. }));

    sdk.unlock_outpoints(&first.selected).unwrap();
    assert!(sdk.create_send_all_pset(&dest, policy(), None).is_ok());
}

#[test]
fn locks_expire_after_ttl() {
    let mut config = WalletConfig::for_network(NETWORK);
    config.lock_ttl = Duration::ZERO;
    let (sdk, chain) = wallet_with_config(config);
    fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    sdk.create_send_all_pset(&dest, policy(), None).unwrap();
    assert!(sdk.repository().locked_outpoints().unwrap().is_empty());
    assert!(sdk.create_send_all_pset(&dest, policy(), None).is_ok());
}

#[test]
fn fee_estimation_is_deterministic() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let result = sdk.create_send_all_pset(&dest, policy(), None).unwrap();
    let a = estimate_fee(&result.pset, 0.000001);
    let b = estimate_fee(&result.pset.clone(), 0.000001);
    assert_eq!(a, b);
    assert!(estimate_fee(&result.pset, 0.00001) > a);
}

#[test]
fn blinded_outputs_unblind_to_their_plaintext() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let result = sdk.create_send_all_pset(&dest, policy(), None).unwrap();
    let dest_amount = result.pset.outputs()[0].amount.unwrap();

    let blinded = sdk.blind_pset(result.pset).unwrap();
    let output = &blinded.outputs()[0];
    assert!(output.amount_comm.is_some());
    assert!(output.asset_comm.is_some());
    assert!(output.value_rangeproof.is_some());
    assert!(output.asset_surjection_proof.is_some());

    let mut pset = blinded;
    assert_eq!(sdk.sign_pset(TEST_PASSWORD, &mut pset).unwrap(), 1);
    let tx = finalize_and_extract(pset).unwrap();
    assert!(!tx.output[0].value.is_explicit());

    let data = sdk.unblinder().unblind_output(&tx.output[0]).unwrap();
    assert_eq!(data.value, dest_amount);
    assert_eq!(data.asset, policy());
}

#[test]
fn send_broadcasts_and_updates_state() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let sent = sdk
        .send(
            TEST_PASSWORD,
            &[Recipient {
                address: dest,
                asset: policy(),
                value: 30_000,
            }],
            &[],
        )
        .unwrap();

    assert_eq!(chain.broadcasted(), vec![sent.txid]);
    assert!(sdk.repository().locked_outpoints().unwrap().is_empty());
    // Payment and change both land back in the wallet.
    let balances = sdk.balances(None).unwrap();
    assert_eq!(balances.get(&policy()), Some(&(100_000 - sent.fee_amount)));
    assert_eq!(sdk.utxos(None).unwrap().len(), 2);
}

#[test]
fn send_with_wrong_password_leaves_no_locks() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let err = sdk
        .send(
            "wrong",
            &[Recipient {
                address: dest,
                asset: policy(),
                value: 30_000,
            }],
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPassword));
    assert!(sdk.repository().locked_outpoints().unwrap().is_empty());
    assert!(chain.broadcasted().is_empty());
}

#[test]
fn confirming_a_spent_funding_tx_keeps_it_spent() {
    let (sdk, chain) = wallet();
    let addr = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap();
    let funding = funding_tx(7, vec![explicit_txout(policy(), 100_000, &addr.script)]);
    let funding_id = chain.add_transaction(&funding, 0);
    sdk.updater().apply(&[(funding_id, None)]).unwrap();
    let funded = OutPoint::new(funding_id, 0);

    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
    let sent = sdk
        .send(
            TEST_PASSWORD,
            &[Recipient {
                address: dest,
                asset: policy(),
                value: 30_000,
            }],
            &[],
        )
        .unwrap();
    let balance = sdk.balances(None).unwrap()[&policy()];
    assert_eq!(balance, 100_000 - sent.fee_amount);

    chain.add_transaction(&funding, 5);
    let report = sdk.updater().update_script(&addr.script).unwrap();
    assert_eq!(report.utxos_added, 0);

    let utxos = sdk.utxos(None).unwrap();
    assert!(utxos.iter().all(|u| u.outpoint != funded));
    assert_eq!(sdk.balances(None).unwrap()[&policy()], balance);
    let stored = sdk.repository().transactions(&[funding_id]).unwrap();
    assert_eq!(stored[&funding_id].height, Some(5));
}

#[test]
fn change_exactly_covering_fee_is_dropped() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
    let pay = |value| Recipient {
        address: dest.clone(),
        asset: policy(),
        value,
    };

    let sized = sdk.create_regular_pset(&[pay(50_000)], &[], None).unwrap();
    assert_eq!(sized.pset.n_outputs(), 3);
    sdk.unlock_outpoints(&sized.selected).unwrap();

    let fee = sized.fee_amount;
    let exact = sdk
        .create_regular_pset(&[pay(100_000 - fee)], &[], None)
        .unwrap();
    assert_eq!(exact.fee_amount, fee);
    let outputs = exact.pset.outputs();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].amount, Some(100_000 - fee));
    assert!(outputs[1].script_pubkey.is_empty());
    assert_eq!(outputs[1].amount, Some(fee));
}

#[test]
fn reselected_leftover_below_change_cost_goes_to_fee() {
    let pay = |sdk: &MarinaSdk| Recipient {
        address: sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address,
        asset: policy(),
        value: 30_000,
    };

    // Same shape with room for change, to learn the fee without one.
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 30_000);
    fund(&sdk, &chain, 2, policy(), 20_000);
    let roomy = sdk.create_regular_pset(&[pay(&sdk)], &[], None).unwrap();
    assert_eq!(roomy.pset.n_outputs(), 3);
    let mut bare_shape = PartiallySignedTransaction::new_v2();
    for input in roomy.pset.inputs() {
        bare_shape.add_input(input.clone());
    }
    bare_shape.add_output(roomy.pset.outputs()[0].clone());
    let bare = estimate_fee(&bare_shape, TEST_RELAY_FEE);
    assert!(bare < roomy.fee_amount);

    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, policy(), 30_000);
    fund(&sdk, &chain, 2, policy(), bare + 1);
    let tight = sdk.create_regular_pset(&[pay(&sdk)], &[], None).unwrap();
    assert_eq!(tight.pset.n_inputs(), 2);
    assert_eq!(tight.pset.n_outputs(), 2);
    assert_eq!(tight.fee_amount, bare + 1);
}

#[test]
fn taxi_pset_merges_sponsor_inputs() {
    let (sdk, chain) = wallet();
    let taxi = Arc::new(MockTaxiApi::new(policy(), 700));
    let sdk = sdk.with_taxi(taxi.clone());
    let funded = fund(&sdk, &chain, 1, other_asset(), 5_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let result = sdk
        .create_taxi_pset(
            other_asset(),
            &[Recipient {
                address: dest,
                asset: other_asset(),
                value: 1_000,
            }],
            &[],
            None,
        )
        .unwrap();

    let requests = taxi.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].asset_hash, other_asset());
    assert!(requests[0].estimated_tx_size > 0);
    assert_eq!(requests[0].millisat_per_byte, millisat_per_byte(TEST_RELAY_FEE));

    // Sponsor input first, then the wallet's.
    let pset = &result.pset;
    let sponsor = MockTaxiApi::sponsor_outpoint();
    assert_eq!(pset.n_inputs(), 2);
    assert_eq!(pset.inputs()[0].previous_txid, sponsor.txid);
    assert_eq!(pset.inputs()[1].previous_txid, funded.txid);

    // Sponsor change, sponsor payment, fee, then recipient and change.
    let outputs = pset.outputs();
    assert_eq!(outputs.len(), 5);
    assert_eq!(outputs[1].amount, Some(700));
    assert_eq!(outputs[3].amount, Some(1_000));
    assert_eq!(outputs[3].blinder_index, Some(1));
    assert_eq!(outputs[4].amount, Some(5_000 - 1_000 - 700));
    assert_eq!(outputs[4].blinder_index, Some(1));

    let stored = sdk.repository().blinding_data(&[sponsor]).unwrap();
    assert_eq!(stored[&sponsor].value, SPONSOR_INPUT_VALUE);
    assert_eq!(stored[&sponsor].asset, policy());

    assert_eq!(result.selected, vec![funded]);
    let locked: Vec<OutPoint> = sdk
        .repository()
        .locked_outpoints()
        .unwrap()
        .into_iter()
        .map(|l| l.outpoint)
        .collect();
    assert_eq!(locked, vec![funded]);
}

#[test]
fn taxi_blinding_data_must_match_sponsor_inputs() {
    let (sdk, chain) = wallet();
    let sdk = sdk.with_taxi(Arc::new(MockTaxiApi::new(policy(), 700).without_blinding_data()));
    fund(&sdk, &chain, 1, other_asset(), 5_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;

    let err = sdk
        .create_taxi_pset(
            other_asset(),
            &[Recipient {
                address: dest,
                asset: other_asset(),
                value: 1_000,
            }],
            &[],
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Pset(_)));
    assert!(sdk.repository().locked_outpoints().unwrap().is_empty());
}

#[test]
fn taxi_requires_a_configured_service() {
    let (sdk, chain) = wallet();
    fund(&sdk, &chain, 1, other_asset(), 5_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
    let err = sdk
        .create_taxi_pset(
            other_asset(),
            &[Recipient {
                address: dest,
                asset: other_asset(),
                value: 1_000,
            }],
            &[],
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Taxi(_)));
}

#[test]
fn foreign_blinder_outputs_are_left_for_their_owner() {
    let (sdk, chain) = wallet();
    let mut pset = self_payment(&sdk, &chain);
    assert_eq!(pset.n_outputs(), 3);

    pset.add_input(Input {
        previous_txid: Txid::from_byte_array([0xf0; 32]),
        previous_output_index: 0,
        witness_utxo: Some(opaque_confidential_txout(other_asset(), 2_000, &foreign_script())),
        ..Default::default()
    });
    pset.add_output(Output {
        script_pubkey: foreign_script(),
        amount: Some(2_000),
        asset: Some(other_asset()),
        blinding_key: Some(
            "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
                .parse()
                .unwrap(),
        ),
        blinder_index: Some(1),
        ..Default::default()
    });

    let blinded = sdk.blind_pset(pset).unwrap();
    let outputs = blinded.outputs();
    assert!(fully_blinded(&outputs[0]));
    assert!(fully_blinded(&outputs[1]));
    // Fee output stays explicit.
    assert!(outputs[2].amount_comm.is_none());
    let foreign = &outputs[3];
    assert!(foreign.amount_comm.is_none());
    assert!(foreign.asset_comm.is_none());
    assert_eq!(foreign.amount, Some(2_000));
}

#[test]
fn wallet_input_without_blinding_data_fails_blinding() {
    let (sdk, chain) = wallet();
    let mut pset = self_payment(&sdk, &chain);
    let owned = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().script;
    pset.add_input(Input {
        previous_txid: Txid::from_byte_array([0xf1; 32]),
        previous_output_index: 0,
        witness_utxo: Some(opaque_confidential_txout(policy(), 2_000, &owned)),
        ..Default::default()
    });

    let err = sdk.blind_pset(pset).unwrap_err();
    assert!(matches!(err, Error::Blinding(_)));
}

#[test]
fn one_bad_output_does_not_spoil_the_batch() {
    let (sdk, chain) = wallet();
    let built = {
        fund(&sdk, &chain, 1, policy(), 100_000);
        let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
        sdk.create_regular_pset(
            &[Recipient {
                address: dest,
                asset: policy(),
                value: 30_000,
            }],
            &[],
            None,
        )
        .unwrap()
    };
    let mut pset = sdk.blind_pset(built.pset).unwrap();
    sdk.sign_pset(TEST_PASSWORD, &mut pset).unwrap();
    let payment = finalize_and_extract(pset).unwrap();

    let owned = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().script;
    let mixed = funding_tx(
        9,
        vec![
            opaque_confidential_txout(other_asset(), 2_000, &owned),
            explicit_txout(policy(), 5_000, &owned),
        ],
    );
    let payment_id = chain.add_transaction(&payment, 0);
    let mixed_id = chain.add_transaction(&mixed, 0);

    let report = sdk
        .updater()
        .apply(&[(payment_id, None), (mixed_id, None)])
        .unwrap();
    assert_eq!(report.unblind_errors.len(), 1);
    assert_eq!(report.unblind_errors[0].0, OutPoint::new(mixed_id, 0));

    let unblinded: Vec<OutPoint> = sdk
        .utxos(None)
        .unwrap()
        .into_iter()
        .filter(|u| u.blinding_data.is_some())
        .map(|u| u.outpoint)
        .collect();
    assert!(unblinded.contains(&OutPoint::new(payment_id, 0)));
    assert!(unblinded.contains(&OutPoint::new(payment_id, 1)));
    assert!(unblinded.contains(&OutPoint::new(mixed_id, 1)));

    let balances = sdk.balances(None).unwrap();
    assert_eq!(balances[&policy()], 105_000 - built.fee_amount);
    assert!(!balances.contains_key(&other_asset()));
}

#[test]
fn rejected_broadcast_releases_its_locks() {
    let (sdk, chain) = wallet();
    let funded = fund(&sdk, &chain, 1, policy(), 100_000);
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address;
    let payment = [Recipient {
        address: dest,
        asset: policy(),
        value: 30_000,
    }];

    chain.set_rejecting_broadcasts(true);
    let err = sdk.send(TEST_PASSWORD, &payment, &[]).unwrap_err();
    assert!(matches!(err, Error::Broadcast(_)));
    assert!(sdk.repository().locked_outpoints().unwrap().is_empty());
    assert!(sdk.utxos(None).unwrap().iter().any(|u| u.outpoint == funded));

    chain.set_rejecting_broadcasts(false);
    let sent = sdk.send(TEST_PASSWORD, &payment, &[]).unwrap();
    assert_eq!(chain.broadcasted(), vec![sent.txid]);
}
