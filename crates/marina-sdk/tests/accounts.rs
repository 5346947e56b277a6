//! Account integration tests: address derivation, chain discovery, and
//! programmable (taproot) accounts end to end.

use std::collections::HashMap;
use std::sync::Arc;

use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::opcodes::all::OP_CHECKSIG;
use lwk_wollet::elements::pset::{Input, Output, PartiallySignedTransaction};
use lwk_wollet::elements::script::Builder;
use lwk_wollet::elements::secp256k1_zkp::{Message, Secp256k1};
use lwk_wollet::elements::sighash::{Prevouts, SighashCache};
use lwk_wollet::elements::taproot::TapLeafHash;
use lwk_wollet::elements::{AssetId, SchnorrSighashType, Script};
use marina_sdk::account::MAIN_ACCOUNT_TEST;
use marina_sdk::testing::{
    MockChainSource, TEST_MNEMONIC, TEST_PASSWORD, explicit_txout, funding_tx,
};
use marina_sdk::{
    AccountFactory, AccountKind, Artifact, Error, MarinaSdk, MemoryStore, Network,
    ProgrammableParams, WalletConfig, finalize_and_extract,
};

// ── Helpers ─────────────────────────────────────────────────────────────

const NETWORK: Network = Network::LiquidRegtest;

const VAULT_ARTIFACT: &str = r#"{
    "contractName": "Vault",
    "constructorInputs": [{"name": "owner", "type": "xonlypubkey"}],
    "functions": [
        {
            "name": "spend",
            "functionInputs": [{"name": "ownerSig", "type": "sig"}],
            "asm": ["$owner", "OP_CHECKSIG"]
        },
        {
            "name": "reveal",
            "functionInputs": [{"name": "preimage", "type": "bytes"}],
            "asm": ["OP_SHA256", "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d", "OP_EQUAL"]
        }
    ]
}"#;

fn policy() -> AssetId {
    NETWORK.policy_asset()
}

fn wallet_on(chain: Arc<MockChainSource>) -> MarinaSdk {
    let sdk = MarinaSdk::new(
        WalletConfig::for_network(NETWORK),
        Arc::new(MemoryStore::new()),
        chain,
        None,
    );
    sdk.initialize(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
    sdk
}

fn vault_params() -> ProgrammableParams {
    ProgrammableParams {
        artifact: Artifact::from_json(VAULT_ARTIFACT).unwrap(),
        arguments: HashMap::new(),
    }
}

fn with_vault(sdk: &MarinaSdk) {
    sdk.create_account(TEST_PASSWORD, "vault", AccountKind::Programmable, &[NETWORK])
        .unwrap();
}

// ── Plain accounts ──────────────────────────────────────────────────────

#[test]
fn next_address_indexes_increase() {
    let sdk = wallet_on(Arc::new(MockChainSource::new()));

    for expected in 0..5u32 {
        let addr = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap();
        assert_eq!(addr.index, expected);
        assert!(!addr.is_internal);
        assert_eq!(addr.derivation_path, format!("m/84'/1'/0'/0/{expected}"));

        let stored = sdk
            .repository()
            .script_details(&addr.script)
            .unwrap()
            .unwrap();
        assert_eq!(stored.derivation_path.as_deref(), Some(addr.derivation_path.as_str()));
        assert_eq!(stored.account_name, MAIN_ACCOUNT_TEST);
        assert_eq!(addr.address.script_pubkey(), addr.script);
        assert!(addr.address.is_blinded());
    }

    let change = sdk.get_next_change_address(MAIN_ACCOUNT_TEST, None).unwrap();
    assert_eq!(change.index, 0);
    assert_eq!(change.derivation_path, "m/84'/1'/0'/1/0");
}

#[test]
fn concurrent_derivation_never_reuses_an_index() {
    const THREADS: u32 = 8;
    const PER_THREAD: u32 = 4;
    let sdk = wallet_on(Arc::new(MockChainSource::new()));

    let mut indexes: Vec<u32> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    (0..PER_THREAD)
                        .map(|_| sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().index)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    indexes.sort_unstable();
    assert_eq!(indexes, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    let next = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap();
    assert_eq!(next.index, THREADS * PER_THREAD);
}

#[test]
fn addresses_are_deterministic_across_instances() {
    let a = wallet_on(Arc::new(MockChainSource::new()));
    let b = wallet_on(Arc::new(MockChainSource::new()));
    assert_eq!(
        a.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address,
        b.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().address
    );
}

#[test]
fn plain_account_rejects_contract_params() {
    let sdk = wallet_on(Arc::new(MockChainSource::new()));
    let err = sdk
        .get_next_address(MAIN_ACCOUNT_TEST, Some(&vault_params()))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedAccountType(_)));
}

#[test]
fn unknown_account_is_reported() {
    let sdk = wallet_on(Arc::new(MockChainSource::new()));
    assert!(matches!(
        sdk.get_next_address("nobody", None),
        Err(Error::AccountNotFound(_))
    ));
}

#[test]
fn sync_discovers_used_addresses_and_is_idempotent() {
    let chain = Arc::new(MockChainSource::new());
    let funder = wallet_on(chain.clone());
    let scripts: Vec<Script> = (0..3)
        .map(|_| funder.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().script)
        .collect();
    chain.add_transaction(&funding_tx(1, vec![explicit_txout(policy(), 1_000, &scripts[0])]), 1);
    chain.add_transaction(&funding_tx(2, vec![explicit_txout(policy(), 2_000, &scripts[2])]), 2);

    let sdk = wallet_on(chain.clone());
    let first = sdk.sync_account(MAIN_ACCOUNT_TEST).unwrap();
    assert_eq!(first.next.external, 3);
    assert_eq!(first.next.internal, 0);
    assert_eq!(first.txids.len(), 2);

    let txids_before = sdk.repository().txids(NETWORK).unwrap();
    let second = sdk.sync_account(MAIN_ACCOUNT_TEST).unwrap();
    assert_eq!(second.next, first.next);
    assert_eq!(second.txids, first.txids);
    assert_eq!(sdk.repository().txids(NETWORK).unwrap(), txids_before);

    let details = sdk.repository().account(MAIN_ACCOUNT_TEST).unwrap().unwrap();
    assert_eq!(details.next_key_index[&NETWORK].external, 3);

    sdk.update().unwrap();
    assert_eq!(sdk.balances(None).unwrap().get(&policy()), Some(&3_000));
    assert_eq!(sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap().index, 3);
}

#[test]
fn failed_sync_persists_nothing() {
    let chain = Arc::new(MockChainSource::new());
    let sdk = wallet_on(chain.clone());
    chain.set_failing(true);
    assert!(sdk.sync_account(MAIN_ACCOUNT_TEST).is_err());
    chain.set_failing(false);

    let details = sdk.repository().account(MAIN_ACCOUNT_TEST).unwrap().unwrap();
    assert_eq!(details.next_key_index[&NETWORK].external, 0);
    assert!(sdk.repository().txids(NETWORK).unwrap().is_empty());
}

// ── Programmable accounts ───────────────────────────────────────────────

#[test]
fn programmable_account_cannot_be_synced() {
    let sdk = wallet_on(Arc::new(MockChainSource::new()));
    with_vault(&sdk);
    assert!(matches!(
        sdk.sync_account("vault"),
        Err(Error::AccountSyncUnsupported(_))
    ));
}

#[test]
fn duplicate_account_name_is_rejected() {
    let sdk = wallet_on(Arc::new(MockChainSource::new()));
    with_vault(&sdk);
    let err = sdk
        .create_account(TEST_PASSWORD, "vault", AccountKind::Plain, &[NETWORK])
        .unwrap_err();
    assert!(matches!(err, Error::AccountExists(_)));
}

#[test]
fn taproot_leaf_is_auto_selected_and_signed() {
    let chain = Arc::new(MockChainSource::new());
    let sdk = wallet_on(chain.clone());
    with_vault(&sdk);

    let addr = sdk.get_next_address("vault", Some(&vault_params())).unwrap();
    let tx = funding_tx(7, vec![explicit_txout(policy(), 50_000, &addr.script)]);
    let txid = chain.add_transaction(&tx, 1);
    sdk.updater().apply(&[(txid, Some(1))]).unwrap();

    let utxo = sdk
        .utxos(Some(&["vault".to_string()]))
        .unwrap()
        .pop()
        .unwrap();
    let dest = sdk.get_next_address(MAIN_ACCOUNT_TEST, None).unwrap();

    let mut pset = PartiallySignedTransaction::new_v2();
    let mut input = Input::default();
    input.previous_txid = utxo.outpoint.txid;
    input.previous_output_index = utxo.outpoint.vout;
    input.witness_utxo = Some(utxo.txout.clone());
    pset.add_input(input);
    pset.add_output(Output {
        script_pubkey: dest.script.clone(),
        amount: Some(49_000),
        asset: Some(policy()),
        ..Default::default()
    });
    pset.add_output(Output {
        script_pubkey: Script::new(),
        amount: Some(1_000),
        asset: Some(policy()),
        ..Default::default()
    });

    assert_eq!(sdk.sign_pset(TEST_PASSWORD, &mut pset).unwrap(), 1);

    let account = AccountFactory::new(Arc::clone(sdk.repository()))
        .unwrap()
        .make(NETWORK, "vault")
        .unwrap();
    let key = account.derive_xonly_key(false, 0).unwrap();
    let expected_leaf = Builder::new()
        .push_slice(&key.serialize())
        .push_opcode(OP_CHECKSIG)
        .into_script();

    let signed_input = &pset.inputs()[0];
    assert_eq!(signed_input.tap_scripts.len(), 1);
    let (script, version) = signed_input.tap_scripts.values().next().unwrap();
    assert_eq!(script, &expected_leaf);

    let leaf_hash = TapLeafHash::from_script(script, *version);
    let sig = signed_input.tap_script_sigs.get(&(key, leaf_hash)).unwrap();
    assert_eq!(sig.hash_ty, SchnorrSighashType::All);

    let unsigned = pset.extract_tx().unwrap();
    let prevouts = vec![utxo.txout.clone()];
    let sighash = SighashCache::new(&unsigned)
        .taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            leaf_hash,
            SchnorrSighashType::All,
            NETWORK.genesis_hash(),
        )
        .unwrap();
    let msg = Message::from_digest(sighash.to_byte_array());
    Secp256k1::verification_only()
        .verify_schnorr(&sig.sig, &msg, &key)
        .unwrap();

    let tx = finalize_and_extract(pset).unwrap();
    let witness = &tx.input[0].witness.script_witness;
    assert_eq!(witness.len(), 3);
    assert_eq!(witness[1], expected_leaf.to_bytes());
}

#[test]
fn programmable_scripts_restore_from_json() {
    let chain = Arc::new(MockChainSource::new());
    let original = wallet_on(chain.clone());
    with_vault(&original);
    let addr = original
        .get_next_address("vault", Some(&vault_params()))
        .unwrap();
    chain.add_transaction(&funding_tx(3, vec![explicit_txout(policy(), 8_000, &addr.script)]), 1);

    let json = original.restoration_json("vault").unwrap();
    assert_eq!(json.entries.len(), 1);
    assert_eq!(json.entries[0].index, 0);
    assert!(!json.entries[0].is_change);

    let restored = wallet_on(chain.clone());
    with_vault(&restored);
    let result = restored.restore_account_from_json("vault", &json).unwrap();
    assert_eq!(result.next.external, 1);
    assert_eq!(result.txids.len(), 1);

    let details = restored
        .repository()
        .script_details(&addr.script)
        .unwrap()
        .unwrap();
    assert_eq!(details.account_name, "vault");
    assert_eq!(
        restored
            .balances(Some(&["vault".to_string()]))
            .unwrap()
            .get(&policy()),
        Some(&8_000)
    );
}

#[test]
fn restoration_at_the_last_index_is_rejected() {
    let chain = Arc::new(MockChainSource::new());
    let original = wallet_on(chain.clone());
    with_vault(&original);
    let addr = original
        .get_next_address("vault", Some(&vault_params()))
        .unwrap();
    let mut json = original.restoration_json("vault").unwrap();
    json.entries[0].index = u32::MAX;

    let restored = wallet_on(chain);
    with_vault(&restored);
    let err = restored.restore_account_from_json("vault", &json).unwrap_err();
    assert!(matches!(err, Error::Derivation(_)));
    assert!(restored
        .repository()
        .script_details(&addr.script)
        .unwrap()
        .is_none());
}
