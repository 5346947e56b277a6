use std::sync::Arc;

use lwk_wollet::elements::{Address, AddressParams};
use marina_lib::{WalletError, WalletManager, WalletStatus};
use marina_sdk::account::MAIN_ACCOUNT_TEST;
use marina_sdk::testing::{
    MockChainSource, TEST_MNEMONIC, TEST_PASSWORD, explicit_txout, funding_tx,
};
use marina_sdk::{MarinaSdk, MemoryStore, Network, WalletConfig};

// ==================== Test Helpers ====================

const NETWORK: Network = Network::LiquidRegtest;

fn manager() -> (WalletManager, Arc<MockChainSource>) {
    let chain = Arc::new(MockChainSource::new());
    let sdk = MarinaSdk::new(
        WalletConfig::for_network(NETWORK),
        Arc::new(MemoryStore::new()),
        chain.clone(),
        None,
    );
    (WalletManager::with_sdk(sdk), chain)
}

/// Restored wallet holding one `amount` L-BTC output on its first address.
fn funded(amount: u64) -> (WalletManager, Arc<MockChainSource>) {
    let (mut wallet, chain) = manager();
    let target = {
        let (twin, _) = manager();
        twin.sdk().initialize(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
        twin
            .sdk()
            .get_next_address(MAIN_ACCOUNT_TEST, None)
            .unwrap()
            .script
    };
    chain.add_transaction(
        &funding_tx(1, vec![explicit_txout(NETWORK.policy_asset(), amount, &target)]),
        1,
    );
    wallet.restore_wallet(TEST_MNEMONIC, TEST_PASSWORD).unwrap();
    (wallet, chain)
}

// ==================== Lifecycle ====================

#[test]
fn status_follows_create_lock_unlock() {
    let (mut wallet, _) = manager();
    assert_eq!(wallet.status().unwrap(), WalletStatus::NotCreated);

    let phrase = wallet.create_wallet(TEST_PASSWORD).unwrap();
    assert_eq!(phrase.split_whitespace().count(), 12);
    assert_eq!(wallet.status().unwrap(), WalletStatus::Unlocked);

    wallet.lock();
    assert_eq!(wallet.status().unwrap(), WalletStatus::Locked);
    assert!(matches!(wallet.address(), Err(WalletError::NotUnlocked)));

    assert!(matches!(
        wallet.unlock("not the password"),
        Err(WalletError::WrongPassword)
    ));
    assert_eq!(wallet.status().unwrap(), WalletStatus::Locked);

    wallet.unlock(TEST_PASSWORD).unwrap();
    assert_eq!(wallet.status().unwrap(), WalletStatus::Unlocked);
}

#[test]
fn second_wallet_is_rejected() {
    let (mut wallet, _) = manager();
    wallet.create_wallet(TEST_PASSWORD).unwrap();
    assert!(matches!(
        wallet.create_wallet(TEST_PASSWORD),
        Err(WalletError::AlreadyExists)
    ));
    assert!(matches!(
        wallet.restore_wallet(TEST_MNEMONIC, TEST_PASSWORD),
        Err(WalletError::AlreadyExists)
    ));
}

#[test]
fn invalid_mnemonic_is_reported() {
    let (mut wallet, _) = manager();
    assert!(matches!(
        wallet.restore_wallet("not a real phrase", TEST_PASSWORD),
        Err(WalletError::InvalidMnemonic)
    ));
    assert_eq!(wallet.status().unwrap(), WalletStatus::NotCreated);
}

// ==================== Funds ====================

#[test]
fn restore_discovers_funds() {
    let (wallet, _) = funded(40_000);
    let balance = wallet.balance().unwrap();
    assert_eq!(balance.assets.get(&wallet.policy_asset_id()), Some(&40_000));

    let utxos = wallet.utxos().unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].value, 40_000);

    assert_eq!(wallet.address().unwrap().index, 1);
}

#[test]
fn send_lbtc_broadcasts() {
    let (mut wallet, chain) = funded(100_000);
    let dest = wallet.address().unwrap().address;

    let sent = wallet.send_lbtc(&dest, 25_000).unwrap();
    assert!(sent.fee_sat > 0);
    assert_eq!(chain.broadcasted().len(), 1);
    assert_eq!(chain.broadcasted()[0].to_string(), sent.txid);
    assert!(wallet.sdk().repository().locked_outpoints().unwrap().is_empty());
}

#[test]
fn send_all_sweeps_balance() {
    let (mut wallet, chain) = funded(100_000);
    let dest = wallet.address().unwrap().address;

    let sent = wallet.send_all(&dest).unwrap();
    assert_eq!(chain.broadcasted().len(), 1);
    assert!(wallet.sdk().repository().locked_outpoints().unwrap().is_empty());

    let balance = wallet.balance().unwrap();
    assert_eq!(
        balance.assets.get(&wallet.policy_asset_id()),
        Some(&(100_000 - sent.fee_sat))
    );
}

#[test]
fn sending_requires_unlock() {
    let (mut wallet, chain) = funded(100_000);
    let dest = wallet.address().unwrap().address;
    wallet.lock();

    assert!(matches!(
        wallet.send_lbtc(&dest, 1_000),
        Err(WalletError::NotUnlocked)
    ));
    assert!(chain.broadcasted().is_empty());
}

#[test]
fn foreign_network_address_is_rejected() {
    let (mut wallet, _) = funded(100_000);
    let regtest: Address = wallet.address().unwrap().address.parse().unwrap();
    let mainnet = Address {
        params: &AddressParams::LIQUID,
        ..regtest
    };

    assert!(matches!(
        wallet.send_lbtc(&mainnet.to_string(), 1_000),
        Err(WalletError::InvalidAddress(_))
    ));
    assert!(matches!(
        wallet.send_lbtc("definitely-not-an-address", 1_000),
        Err(WalletError::InvalidAddress(_))
    ));
}

#[test]
fn failed_sweep_unlocks_its_outputs() {
    let (mut wallet, chain) = funded(100_000);
    let dest = wallet.address().unwrap().address;

    chain.set_rejecting_broadcasts(true);
    assert!(matches!(wallet.send_all(&dest), Err(WalletError::Sdk(_))));
    assert!(wallet.sdk().repository().locked_outpoints().unwrap().is_empty());

    chain.set_rejecting_broadcasts(false);
    wallet.send_all(&dest).unwrap();
    assert_eq!(chain.broadcasted().len(), 1);
}
