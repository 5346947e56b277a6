//! Unsigned, unblinded PSET construction: coin selection, change, and fees.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lwk_wollet::elements::pset::PartiallySignedTransaction;
use lwk_wollet::elements::{Address, AssetId, OutPoint};

use super::size::{estimate_fee, estimate_vsize, millisat_per_byte};
use super::{data_output, fee_output, new_pset, payment_output, wallet_input, without_output};
use crate::account::{AccountFactory, AddressResult, default_account_name};
use crate::chain::ChainSource;
use crate::coin_selection::{
    ChangeOutput, CoinSelectionResult, Target, merge_targets, select, total_value,
};
use crate::config::DEFAULT_LOCK_TTL;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::repository::WalletRepository;
use crate::taxi::{TaxiApi, TopupRequest, TopupResponse};
use crate::types::{DataRecipient, Recipient, UnblindedOutput, UnblindingData};

#[derive(Debug, Clone)]
pub struct PsetResult {
    pub pset: PartiallySignedTransaction,
    pub fee_amount: u64,
    /// Wallet outpoints spent, now locked.
    pub selected: Vec<OutPoint>,
}

#[derive(Debug, Clone)]
pub struct TaxiPsetResult {
    pub pset: PartiallySignedTransaction,
    pub topup: TopupResponse,
    pub selected: Vec<OutPoint>,
}

pub struct PsetBuilder {
    repo: Arc<WalletRepository>,
    accounts: Arc<AccountFactory>,
    chain: Arc<dyn ChainSource>,
    taxi: Option<Arc<dyn TaxiApi>>,
    network: Network,
    change_account: String,
    lock_ttl: Duration,
}

/// Running state of one build: what is spent and what must not be selected.
struct Selection {
    utxos: Vec<UnblindedOutput>,
    excluded: HashSet<OutPoint>,
    selected: Vec<OutPoint>,
}

impl Selection {
    fn take(&mut self, result: &CoinSelectionResult) {
        for utxo in &result.utxos {
            self.excluded.insert(utxo.outpoint);
            self.selected.push(utxo.outpoint);
        }
    }
}

impl PsetBuilder {
    pub fn new(
        repo: Arc<WalletRepository>,
        accounts: Arc<AccountFactory>,
        chain: Arc<dyn ChainSource>,
        network: Network,
    ) -> Self {
        Self {
            repo,
            accounts,
            chain,
            taxi: None,
            network,
            change_account: default_account_name(network).to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_taxi(mut self, taxi: Arc<dyn TaxiApi>) -> Self {
        self.taxi = Some(taxi);
        self
    }

    pub fn with_change_account(mut self, name: &str) -> Self {
        self.change_account = name.to_string();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    fn change_address(&self) -> Result<AddressResult> {
        self.accounts
            .make(self.network, &self.change_account)?
            .get_next_address(true, None)
    }

    fn start_selection(&self, accounts: Option<&[String]>) -> Result<Selection> {
        let excluded = self
            .repo
            .locked_outpoints()?
            .into_iter()
            .map(|l| l.outpoint)
            .collect();
        Ok(Selection {
            utxos: self.repo.utxos(self.network, accounts)?,
            excluded,
            selected: Vec::new(),
        })
    }

    /// Append change outputs to fresh internal addresses; returns the index of
    /// the fee-asset change output, if any.
    fn add_change(
        &self,
        pset: &mut PartiallySignedTransaction,
        change_outputs: &[ChangeOutput],
        blinder_index: u32,
    ) -> Result<Option<usize>> {
        let fee_asset = self.network.policy_asset();
        let mut fee_change = None;
        for change in change_outputs {
            let addr = self.change_address()?;
            if change.asset == fee_asset {
                fee_change = Some(pset.n_outputs());
            }
            pset.add_output(payment_output(
                addr.script,
                change.asset,
                change.amount,
                addr.address.blinding_pubkey,
                blinder_index,
            ));
        }
        Ok(fee_change)
    }

    fn add_recipients(
        pset: &mut PartiallySignedTransaction,
        recipients: &[Recipient],
        data: &[DataRecipient],
        blinder_index: u32,
    ) {
        for r in recipients {
            pset.add_output(payment_output(
                r.address.script_pubkey(),
                r.asset,
                r.value,
                r.address.blinding_pubkey,
                blinder_index,
            ));
        }
        for d in data {
            pset.add_output(data_output(&d.data, d.asset, d.value));
        }
    }

    fn targets(recipients: &[Recipient], data: &[DataRecipient]) -> Vec<Target> {
        merge_targets(
            recipients
                .iter()
                .map(|r| Target {
                    asset: r.asset,
                    amount: r.value,
                })
                .chain(data.iter().map(|d| Target {
                    asset: d.asset,
                    amount: d.value,
                })),
        )
    }

    /// Append the fee output, paying from the fee-asset change when it covers
    /// the fee, otherwise from a fee-asset re-selection whose change absorbs
    /// any growth of the estimate.
    fn pay_fee(
        &self,
        pset: &mut PartiallySignedTransaction,
        selection: &mut Selection,
        fee_change: Option<usize>,
        relay_fee: f64,
        blinder_index: u32,
    ) -> Result<u64> {
        let fee_asset = self.network.policy_asset();
        let fee = estimate_fee(pset, relay_fee);

        if let Some(i) = fee_change {
            let change = pset.outputs()[i].amount.unwrap_or(0);
            if change >= fee {
                if change == fee {
                    *pset = without_output(pset, i);
                } else {
                    pset.outputs_mut()[i].amount = Some(change - fee);
                }
                pset.add_output(fee_output(fee_asset, fee));
                return Ok(fee);
            }
        }

        let mut change_addr: Option<AddressResult> = None;
        let mut target = fee;
        loop {
            let extra = select(
                &selection.utxos,
                &[Target {
                    asset: fee_asset,
                    amount: target,
                }],
                &selection.excluded,
            )?;
            let total = total_value(&extra.utxos);
            let addr = match change_addr.take() {
                Some(addr) => addr,
                None => self.change_address()?,
            };

            let mut candidate = pset.clone();
            for utxo in &extra.utxos {
                candidate.add_input(wallet_input(utxo));
            }
            let with_change = {
                let mut p = candidate.clone();
                p.add_output(payment_output(
                    addr.script.clone(),
                    fee_asset,
                    0,
                    addr.address.blinding_pubkey,
                    blinder_index,
                ));
                p
            };
            let bare = estimate_fee(&candidate, relay_fee);
            let needed = estimate_fee(&with_change, relay_fee);

            // Leftovers too small to pay for their own change output go to the fee.
            let paid = if total > needed {
                candidate = with_change;
                let last = candidate.n_outputs() - 1;
                candidate.outputs_mut()[last].amount = Some(total - needed);
                needed
            } else if total >= bare {
                total
            } else {
                target = needed;
                change_addr = Some(addr);
                continue;
            };
            candidate.add_output(fee_output(fee_asset, paid));
            *pset = candidate;
            selection.take(&extra);
            log::debug!("pset: fee {paid} paid by {} extra inputs", extra.utxos.len());
            return Ok(paid);
        }
    }

    /// Pay `recipients` and `data` outputs from the wallet's unlocked outputs.
    pub fn create_regular_pset(
        &self,
        recipients: &[Recipient],
        data: &[DataRecipient],
        accounts: Option<&[String]>,
    ) -> Result<PsetResult> {
        let relay_fee = self.chain.get_relay_fee()?;
        let _guard = self.repo.selection_guard()?;

        let mut selection = self.start_selection(accounts)?;
        let result = select(
            &selection.utxos,
            &Self::targets(recipients, data),
            &selection.excluded,
        )?;
        selection.take(&result);

        let mut pset = new_pset();
        let blinder_index = 0;
        for utxo in &result.utxos {
            pset.add_input(wallet_input(utxo));
        }
        Self::add_recipients(&mut pset, recipients, data, blinder_index);
        let fee_change = self.add_change(&mut pset, &result.change_outputs, blinder_index)?;
        let fee_amount =
            self.pay_fee(&mut pset, &mut selection, fee_change, relay_fee, blinder_index)?;

        self.repo.lock_outpoints(&selection.selected, self.lock_ttl)?;
        log::info!(
            "pset: regular pset with {} inputs, {} outputs, fee {fee_amount}",
            pset.n_inputs(),
            pset.n_outputs()
        );
        Ok(PsetResult {
            pset,
            fee_amount,
            selected: selection.selected,
        })
    }

    /// Spend the whole unlocked balance of `asset` to `address`.
    pub fn create_send_all_pset(
        &self,
        address: &Address,
        asset: AssetId,
        accounts: Option<&[String]>,
    ) -> Result<PsetResult> {
        let relay_fee = self.chain.get_relay_fee()?;
        let _guard = self.repo.selection_guard()?;

        let mut selection = self.start_selection(accounts)?;
        let spendable: Vec<UnblindedOutput> = selection
            .utxos
            .iter()
            .filter(|u| !selection.excluded.contains(&u.outpoint) && u.asset() == Some(asset))
            .cloned()
            .collect();
        let total = total_value(&spendable);
        if spendable.is_empty() {
            return Err(Error::CoinSelection {
                target: Target { asset, amount: 1 },
                selected_amount: 0,
            });
        }
        selection.take(&CoinSelectionResult {
            utxos: spendable.clone(),
            change_outputs: Vec::new(),
        });

        let mut pset = new_pset();
        for utxo in &spendable {
            pset.add_input(wallet_input(utxo));
        }
        pset.add_output(payment_output(
            address.script_pubkey(),
            asset,
            total,
            address.blinding_pubkey,
            0,
        ));

        let fee_asset = self.network.policy_asset();
        let fee_amount = if asset == fee_asset {
            let fee = estimate_fee(&pset, relay_fee);
            if total <= fee {
                return Err(Error::CoinSelection {
                    target: Target {
                        asset,
                        amount: fee + 1,
                    },
                    selected_amount: total,
                });
            }
            pset.outputs_mut()[0].amount = Some(total - fee);
            pset.add_output(fee_output(fee_asset, fee));
            fee
        } else {
            self.pay_fee(&mut pset, &mut selection, None, relay_fee, 0)?
        };

        self.repo.lock_outpoints(&selection.selected, self.lock_ttl)?;
        log::info!("pset: send-all of {total} {asset}, fee {fee_amount}");
        Ok(PsetResult {
            pset,
            fee_amount,
            selected: selection.selected,
        })
    }

    /// Let the fee-sponsorship service pay the network fee in exchange for
    /// `taxi_asset`, merging the wallet's inputs and outputs on top of the
    /// sponsor's partial PSET.
    pub fn create_taxi_pset(
        &self,
        taxi_asset: AssetId,
        recipients: &[Recipient],
        data: &[DataRecipient],
        accounts: Option<&[String]>,
    ) -> Result<TaxiPsetResult> {
        let taxi = self
            .taxi
            .as_ref()
            .ok_or_else(|| Error::Taxi("no fee-sponsorship service configured".into()))?;
        let relay_fee = self.chain.get_relay_fee()?;
        let _guard = self.repo.selection_guard()?;

        let mut selection = self.start_selection(accounts)?;
        let targets = Self::targets(recipients, data);

        let provisional = select(&selection.utxos, &targets, &selection.excluded)?;
        let mut shape = new_pset();
        for utxo in &provisional.utxos {
            shape.add_input(wallet_input(utxo));
        }
        Self::add_recipients(&mut shape, recipients, data, 0);

        let topup = taxi.topup(&TopupRequest {
            asset_hash: taxi_asset,
            estimated_tx_size: estimate_vsize(&shape),
            millisat_per_byte: millisat_per_byte(relay_fee),
        })?;
        let mut pset = topup.partial_pset()?;
        if topup.in_blinding_data.len() != pset.n_inputs() {
            return Err(Error::Pset(format!(
                "sponsor sent blinding data for {} of {} inputs",
                topup.in_blinding_data.len(),
                pset.n_inputs()
            )));
        }

        let mut all_targets = targets;
        all_targets.push(Target {
            asset: taxi_asset,
            amount: topup.asset_amount,
        });
        let result = select(
            &selection.utxos,
            &merge_targets(all_targets),
            &selection.excluded,
        )?;
        selection.take(&result);

        let sponsor_data: Vec<(OutPoint, UnblindingData)> = pset
            .inputs()
            .iter()
            .zip(topup.in_blinding_data.iter())
            .map(|(input, data)| {
                (
                    OutPoint::new(input.previous_txid, input.previous_output_index),
                    UnblindingData::from(*data),
                )
            })
            .collect();

        let blinder_index = u32::try_from(pset.n_inputs())
            .map_err(|_| Error::Pset("too many sponsor inputs".into()))?;
        for utxo in &result.utxos {
            pset.add_input(wallet_input(utxo));
        }
        Self::add_recipients(&mut pset, recipients, data, blinder_index);
        self.add_change(&mut pset, &result.change_outputs, blinder_index)?;

        self.repo.update_outpoint_blinding_data(&sponsor_data)?;
        self.repo.lock_outpoints(&selection.selected, self.lock_ttl)?;
        log::info!(
            "pset: taxi pset {} pays {} of {taxi_asset}",
            topup.topup.topup_id,
            topup.asset_amount
        );
        Ok(TaxiPsetResult {
            pset,
            topup,
            selected: selection.selected,
        })
    }
}
