use std::collections::HashSet;
use std::fmt;

use lwk_wollet::elements::{AssetId, OutPoint};

use crate::error::{Error, Result};
use crate::types::UnblindedOutput;

/// Amount of one asset the selection must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub asset: AssetId,
    pub amount: u64,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.amount, self.asset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeOutput {
    pub asset: AssetId,
    pub amount: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinSelectionResult {
    pub utxos: Vec<UnblindedOutput>,
    pub change_outputs: Vec<ChangeOutput>,
}

impl CoinSelectionResult {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(|u| u.outpoint).collect()
    }

    pub fn change_for(&self, asset: &AssetId) -> Option<&ChangeOutput> {
        self.change_outputs.iter().find(|c| &c.asset == asset)
    }

    pub fn extend(&mut self, other: CoinSelectionResult) {
        self.utxos.extend(other.utxos);
        self.change_outputs.extend(other.change_outputs);
    }
}

/// Sum of the known values of `utxos`, saturating at `u64::MAX`.
pub fn total_value(utxos: &[UnblindedOutput]) -> u64 {
    utxos
        .iter()
        .filter_map(UnblindedOutput::value)
        .fold(0, u64::saturating_add)
}

/// Merge targets sharing an asset, keeping first-seen order.
pub fn merge_targets(targets: impl IntoIterator<Item = Target>) -> Vec<Target> {
    let mut merged: Vec<Target> = Vec::new();
    for target in targets {
        match merged.iter_mut().find(|t| t.asset == target.asset) {
            Some(t) => t.amount = t.amount.saturating_add(target.amount),
            None => merged.push(target),
        }
    }
    merged
}

/// Largest-first selection per target asset.
///
/// Only unblinded outputs are candidates; anything in `excluded` (locked or
/// already selected) is skipped.
pub fn select(
    utxos: &[UnblindedOutput],
    targets: &[Target],
    excluded: &HashSet<OutPoint>,
) -> Result<CoinSelectionResult> {
    let mut result = CoinSelectionResult::default();

    for target in targets {
        if target.amount == 0 {
            continue;
        }
        let mut candidates: Vec<(&UnblindedOutput, u64)> = utxos
            .iter()
            .filter(|u| !excluded.contains(&u.outpoint))
            .filter_map(|u| match u.blinding_data {
                Some(d) if d.asset == target.asset => Some((u, d.value)),
                _ => None,
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.outpoint.txid.cmp(&b.0.outpoint.txid)));

        let mut selected_amount = 0u64;
        for (utxo, value) in candidates {
            if selected_amount >= target.amount {
                break;
            }
            selected_amount = selected_amount.saturating_add(value);
            result.utxos.push(utxo.clone());
        }

        if selected_amount < target.amount {
            return Err(Error::CoinSelection {
                target: *target,
                selected_amount,
            });
        }
        if selected_amount > target.amount {
            result.change_outputs.push(ChangeOutput {
                asset: target.asset,
                amount: selected_amount - target.amount,
            });
        }
    }

    Ok(result)
}
