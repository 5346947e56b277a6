use lwk_wollet::elements::{AssetId, OutPoint, Txid};

use crate::network::Network;

/// Events published by the `WalletRepository` after each committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// An account was created or its indexes moved.
    AccountUpdated { name: String },
    /// A new wallet script was persisted.
    ScriptAdded { network: Network, script: String },
    /// A transaction id was recorded for the network.
    TransactionAdded { network: Network, txid: Txid },
    /// A wallet output became spendable.
    UtxoAdded { network: Network, outpoint: OutPoint },
    /// A wallet output was spent by an observed transaction.
    UtxoSpent { network: Network, outpoint: OutPoint },
    /// Asset metadata was stored for the first time.
    AssetAdded { asset: AssetId },
    OutpointsLocked(Vec<OutPoint>),
    OutpointsUnlocked(Vec<OutPoint>),
    /// Every entry was wiped.
    Reset,
}
