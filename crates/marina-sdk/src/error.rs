use thiserror::Error;

use crate::coin_selection::Target;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid password")]
    InvalidPassword,

    #[error("not enough funds to cover {target} (selected {selected_amount})")]
    CoinSelection { target: Target, selected_amount: u64 },

    #[error("script decode error: {0}")]
    ScriptDecode(String),

    #[error("opcode at position {0} lacks its required operand")]
    InvalidScriptPosition(usize),

    #[error("account {0} cannot be synced by index, restore it from its descriptor instead")]
    AccountSyncUnsupported(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("account {0} is not active on network {1}")]
    AccountNetwork(String, &'static str),

    #[error("unsupported account type for {0}")]
    UnsupportedAccountType(String),

    #[error("key derivation error: {0}")]
    Derivation(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("mnemonic error: {0}")]
    Mnemonic(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("electrum error: {0}")]
    Electrum(String),

    #[error("chain source error: {0}")]
    Chain(String),

    #[error("broadcast error: {0}")]
    Broadcast(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("taxi error: {0}")]
    Taxi(String),

    #[error("blinding error: {0}")]
    Blinding(String),

    #[error("output {0} is only partially blinded")]
    PartialBlinding(usize),

    #[error("unblind error: {0}")]
    Unblind(String),

    #[error("PSET construction error: {0}")]
    Pset(String),

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("invalid restoration data: {0}")]
    Restoration(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("internal mutex poisoned by a prior panic")]
    MutexPoisoned,
}

pub type Result<T> = std::result::Result<T, Error>;
