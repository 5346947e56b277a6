use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use electrum_client::{ConfigBuilder, ElectrumApi, Param};
use lwk_wollet::elements::{Script, Txid};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};

/// A single entry returned by `get_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// Block height. -1 or 0 means unconfirmed (mempool), >0 means confirmed.
    pub height: i32,
}

/// A single entry returned by `list_unspents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnspentEntry {
    pub txid: Txid,
    pub vout: u32,
    pub height: i32,
}

/// Chain data source consumed by sync, the updater and the send flow.
pub trait ChainSource: Send + Sync {
    /// Raw hex of each requested transaction, in request order.
    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>>;

    fn list_unspents(&self, script: &Script) -> Result<Vec<UnspentEntry>>;

    /// Full transaction history for a script (confirmed + unconfirmed).
    fn get_history(&self, script: &Script) -> Result<Vec<HistoryEntry>>;

    /// Broadcast a raw transaction and return its txid.
    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid>;

    /// Minimum relay fee in BTC per kvB.
    fn get_relay_fee(&self) -> Result<f64>;

    /// Block until `script` has at least one transaction, or `timeout` lapses.
    fn wait_for_address_receives_tx(&self, script: &Script, timeout: Duration) -> Result<Txid> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.get_history(script)?.first() {
                return Ok(entry.txid);
            }
            if Instant::now() >= deadline {
                return Err(Error::Chain(format!(
                    "no transaction for {} within {timeout:?}",
                    hex::encode(script.as_bytes())
                )));
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Electrum script hash = SHA256(scriptPubKey) with reversed byte order.
pub fn electrum_script_hash(script: &Script) -> String {
    let mut hash = Sha256::digest(script.as_bytes()).to_vec();
    hash.reverse();
    hex::encode(&hash)
}

/// Electrum JSON-RPC chain source for Liquid.
pub struct ElectrumChainSource {
    electrum_url: String,
    timeout: Duration,
    closed: AtomicBool,
}

impl ElectrumChainSource {
    pub fn new(electrum_url: &str) -> Self {
        Self::with_timeout(electrum_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(electrum_url: &str, timeout: Duration) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    fn client(&self) -> Result<electrum_client::Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Electrum("chain source is closed".into()));
        }
        let secs = self.timeout.as_secs().clamp(1, u8::MAX as u64) as u8;
        let config = ConfigBuilder::new().timeout(Some(secs)).build();
        electrum_client::Client::from_config(&self.electrum_url, config)
            .map_err(|e| Error::Electrum(e.to_string()))
    }

    fn call(&self, method: &str, params: Vec<Param>) -> Result<Value> {
        self.client()?
            .raw_call(method, params)
            .map_err(|e| Error::Electrum(format!("{method}: {e}")))
    }
}

fn parse_txid(entry: &Value) -> Result<Txid> {
    let tx_hash_hex = entry["tx_hash"]
        .as_str()
        .ok_or_else(|| Error::Electrum("missing tx_hash".into()))?;
    tx_hash_hex
        .parse()
        .map_err(|e| Error::Electrum(format!("bad tx_hash: {e}")))
}

fn parse_height(entry: &Value) -> Result<i32> {
    Ok(entry["height"]
        .as_i64()
        .ok_or_else(|| Error::Electrum("missing height".into()))? as i32)
}

impl ChainSource for ElectrumChainSource {
    fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<String>> {
        let client = self.client()?;
        txids
            .iter()
            .map(|txid| {
                let resp = client
                    .raw_call(
                        "blockchain.transaction.get",
                        [Param::String(txid.to_string())],
                    )
                    .map_err(|e| Error::Electrum(format!("transaction.get {txid}: {e}")))?;
                resp.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::Query(format!("transaction {txid} not found")))
            })
            .collect()
    }

    fn list_unspents(&self, script: &Script) -> Result<Vec<UnspentEntry>> {
        let resp = self.call(
            "blockchain.scripthash.listunspent",
            vec![Param::String(electrum_script_hash(script))],
        )?;
        let entries = resp
            .as_array()
            .ok_or_else(|| Error::Electrum("expected array response".into()))?;

        entries
            .iter()
            .map(|entry| {
                let vout = entry["tx_pos"]
                    .as_u64()
                    .ok_or_else(|| Error::Electrum("missing tx_pos".into()))?
                    as u32;
                Ok(UnspentEntry {
                    txid: parse_txid(entry)?,
                    vout,
                    height: parse_height(entry)?,
                })
            })
            .collect()
    }

    fn get_history(&self, script: &Script) -> Result<Vec<HistoryEntry>> {
        let resp = self.call(
            "blockchain.scripthash.get_history",
            vec![Param::String(electrum_script_hash(script))],
        )?;
        let entries = resp
            .as_array()
            .ok_or_else(|| Error::Electrum("expected array response".into()))?;

        entries
            .iter()
            .map(|entry| {
                Ok(HistoryEntry {
                    txid: parse_txid(entry)?,
                    height: parse_height(entry)?,
                })
            })
            .collect()
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid> {
        let resp = self
            .call(
                "blockchain.transaction.broadcast",
                vec![Param::String(tx_hex.to_string())],
            )
            .map_err(|e| Error::Broadcast(e.to_string()))?;
        resp.as_str()
            .ok_or_else(|| Error::Broadcast(format!("unexpected response: {resp}")))?
            .parse()
            .map_err(|e| Error::Broadcast(format!("bad txid: {e}")))
    }

    fn get_relay_fee(&self) -> Result<f64> {
        let resp = self.call("blockchain.relayfee", vec![])?;
        resp.as_f64()
            .ok_or_else(|| Error::Electrum(format!("unexpected relayfee response: {resp}")))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_hash_is_reversed_sha256() {
        // Empty script: SHA256("") reversed.
        let hash = electrum_script_hash(&Script::new());
        assert_eq!(
            hash,
            "55b852781b9995a44c939b64e441ae2724b96f99c8f4fb9a141cfc9842c4b0e3"
        );
    }

    #[test]
    fn closed_source_rejects_calls() {
        let source = ElectrumChainSource::new("tcp://127.0.0.1:1");
        source.close().unwrap();
        assert!(matches!(
            source.get_history(&Script::new()),
            Err(Error::Electrum(_))
        ));
    }

    #[test]
    fn history_entry_parsing() {
        let entry = serde_json::json!({
            "tx_hash": "0101010101010101010101010101010101010101010101010101010101010101",
            "height": 12
        });
        assert_eq!(parse_height(&entry).unwrap(), 12);
        assert!(parse_txid(&entry).is_ok());
        assert!(parse_height(&serde_json::json!({})).is_err());
    }
}
